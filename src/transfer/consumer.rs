//! Settlement Consumer
//!
//! Applies transfer-initiated events through the journal engine and moves the
//! transfer to its terminal state. Deliveries are at-least-once; the journal
//! reference makes reprocessing a no-op.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::error::TransferError;
use super::events::{Ack, EventHandler};
use super::repository::TransferRepository;
use super::state::TransferState;
use super::types::TransferInitiated;
use crate::ledger::{EntryStatus, JournalEngine, JournalEntry, LedgerError, PostingLine};

/// States from which settlement may conclude a transfer
const SETTLEABLE: [TransferState; 2] = [TransferState::Validated, TransferState::EventPublished];

pub struct SettlementConsumer {
    engine: Arc<JournalEngine>,
    transfers: Arc<dyn TransferRepository>,
    apply_timeout: Duration,
}

impl SettlementConsumer {
    pub fn new(
        engine: Arc<JournalEngine>,
        transfers: Arc<dyn TransferRepository>,
        apply_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            transfers,
            apply_timeout,
        }
    }

    /// Process one event. `Ok` means acknowledge; `Err` means redeliver.
    pub async fn process(&self, event: &TransferInitiated) -> Result<(), TransferError> {
        match self.engine.find_entry(&event.reference_id).await {
            Ok(Some(entry)) if entry.status.is_terminal() => {
                debug!(reference = %event.reference_id, status = %entry.status, "Duplicate delivery, entry already final");
                return self.sync_transfer(event, &entry).await;
            }
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        if event.amount <= 0 {
            error!(reference = %event.reference_id, amount = event.amount, "Event with non-positive amount");
            return self
                .mark_failed(event, "invalid amount")
                .await;
        }

        let lines = [
            PostingLine::debit(event.source_account, event.amount),
            PostingLine::credit(event.destination_account, event.amount),
        ];
        let deadline = Instant::now() + self.apply_timeout;

        match self
            .engine
            .create_journal_entry(event.reference_id.clone(), &lines, deadline)
            .await
        {
            Ok(entry) => self.sync_transfer(event, &entry).await,
            Err(LedgerError::EntryFailed { reason, .. }) => self.mark_failed(event, &reason).await,
            Err(e) if e.is_business_rejection() => self.mark_failed(event, &e.to_string()).await,
            Err(e) if e.is_invalid_entry() => {
                error!(reference = %event.reference_id, error = %e, "Event produced an invalid journal entry");
                self.mark_failed(event, &e.to_string()).await
            }
            Err(e) => {
                warn!(reference = %event.reference_id, error = %e, "Settlement attempt failed, will retry");
                Err(e.into())
            }
        }
    }

    /// Bring the transfer in line with a final journal entry
    pub(crate) async fn sync_transfer(
        &self,
        event: &TransferInitiated,
        entry: &JournalEntry,
    ) -> Result<(), TransferError> {
        match entry.status {
            EntryStatus::Posted => self.mark_settled(event).await,
            EntryStatus::Failed => {
                let reason = entry.failure_reason.clone().unwrap_or_default();
                self.mark_failed(event, &reason).await
            }
            EntryStatus::Pending => Err(TransferError::SystemError(format!(
                "entry {} still pending",
                entry.reference_id
            ))),
        }
    }

    async fn mark_settled(&self, event: &TransferInitiated) -> Result<(), TransferError> {
        let moved = self
            .transfers
            .update_state_if(event.transfer_id, &SETTLEABLE, TransferState::Settled)
            .await?;
        if moved {
            info!(transfer_id = %event.transfer_id, amount = event.amount, "Transfer settled");
        } else {
            self.log_unmoved(event, TransferState::Settled).await?;
        }
        Ok(())
    }

    async fn mark_failed(&self, event: &TransferInitiated, reason: &str) -> Result<(), TransferError> {
        let moved = self
            .transfers
            .update_state_with_error(event.transfer_id, &SETTLEABLE, TransferState::Failed, reason)
            .await?;
        if moved {
            info!(transfer_id = %event.transfer_id, reason = %reason, "Transfer failed");
        } else {
            self.log_unmoved(event, TransferState::Failed).await?;
        }
        Ok(())
    }

    async fn log_unmoved(
        &self,
        event: &TransferInitiated,
        wanted: TransferState,
    ) -> Result<(), TransferError> {
        match self.transfers.get(event.transfer_id).await? {
            Some(current) if current.state == wanted => Ok(()),
            Some(current)
                if current.state == TransferState::Rejected && wanted == TransferState::Failed =>
            {
                debug!(transfer_id = %event.transfer_id, "Event for abandoned transfer");
                Ok(())
            }
            Some(current) => {
                error!(
                    transfer_id = %event.transfer_id,
                    current = %current.state,
                    wanted = %wanted,
                    "Journal outcome disagrees with transfer state"
                );
                Ok(())
            }
            None => {
                error!(transfer_id = %event.transfer_id, "Event for unknown transfer");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl EventHandler for SettlementConsumer {
    async fn handle(&self, event: &TransferInitiated, attempt: u32) -> Ack {
        match self.process(event).await {
            Ok(()) => Ack::Ack,
            Err(e) => {
                warn!(
                    reference = %event.reference_id,
                    attempt = attempt,
                    error = %e,
                    "Event processing failed"
                );
                Ack::Nack
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{AccountId, TransferId};
    use crate::ledger::journal::tests::ContendedStore;
    use crate::ledger::{AccountStore, InMemoryAccountStore, NewAccount, RetryPolicy};
    use std::sync::atomic::Ordering;
    use crate::transfer::repository::InMemoryTransferRepository;
    use crate::transfer::repository::tests::new_record;
    use crate::transfer::types::TransferRecord;

    struct Fixture {
        consumer: SettlementConsumer,
        store: Arc<dyn AccountStore>,
        transfers: Arc<dyn TransferRepository>,
    }

    async fn fixture() -> Fixture {
        fixture_on(Arc::new(InMemoryAccountStore::new())).await
    }

    async fn fixture_on(store: Arc<dyn AccountStore>) -> Fixture {
        let engine = Arc::new(JournalEngine::new(
            store.clone(),
            RetryPolicy {
                max_attempts: 4,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
        ));
        let transfers: Arc<dyn TransferRepository> = Arc::new(InMemoryTransferRepository::new());
        Fixture {
            consumer: SettlementConsumer::new(engine, transfers.clone(), Duration::from_secs(5)),
            store,
            transfers,
        }
    }

    async fn funded_transfer(f: &Fixture, balance: i64, amount: i64) -> TransferRecord {
        let mint = f
            .store
            .open_account(NewAccount::new(0, "USD").with_overdraft())
            .await
            .unwrap();
        let source = f.store.open_account(NewAccount::new(1, "USD")).await.unwrap();
        let dest = f.store.open_account(NewAccount::new(2, "USD")).await.unwrap();
        f.consumer
            .engine
            .create_journal_entry(
                crate::core_types::ReferenceId::new(format!("seed-{}", source.id)),
                &[PostingLine::debit(mint.id, balance), PostingLine::credit(source.id, balance)],
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap();

        let mut record = new_record(1, &TransferId::new().to_string());
        record.source_account = source.id;
        record.destination_account = dest.id;
        record.amount = amount;
        record.state = TransferState::EventPublished;
        f.transfers.create(&record).await.unwrap()
    }

    async fn state_of(f: &Fixture, record: &TransferRecord) -> TransferState {
        f.transfers.get(record.transfer_id).await.unwrap().unwrap().state
    }

    #[tokio::test]
    async fn test_event_settles_transfer() {
        let f = fixture().await;
        let record = funded_transfer(&f, 10_000, 3_000).await;

        assert_eq!(f.consumer.handle(&record.event(), 1).await, Ack::Ack);
        assert_eq!(state_of(&f, &record).await, TransferState::Settled);
        let source = f.store.get_account(record.source_account).await.unwrap();
        assert_eq!(source.cached_balance, 7_000);
    }

    #[tokio::test]
    async fn test_redelivery_posts_once() {
        let f = fixture().await;
        let record = funded_transfer(&f, 10_000, 3_000).await;
        let event = record.event();

        assert_eq!(f.consumer.handle(&event, 1).await, Ack::Ack);
        assert_eq!(f.consumer.handle(&event, 2).await, Ack::Ack);

        let dest = f.store.get_account(record.destination_account).await.unwrap();
        assert_eq!(dest.cached_balance, 3_000);
        let (_, postings) = f.store.account_with_postings(record.destination_account).await.unwrap();
        assert_eq!(postings.len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_funds_marks_failed_and_acks() {
        let f = fixture().await;
        let record = funded_transfer(&f, 10_000, 15_000).await;

        assert_eq!(f.consumer.handle(&record.event(), 1).await, Ack::Ack);
        let stored = f.transfers.get(record.transfer_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Failed);
        assert!(stored.failure_reason.unwrap().contains("Insufficient funds"));

        // Redelivery is acknowledged without touching balances
        assert_eq!(f.consumer.handle(&record.event(), 2).await, Ack::Ack);
        let source = f.store.get_account(record.source_account).await.unwrap();
        assert_eq!(source.cached_balance, 10_000);
    }

    #[tokio::test]
    async fn test_settles_before_publisher_records_publication() {
        let f = fixture().await;
        let mut record = funded_transfer(&f, 10_000, 1_000).await;
        record.transfer_id = TransferId::new();
        record.idempotency_key = "early".to_string();
        record.state = TransferState::Validated;
        let record = f.transfers.create(&record).await.unwrap();

        assert_eq!(f.consumer.handle(&record.event(), 1).await, Ack::Ack);
        assert_eq!(state_of(&f, &record).await, TransferState::Settled);
    }

    #[tokio::test]
    async fn test_exhausted_conflicts_nack_and_leave_transfer_open() {
        let store = Arc::new(ContendedStore::default());
        let f = fixture_on(store.clone()).await;
        let record = funded_transfer(&f, 10_000, 3_000).await;
        store.contended.store(true, Ordering::SeqCst);

        assert_eq!(f.consumer.handle(&record.event(), 1).await, Ack::Nack);
        assert_eq!(state_of(&f, &record).await, TransferState::EventPublished);
        assert!(f.consumer.engine.find_entry(&record.reference_id()).await.unwrap().is_none());
        let source = f.store.get_account(record.source_account).await.unwrap();
        assert_eq!(source.cached_balance, 10_000);

        // Once contention clears the redelivery settles
        store.contended.store(false, Ordering::SeqCst);
        assert_eq!(f.consumer.handle(&record.event(), 2).await, Ack::Ack);
        assert_eq!(state_of(&f, &record).await, TransferState::Settled);
    }

    #[tokio::test]
    async fn test_unknown_account_fails_transfer() {
        let f = fixture().await;
        let mut record = funded_transfer(&f, 10_000, 1_000).await;
        record.destination_account = AccountId::new();

        assert_eq!(f.consumer.handle(&record.event(), 1).await, Ack::Ack);
        assert_eq!(state_of(&f, &record).await, TransferState::Failed);
    }
}
