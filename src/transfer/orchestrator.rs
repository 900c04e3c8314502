//! Transfer Orchestrator
//!
//! Validates and authorizes a transfer request, persists it under
//! idempotency protection and publishes the transfer-initiated event.
//! The caller is answered at EVENT_PUBLISHED: accepted, not yet settled.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::TransferError;
use super::events::EventPublisher;
use super::repository::TransferRepository;
use super::state::TransferState;
use super::types::{TransferReceipt, TransferRecord, TransferRequest};
use crate::config::TransferConfig;
use crate::core_types::{AccountId, TransferId, UserId};
use crate::gateway::response::{error_body, success_body};
use crate::idempotency::{
    BeginOutcome, IdempotencyLayer, ScopedKey, StoredResponse, request_hash,
};
use crate::ledger::{Account, AccountStatus, AccountStore, LedgerError};
use crate::money::{CurrencyTable, parse_decimal};

pub const MAX_DESCRIPTION_LEN: usize = 256;

/// Outcome of a submission
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Executed now; transfer persisted and event published
    Accepted(TransferReceipt),
    /// Same key and request seen before; cached outcome
    Replayed(StoredResponse),
}

/// Validated transfer, before persistence
struct ValidTransfer {
    source: Account,
    destination: Account,
    amount: i64,
    currency: String,
}

pub struct TransferOrchestrator {
    accounts: Arc<dyn AccountStore>,
    transfers: Arc<dyn TransferRepository>,
    idempotency: Arc<IdempotencyLayer>,
    publisher: Arc<dyn EventPublisher>,
    currencies: CurrencyTable,
    publish_max_attempts: u32,
    publish_backoff: Duration,
}

impl TransferOrchestrator {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        transfers: Arc<dyn TransferRepository>,
        idempotency: Arc<IdempotencyLayer>,
        publisher: Arc<dyn EventPublisher>,
        currencies: CurrencyTable,
        config: &TransferConfig,
    ) -> Self {
        Self {
            accounts,
            transfers,
            idempotency,
            publisher,
            currencies,
            publish_max_attempts: config.publish_max_attempts.max(1),
            publish_backoff: config.publish_backoff(),
        }
    }

    pub fn currencies(&self) -> &CurrencyTable {
        &self.currencies
    }

    /// Submit a transfer on behalf of `caller`
    pub async fn submit(
        &self,
        caller: UserId,
        idempotency_key: &str,
        request: TransferRequest,
    ) -> Result<Submission, TransferError> {
        let key = ScopedKey::new(caller, idempotency_key)?;
        let hash = request_hash(&request)?;

        match self.idempotency.begin(&key, &hash).await? {
            BeginOutcome::Proceed => {}
            BeginOutcome::Replay(stored) => {
                debug!(caller = caller, key = %key.key, status = stored.status, "Replaying cached outcome");
                return Ok(Submission::Replayed(stored));
            }
            BeginOutcome::Conflict => return Err(TransferError::IdempotencyKeyConflict),
            BeginOutcome::InFlight => return Err(TransferError::RequestInFlight),
        }

        let outcome = self.execute(caller, &key, &hash, request).await;

        // The key belongs to the persisted transfer's request, not this one
        if matches!(outcome, Err(TransferError::IdempotencyKeyConflict)) {
            if let Err(e) = self.idempotency.release(&key).await {
                warn!(caller = caller, key = %key.key, error = %e, "Failed to release idempotency key");
            }
            return Err(TransferError::IdempotencyKeyConflict);
        }

        let stored = match &outcome {
            Ok(receipt) => StoredResponse {
                status: 202,
                body: success_body(receipt),
            },
            Err(e) => StoredResponse {
                status: e.http_status(),
                body: error_body(e),
            },
        };
        if let Err(e) = self.idempotency.complete(&key, &stored).await {
            // The transfer row is keyed by (caller, key) too, so a retry still
            // resolves to the same transfer once the lease lapses
            warn!(caller = caller, key = %key.key, error = %e, "Failed to record idempotent outcome");
        }

        outcome.map(Submission::Accepted)
    }

    async fn execute(
        &self,
        caller: UserId,
        key: &ScopedKey,
        hash: &str,
        request: TransferRequest,
    ) -> Result<TransferReceipt, TransferError> {
        let decimals = self.currencies.decimals(&request.currency)?;

        // A retry after a transient failure resumes the transfer already persisted
        let record = match self.transfers.get_by_key(caller, &key.key).await? {
            Some(existing) if existing.request_hash != hash => {
                warn!(transfer_id = %existing.transfer_id, caller = caller, key = %key.key, "Idempotency key reused with a different request");
                return Err(TransferError::IdempotencyKeyConflict);
            }
            Some(existing) => {
                debug!(transfer_id = %existing.transfer_id, state = %existing.state, "Resuming transfer for idempotency key");
                existing
            }
            None => {
                let valid = self.validate(caller, &request).await?;
                let now = chrono::Utc::now();
                let record = TransferRecord {
                    transfer_id: TransferId::new(),
                    caller,
                    idempotency_key: key.key.clone(),
                    request_hash: hash.to_string(),
                    source_account: valid.source.id,
                    destination_account: valid.destination.id,
                    amount: valid.amount,
                    currency: valid.currency,
                    description: request.description,
                    state: TransferState::Validated,
                    failure_reason: None,
                    created_at: now,
                    updated_at: now,
                };
                let record = self.transfers.create(&record).await?;
                info!(
                    transfer_id = %record.transfer_id,
                    caller = caller,
                    amount = record.amount,
                    currency = %record.currency,
                    "Transfer validated"
                );
                record
            }
        };

        let record = if record.state == TransferState::Validated {
            self.publish(record).await?
        } else {
            record
        };

        Ok(TransferReceipt::from_record(&record, decimals))
    }

    /// RECEIVED -> VALIDATED checks. Nothing is written here.
    async fn validate(
        &self,
        caller: UserId,
        request: &TransferRequest,
    ) -> Result<ValidTransfer, TransferError> {
        let currency = request.currency.to_ascii_uppercase();
        let decimals = self.currencies.decimals(&currency)?;
        let amount = parse_decimal(request.amount.inner(), decimals)?;

        if request.source_account == request.destination_account {
            return Err(TransferError::SameAccount);
        }
        if request
            .description
            .as_ref()
            .is_some_and(|d| d.chars().count() > MAX_DESCRIPTION_LEN)
        {
            return Err(TransferError::InvalidRequest(format!(
                "description longer than {} characters",
                MAX_DESCRIPTION_LEN
            )));
        }

        // Ownership before anything else about the source; an unknown source
        // is indistinguishable from someone else's
        let source = match self.accounts.get_account(request.source_account).await {
            Ok(account) if account.owner == caller => account,
            Ok(_) | Err(LedgerError::AccountNotFound(_)) => {
                warn!(caller = caller, source = %request.source_account, "Transfer from account not owned by caller");
                return Err(TransferError::Forbidden);
            }
            Err(e) => return Err(e.into()),
        };
        let destination = match self.accounts.get_account(request.destination_account).await {
            Ok(account) => account,
            Err(LedgerError::AccountNotFound(_)) => return Err(TransferError::DestinationNotFound),
            Err(e) => return Err(e.into()),
        };

        for account in [&source, &destination] {
            if account.currency != currency {
                return Err(TransferError::CurrencyMismatch {
                    account: account.currency.clone(),
                    requested: currency,
                });
            }
            if account.status != AccountStatus::Active {
                return Err(TransferError::AccountNotActive(account.status));
            }
        }

        Ok(ValidTransfer {
            source,
            destination,
            amount,
            currency,
        })
    }

    /// VALIDATED -> EVENT_PUBLISHED, with bounded publish retries
    async fn publish(&self, record: TransferRecord) -> Result<TransferRecord, TransferError> {
        let event = record.event();
        let mut last_error = None;

        for attempt in 1..=self.publish_max_attempts {
            match self.publisher.publish(&event).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!(
                        transfer_id = %record.transfer_id,
                        attempt = attempt,
                        error = %e,
                        "Event publish failed"
                    );
                    last_error = Some(e);
                    if attempt < self.publish_max_attempts {
                        tokio::time::sleep(self.publish_backoff * attempt).await;
                    }
                }
            }
        }
        if let Some(e) = last_error {
            return Err(TransferError::PublishFailed(e.to_string()));
        }

        let moved = self
            .transfers
            .update_state_if(
                record.transfer_id,
                &[TransferState::Validated],
                TransferState::EventPublished,
            )
            .await?;
        if moved {
            info!(transfer_id = %record.transfer_id, "Transfer event published");
        }

        // Either way, report what is stored now: the consumer may already have settled it
        self.transfers
            .get(record.transfer_id)
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(record.transfer_id.to_string()))
    }

    /// Status query, restricted to the caller who submitted the transfer
    pub async fn transfer_status(
        &self,
        caller: UserId,
        transfer_id: TransferId,
    ) -> Result<TransferReceipt, TransferError> {
        let record = self
            .transfers
            .get(transfer_id)
            .await?
            .filter(|r| r.caller == caller)
            .ok_or_else(|| TransferError::TransferNotFound(transfer_id.to_string()))?;
        let decimals = self.currencies.decimals(&record.currency)?;
        Ok(TransferReceipt::from_record(&record, decimals))
    }

    /// Account read, restricted to its owner
    pub async fn account_for_owner(
        &self,
        caller: UserId,
        account_id: AccountId,
    ) -> Result<Account, TransferError> {
        match self.accounts.get_account(account_id).await {
            Ok(account) if account.owner == caller => Ok(account),
            Ok(_) | Err(LedgerError::AccountNotFound(_)) => {
                Err(TransferError::AccountNotFound(account_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
