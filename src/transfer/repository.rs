//! Transfer persistence interface and in-process implementation.
//!
//! All state updates are compare-and-swap on the current state, so a
//! transition made by one actor (orchestrator, consumer, recovery worker) can
//! never be overwritten by another acting on a stale read.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::Duration;

use super::error::TransferError;
use super::state::TransferState;
use super::types::TransferRecord;
use crate::core_types::{TransferId, UserId};

#[async_trait]
pub trait TransferRepository: Send + Sync {
    /// Insert a new transfer. If the caller already has a transfer under the
    /// same idempotency key, that record is returned instead.
    async fn create(&self, record: &TransferRecord) -> Result<TransferRecord, TransferError>;

    async fn get(&self, id: TransferId) -> Result<Option<TransferRecord>, TransferError>;

    async fn get_by_key(
        &self,
        caller: UserId,
        idempotency_key: &str,
    ) -> Result<Option<TransferRecord>, TransferError>;

    /// Move to `new_state` only if the current state is one of `expected`.
    /// Returns false when another actor moved it first.
    async fn update_state_if(
        &self,
        id: TransferId,
        expected: &[TransferState],
        new_state: TransferState,
    ) -> Result<bool, TransferError>;

    /// Same as `update_state_if`, also recording the failure reason
    async fn update_state_with_error(
        &self,
        id: TransferId,
        expected: &[TransferState],
        new_state: TransferState,
        reason: &str,
    ) -> Result<bool, TransferError>;

    /// Bump `updated_at` so the recovery scan backs off this transfer
    async fn touch(&self, id: TransferId) -> Result<(), TransferError>;

    /// Non-terminal transfers not updated within `threshold`, oldest first
    async fn find_stale(
        &self,
        threshold: Duration,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, TransferError>;
}

pub(crate) fn check_transition(
    expected: &[TransferState],
    new_state: TransferState,
) -> Result<(), TransferError> {
    match expected.iter().find(|s| !s.can_transition_to(new_state)) {
        Some(from) => Err(TransferError::SystemError(format!(
            "invalid transition {} -> {}",
            from, new_state
        ))),
        None => Ok(()),
    }
}

#[derive(Default)]
pub struct InMemoryTransferRepository {
    records: DashMap<TransferId, TransferRecord>,
    keys: DashMap<(UserId, String), TransferId>,
}

impl InMemoryTransferRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(
        &self,
        id: TransferId,
        expected: &[TransferState],
        new_state: TransferState,
        reason: Option<&str>,
    ) -> Result<bool, TransferError> {
        check_transition(expected, new_state)?;
        let Some(mut record) = self.records.get_mut(&id) else {
            return Err(TransferError::TransferNotFound(id.to_string()));
        };
        if !expected.contains(&record.state) {
            return Ok(false);
        }
        record.state = new_state;
        if let Some(reason) = reason {
            record.failure_reason = Some(reason.to_string());
        }
        record.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl TransferRepository for InMemoryTransferRepository {
    async fn create(&self, record: &TransferRecord) -> Result<TransferRecord, TransferError> {
        match self
            .keys
            .entry((record.caller, record.idempotency_key.clone()))
        {
            Entry::Occupied(existing) => self
                .records
                .get(existing.get())
                .map(|r| r.clone())
                .ok_or_else(|| TransferError::SystemError("dangling idempotency key".into())),
            Entry::Vacant(slot) => {
                self.records.insert(record.transfer_id, record.clone());
                slot.insert(record.transfer_id);
                Ok(record.clone())
            }
        }
    }

    async fn get(&self, id: TransferId) -> Result<Option<TransferRecord>, TransferError> {
        Ok(self.records.get(&id).map(|r| r.clone()))
    }

    async fn get_by_key(
        &self,
        caller: UserId,
        idempotency_key: &str,
    ) -> Result<Option<TransferRecord>, TransferError> {
        let id = self
            .keys
            .get(&(caller, idempotency_key.to_string()))
            .map(|id| *id);
        Ok(id.and_then(|id| self.records.get(&id).map(|r| r.clone())))
    }

    async fn update_state_if(
        &self,
        id: TransferId,
        expected: &[TransferState],
        new_state: TransferState,
    ) -> Result<bool, TransferError> {
        self.transition(id, expected, new_state, None)
    }

    async fn update_state_with_error(
        &self,
        id: TransferId,
        expected: &[TransferState],
        new_state: TransferState,
        reason: &str,
    ) -> Result<bool, TransferError> {
        self.transition(id, expected, new_state, Some(reason))
    }

    async fn touch(&self, id: TransferId) -> Result<(), TransferError> {
        if let Some(mut record) = self.records.get_mut(&id) {
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn find_stale(
        &self,
        threshold: Duration,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold)
                .map_err(|e| TransferError::SystemError(e.to_string()))?;
        let mut stale: Vec<TransferRecord> = self
            .records
            .iter()
            .filter(|r| !r.state.is_terminal() && r.updated_at < cutoff)
            .map(|r| r.clone())
            .collect();
        stale.sort_by_key(|r| r.updated_at);
        stale.truncate(limit);
        Ok(stale)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core_types::AccountId;

    pub(crate) fn new_record(caller: UserId, key: &str) -> TransferRecord {
        let now = Utc::now();
        TransferRecord {
            transfer_id: TransferId::new(),
            caller,
            idempotency_key: key.to_string(),
            request_hash: format!("hash-{}", key),
            source_account: AccountId::new(),
            destination_account: AccountId::new(),
            amount: 3_000,
            currency: "USD".to_string(),
            description: None,
            state: TransferState::Validated,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_caller_key() {
        let repo = InMemoryTransferRepository::new();
        let first = repo.create(&new_record(1, "k1")).await.unwrap();
        let second = repo.create(&new_record(1, "k1")).await.unwrap();
        assert_eq!(first.transfer_id, second.transfer_id);

        let other_caller = repo.create(&new_record(2, "k1")).await.unwrap();
        assert_ne!(first.transfer_id, other_caller.transfer_id);

        let by_key = repo.get_by_key(1, "k1").await.unwrap().unwrap();
        assert_eq!(by_key.transfer_id, first.transfer_id);
    }

    #[tokio::test]
    async fn test_cas_update() {
        let repo = InMemoryTransferRepository::new();
        let r = repo.create(&new_record(1, "k1")).await.unwrap();

        assert!(repo
            .update_state_if(r.transfer_id, &[TransferState::Validated], TransferState::EventPublished)
            .await
            .unwrap());
        // Stale expectation loses
        assert!(!repo
            .update_state_if(r.transfer_id, &[TransferState::Validated], TransferState::EventPublished)
            .await
            .unwrap());

        assert!(repo
            .update_state_with_error(
                r.transfer_id,
                &[TransferState::Validated, TransferState::EventPublished],
                TransferState::Failed,
                "insufficient funds",
            )
            .await
            .unwrap());
        let stored = repo.get(r.transfer_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("insufficient funds"));
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let repo = InMemoryTransferRepository::new();
        let r = repo.create(&new_record(1, "k1")).await.unwrap();
        let err = repo
            .update_state_if(r.transfer_id, &[TransferState::Settled], TransferState::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SystemError(_)));
    }

    #[tokio::test]
    async fn test_find_stale_skips_terminal_and_fresh() {
        let repo = InMemoryTransferRepository::new();
        let mut old = new_record(1, "old");
        old.updated_at = Utc::now() - chrono::Duration::minutes(10);
        let mut done = new_record(1, "done");
        done.updated_at = old.updated_at;
        done.state = TransferState::Settled;
        repo.create(&old).await.unwrap();
        repo.create(&done).await.unwrap();
        repo.create(&new_record(1, "fresh")).await.unwrap();

        let stale = repo.find_stale(Duration::from_secs(60), 100).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].transfer_id, old.transfer_id);

        repo.touch(old.transfer_id).await.unwrap();
        assert!(repo.find_stale(Duration::from_secs(60), 100).await.unwrap().is_empty());
    }
}
