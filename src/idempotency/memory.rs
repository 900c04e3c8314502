//! In-process idempotency store.
//!
//! Single-instance only: keys are not shared across processes, so a
//! multi-instance deployment must use the PostgreSQL store.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::Duration;

use super::error::IdempotencyError;
use super::store::IdempotencyStore;
use super::types::{
    BeginOutcome, IdempotencyRecord, RecordState, ScopedKey, StoredResponse,
};

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<ScopedKey, IdempotencyRecord>,
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn begin(
        &self,
        key: &ScopedKey,
        request_hash: &str,
        lease: Duration,
        ttl: Duration,
    ) -> Result<BeginOutcome, IdempotencyError> {
        let now = Utc::now();
        let claim = || IdempotencyRecord {
            key: key.clone(),
            request_hash: request_hash.to_string(),
            state: RecordState::InProgress,
            response: None,
            locked_until: Some(now + chrono_duration(lease)),
            expires_at: now + chrono_duration(ttl),
        };

        // The entry guard holds the shard lock, so check-and-claim is atomic
        match self.records.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(claim());
                Ok(BeginOutcome::Proceed)
            }
            Entry::Occupied(mut slot) => {
                if slot.get().is_expired(now) {
                    slot.insert(claim());
                    return Ok(BeginOutcome::Proceed);
                }
                let outcome = slot.get().outcome_for(request_hash, now);
                if outcome == BeginOutcome::Proceed {
                    tracing::warn!(
                        caller = key.caller,
                        key = %key.key,
                        "Taking over idempotency key with lapsed lease"
                    );
                    slot.insert(claim());
                }
                Ok(outcome)
            }
        }
    }

    async fn complete(
        &self,
        key: &ScopedKey,
        response: &StoredResponse,
        ttl: Duration,
    ) -> Result<(), IdempotencyError> {
        let mut record = self.records.get_mut(key).ok_or_else(|| {
            IdempotencyError::Storage(format!("no claim for key {}", key.key))
        })?;
        record.state = RecordState::Completed;
        record.response = Some(response.clone());
        record.locked_until = None;
        record.expires_at = Utc::now() + chrono_duration(ttl);
        Ok(())
    }

    async fn release(&self, key: &ScopedKey) -> Result<(), IdempotencyError> {
        self.records
            .remove_if(key, |_, r| r.state == RecordState::InProgress);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, IdempotencyError> {
        let now = Utc::now();
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_expired(now));
        Ok(before.saturating_sub(self.records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(30);
    const TTL: Duration = Duration::from_secs(3600);

    fn accepted() -> StoredResponse {
        StoredResponse {
            status: 202,
            body: serde_json::json!({"transfer_id": "t1", "state": "EVENT_PUBLISHED"}),
        }
    }

    #[tokio::test]
    async fn test_first_begin_proceeds_then_in_flight() {
        let store = InMemoryIdempotencyStore::new();
        let key = ScopedKey::new(1, "k1").unwrap();

        assert_eq!(store.begin(&key, "h", LEASE, TTL).await.unwrap(), BeginOutcome::Proceed);
        assert_eq!(store.begin(&key, "h", LEASE, TTL).await.unwrap(), BeginOutcome::InFlight);
    }

    #[tokio::test]
    async fn test_completed_key_replays() {
        let store = InMemoryIdempotencyStore::new();
        let key = ScopedKey::new(1, "k1").unwrap();
        store.begin(&key, "h", LEASE, TTL).await.unwrap();
        store.complete(&key, &accepted(), TTL).await.unwrap();

        assert_eq!(
            store.begin(&key, "h", LEASE, TTL).await.unwrap(),
            BeginOutcome::Replay(accepted())
        );
        assert_eq!(store.begin(&key, "other", LEASE, TTL).await.unwrap(), BeginOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_keys_scoped_per_caller() {
        let store = InMemoryIdempotencyStore::new();
        let alice = ScopedKey::new(1, "shared").unwrap();
        let bob = ScopedKey::new(2, "shared").unwrap();

        assert_eq!(store.begin(&alice, "h1", LEASE, TTL).await.unwrap(), BeginOutcome::Proceed);
        assert_eq!(store.begin(&bob, "h2", LEASE, TTL).await.unwrap(), BeginOutcome::Proceed);
    }

    #[tokio::test]
    async fn test_release_allows_retry() {
        let store = InMemoryIdempotencyStore::new();
        let key = ScopedKey::new(1, "k1").unwrap();
        store.begin(&key, "h", LEASE, TTL).await.unwrap();
        store.release(&key).await.unwrap();
        assert_eq!(store.begin(&key, "h", LEASE, TTL).await.unwrap(), BeginOutcome::Proceed);
    }

    #[tokio::test]
    async fn test_release_keeps_completed_record() {
        let store = InMemoryIdempotencyStore::new();
        let key = ScopedKey::new(1, "k1").unwrap();
        store.begin(&key, "h", LEASE, TTL).await.unwrap();
        store.complete(&key, &accepted(), TTL).await.unwrap();
        store.release(&key).await.unwrap();
        assert!(matches!(
            store.begin(&key, "h", LEASE, TTL).await.unwrap(),
            BeginOutcome::Replay(_)
        ));
    }

    #[tokio::test]
    async fn test_lapsed_lease_taken_over() {
        let store = InMemoryIdempotencyStore::new();
        let key = ScopedKey::new(1, "k1").unwrap();
        store.begin(&key, "h", Duration::ZERO, TTL).await.unwrap();
        assert_eq!(store.begin(&key, "h", LEASE, TTL).await.unwrap(), BeginOutcome::Proceed);
        assert_eq!(store.begin(&key, "h", LEASE, TTL).await.unwrap(), BeginOutcome::InFlight);
    }

    #[tokio::test]
    async fn test_expired_records_purged() {
        let store = InMemoryIdempotencyStore::new();
        let stale = ScopedKey::new(1, "old").unwrap();
        let live = ScopedKey::new(1, "new").unwrap();
        store.begin(&stale, "h", LEASE, Duration::ZERO).await.unwrap();
        store.begin(&live, "h", LEASE, TTL).await.unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        // An expired key behaves like a fresh one, even with a different body
        store.begin(&stale, "h", LEASE, Duration::ZERO).await.unwrap();
        assert_eq!(store.begin(&stale, "h2", LEASE, TTL).await.unwrap(), BeginOutcome::Proceed);
    }
}
