use async_trait::async_trait;
use std::time::Duration;

use super::error::IdempotencyError;
use super::types::{BeginOutcome, ScopedKey, StoredResponse};

/// Per-caller idempotency keyspace.
///
/// `begin` is the only claim point: at most one caller sees `Proceed` for a
/// live key at a time (a lapsed lease may be taken over).
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn begin(
        &self,
        key: &ScopedKey,
        request_hash: &str,
        lease: Duration,
        ttl: Duration,
    ) -> Result<BeginOutcome, IdempotencyError>;

    /// Cache a terminal response; TTL restarts from completion
    async fn complete(
        &self,
        key: &ScopedKey,
        response: &StoredResponse,
        ttl: Duration,
    ) -> Result<(), IdempotencyError>;

    /// Drop an in-progress claim so a retry re-executes
    async fn release(&self, key: &ScopedKey) -> Result<(), IdempotencyError>;

    /// Remove expired records, returning how many were removed
    async fn purge_expired(&self) -> Result<u64, IdempotencyError>;
}
