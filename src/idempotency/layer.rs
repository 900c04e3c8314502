//! Idempotency Layer
//!
//! Wraps an [`IdempotencyStore`] with the configured lease/TTL, a short wait
//! for concurrent duplicates and the rule that only terminal outcomes are
//! cached.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::error::IdempotencyError;
use super::store::IdempotencyStore;
use super::types::{BeginOutcome, ScopedKey, StoredResponse};
use crate::config::IdempotencyConfig;

const IN_FLIGHT_POLL: Duration = Duration::from_millis(25);

pub struct IdempotencyLayer {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
    lease: Duration,
    in_flight_wait: Duration,
}

impl IdempotencyLayer {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: &IdempotencyConfig) -> Self {
        Self {
            store,
            ttl: config.ttl(),
            lease: config.lease(),
            in_flight_wait: config.in_flight_wait(),
        }
    }

    /// Claim `key` for this request.
    ///
    /// A duplicate of a request that is still executing waits up to the
    /// configured in-flight window for its outcome before `InFlight` is
    /// returned to the caller.
    pub async fn begin(
        &self,
        key: &ScopedKey,
        request_hash: &str,
    ) -> Result<BeginOutcome, IdempotencyError> {
        let give_up = Instant::now() + self.in_flight_wait;
        loop {
            let outcome = self
                .store
                .begin(key, request_hash, self.lease, self.ttl)
                .await?;
            if outcome != BeginOutcome::InFlight || Instant::now() + IN_FLIGHT_POLL > give_up {
                return Ok(outcome);
            }
            tokio::time::sleep(IN_FLIGHT_POLL).await;
        }
    }

    /// Record the outcome of a claimed request. Non-terminal outcomes (5xx)
    /// release the claim instead, so the retry re-executes.
    pub async fn complete(
        &self,
        key: &ScopedKey,
        response: &StoredResponse,
    ) -> Result<(), IdempotencyError> {
        if response.is_terminal() {
            self.store.complete(key, response, self.ttl).await
        } else {
            self.store.release(key).await
        }
    }

    pub async fn release(&self, key: &ScopedKey) -> Result<(), IdempotencyError> {
        self.store.release(key).await
    }

    pub async fn purge_expired(&self) -> Result<u64, IdempotencyError> {
        self.store.purge_expired().await
    }

    /// Periodically purge expired records
    pub fn spawn_purge_task(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(purged = n, "Purged expired idempotency keys"),
                    Err(e) => tracing::warn!(error = %e, "Idempotency purge failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::memory::InMemoryIdempotencyStore;

    fn layer(in_flight_wait_ms: u64) -> Arc<IdempotencyLayer> {
        let config = IdempotencyConfig {
            in_flight_wait_ms,
            ..IdempotencyConfig::default()
        };
        Arc::new(IdempotencyLayer::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            &config,
        ))
    }

    fn response(status: u16) -> StoredResponse {
        StoredResponse {
            status,
            body: serde_json::json!({"status": status}),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_not_cached() {
        let layer = layer(0);
        let key = ScopedKey::new(1, "k").unwrap();
        assert_eq!(layer.begin(&key, "h").await.unwrap(), BeginOutcome::Proceed);
        layer.complete(&key, &response(503)).await.unwrap();
        assert_eq!(layer.begin(&key, "h").await.unwrap(), BeginOutcome::Proceed);
    }

    #[tokio::test]
    async fn test_client_error_cached() {
        let layer = layer(0);
        let key = ScopedKey::new(1, "k").unwrap();
        layer.begin(&key, "h").await.unwrap();
        layer.complete(&key, &response(422)).await.unwrap();
        assert_eq!(
            layer.begin(&key, "h").await.unwrap(),
            BeginOutcome::Replay(response(422))
        );
    }

    #[tokio::test]
    async fn test_duplicate_waits_for_first_outcome() {
        let layer = layer(2_000);
        let key = ScopedKey::new(1, "k").unwrap();
        assert_eq!(layer.begin(&key, "h").await.unwrap(), BeginOutcome::Proceed);

        let first = layer.clone();
        let first_key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            first.complete(&first_key, &response(202)).await.unwrap();
        });

        assert_eq!(
            layer.begin(&key, "h").await.unwrap(),
            BeginOutcome::Replay(response(202))
        );
    }

    #[tokio::test]
    async fn test_duplicate_gives_up_after_wait() {
        let layer = layer(50);
        let key = ScopedKey::new(1, "k").unwrap();
        layer.begin(&key, "h").await.unwrap();
        assert_eq!(layer.begin(&key, "h").await.unwrap(), BeginOutcome::InFlight);
    }
}
