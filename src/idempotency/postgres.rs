//! PostgreSQL idempotency store; durable and shared across instances.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;

use super::error::IdempotencyError;
use super::store::IdempotencyStore;
use super::types::{
    BeginOutcome, IdempotencyRecord, RecordState, ScopedKey, StoredResponse,
};
use crate::db::SafeRow;

pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load(&self, key: &ScopedKey) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let row = sqlx::query(
            r#"
            SELECT request_hash, state, response_status, response_body, locked_until, expires_at
            FROM idempotency_keys
            WHERE caller_id = $1 AND idem_key = $2
            "#,
        )
        .bind(key.caller as i64)
        .bind(&key.key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let state_id: i16 = row.require("state").map_err(IdempotencyError::Storage)?;
        let state = RecordState::from_id(state_id).ok_or_else(|| {
            IdempotencyError::Storage(format!("Invalid idempotency state: {}", state_id))
        })?;

        let status: Option<i16> = row.try_get_log("response_status").flatten();
        let body: Option<String> = row.try_get_log("response_body").flatten();
        let response = match (status, body) {
            (Some(status), Some(body)) => Some(StoredResponse {
                status: status as u16,
                body: serde_json::from_str(&body)
                    .map_err(|e| IdempotencyError::Storage(e.to_string()))?,
            }),
            _ => None,
        };

        Ok(Some(IdempotencyRecord {
            key: key.clone(),
            request_hash: row.require("request_hash").map_err(IdempotencyError::Storage)?,
            state,
            response,
            locked_until: row.try_get_log("locked_until").flatten(),
            expires_at: row.require("expires_at").map_err(IdempotencyError::Storage)?,
        }))
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn begin(
        &self,
        key: &ScopedKey,
        request_hash: &str,
        lease: Duration,
        ttl: Duration,
    ) -> Result<BeginOutcome, IdempotencyError> {
        // Claim a fresh key, or take over an expired record / lapsed lease
        let claimed = sqlx::query(
            r#"
            INSERT INTO idempotency_keys
                (caller_id, idem_key, request_hash, state, locked_until, expires_at)
            VALUES
                ($1, $2, $3, $4, NOW() + INTERVAL '1 millisecond' * $5,
                 NOW() + INTERVAL '1 millisecond' * $6)
            ON CONFLICT (caller_id, idem_key) DO UPDATE
            SET request_hash = EXCLUDED.request_hash,
                state = EXCLUDED.state,
                response_status = NULL,
                response_body = NULL,
                locked_until = EXCLUDED.locked_until,
                expires_at = EXCLUDED.expires_at,
                created_at = NOW()
            WHERE idempotency_keys.expires_at <= NOW()
               OR (idempotency_keys.state = $4
                   AND idempotency_keys.request_hash = EXCLUDED.request_hash
                   AND idempotency_keys.locked_until <= NOW())
            "#,
        )
        .bind(key.caller as i64)
        .bind(&key.key)
        .bind(request_hash)
        .bind(RecordState::InProgress.id())
        .bind(lease.as_millis() as i64)
        .bind(ttl.as_millis() as i64)
        .execute(&self.pool)
        .await?;

        if claimed.rows_affected() > 0 {
            return Ok(BeginOutcome::Proceed);
        }

        match self.load(key).await? {
            Some(record) => match record.outcome_for(request_hash, chrono::Utc::now()) {
                // Lease lapsed between the upsert and the read; let the caller poll again
                BeginOutcome::Proceed => Ok(BeginOutcome::InFlight),
                outcome => Ok(outcome),
            },
            // Purged in between
            None => Ok(BeginOutcome::InFlight),
        }
    }

    async fn complete(
        &self,
        key: &ScopedKey,
        response: &StoredResponse,
        ttl: Duration,
    ) -> Result<(), IdempotencyError> {
        let body = serde_json::to_string(&response.body)
            .map_err(|e| IdempotencyError::Storage(e.to_string()))?;

        let updated = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET state = $1, response_status = $2, response_body = $3, locked_until = NULL,
                expires_at = NOW() + INTERVAL '1 millisecond' * $4
            WHERE caller_id = $5 AND idem_key = $6
            "#,
        )
        .bind(RecordState::Completed.id())
        .bind(response.status as i16)
        .bind(body)
        .bind(ttl.as_millis() as i64)
        .bind(key.caller as i64)
        .bind(&key.key)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(IdempotencyError::Storage(format!(
                "no claim for key {}",
                key.key
            )));
        }
        Ok(())
    }

    async fn release(&self, key: &ScopedKey) -> Result<(), IdempotencyError> {
        sqlx::query(
            "DELETE FROM idempotency_keys WHERE caller_id = $1 AND idem_key = $2 AND state = $3",
        )
        .bind(key.caller as i64)
        .bind(&key.key)
        .bind(RecordState::InProgress.id())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, IdempotencyError> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
