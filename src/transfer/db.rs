//! Transfer Database Layer
//!
//! PostgreSQL-based persistence for transfer state.
//! All state updates use atomic CAS (Compare-And-Swap) operations.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;

use super::error::TransferError;
use super::repository::{TransferRepository, check_transition};
use super::state::TransferState;
use super::types::TransferRecord;
use crate::core_types::{TransferId, UserId};
use crate::db::SafeRow;

const TRANSFER_COLUMNS: &str = r#"
    id, caller_id, idempotency_key, request_hash, source_account, destination_account,
    amount, currency, description, state, failure_reason, created_at, updated_at
"#;

pub struct PgTransferRepository {
    pool: PgPool,
}

impl PgTransferRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        bind_caller: Option<UserId>,
        value: String,
    ) -> Result<Option<TransferRecord>, TransferError> {
        let sql = format!("SELECT {} FROM transfers WHERE {}", TRANSFER_COLUMNS, clause);
        let mut query = sqlx::query(&sql);
        if let Some(caller) = bind_caller {
            query = query.bind(caller as i64);
        }
        let row = query.bind(value).fetch_optional(&self.pool).await?;

        match row {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TransferRepository for PgTransferRepository {
    async fn create(&self, record: &TransferRecord) -> Result<TransferRecord, TransferError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO transfers
                (id, caller_id, idempotency_key, request_hash, source_account,
                 destination_account, amount, currency, description, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
            ON CONFLICT (caller_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(record.transfer_id.to_string())
        .bind(record.caller as i64)
        .bind(&record.idempotency_key)
        .bind(&record.request_hash)
        .bind(record.source_account.to_string())
        .bind(record.destination_account.to_string())
        .bind(record.amount)
        .bind(&record.currency)
        .bind(&record.description)
        .bind(record.state.id())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            return Ok(record.clone());
        }

        // Same caller and key already persisted - return the existing transfer
        let existing = self
            .get_by_key(record.caller, &record.idempotency_key)
            .await?
            .ok_or_else(|| TransferError::SystemError("transfer vanished after conflict".into()))?;
        tracing::info!(
            transfer_id = %existing.transfer_id,
            caller = record.caller,
            "Transfer with idempotency key already exists - returning existing record"
        );
        Ok(existing)
    }

    async fn get(&self, id: TransferId) -> Result<Option<TransferRecord>, TransferError> {
        self.fetch_one_where("id = $1", None, id.to_string()).await
    }

    async fn get_by_key(
        &self,
        caller: UserId,
        idempotency_key: &str,
    ) -> Result<Option<TransferRecord>, TransferError> {
        self.fetch_one_where(
            "caller_id = $1 AND idempotency_key = $2",
            Some(caller),
            idempotency_key.to_string(),
        )
        .await
    }

    async fn update_state_if(
        &self,
        id: TransferId,
        expected: &[TransferState],
        new_state: TransferState,
    ) -> Result<bool, TransferError> {
        check_transition(expected, new_state)?;
        let expected_ids: Vec<i16> = expected.iter().map(|s| s.id()).collect();

        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET state = $1, updated_at = NOW()
            WHERE id = $2 AND state = ANY($3)
            "#,
        )
        .bind(new_state.id())
        .bind(id.to_string())
        .bind(&expected_ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_state_with_error(
        &self,
        id: TransferId,
        expected: &[TransferState],
        new_state: TransferState,
        reason: &str,
    ) -> Result<bool, TransferError> {
        check_transition(expected, new_state)?;
        let expected_ids: Vec<i16> = expected.iter().map(|s| s.id()).collect();

        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET state = $1, failure_reason = $2, updated_at = NOW()
            WHERE id = $3 AND state = ANY($4)
            "#,
        )
        .bind(new_state.id())
        .bind(reason)
        .bind(id.to_string())
        .bind(&expected_ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch(&self, id: TransferId) -> Result<(), TransferError> {
        sqlx::query("UPDATE transfers SET updated_at = NOW() WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Find stale transfers (stuck in non-terminal states for too long)
    async fn find_stale(
        &self,
        threshold: Duration,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM transfers
            WHERE state NOT IN ($1, $2, $3)
              AND updated_at < NOW() - INTERVAL '1 second' * $4
            ORDER BY updated_at ASC
            LIMIT $5
            "#,
            TRANSFER_COLUMNS
        ))
        .bind(TransferState::Settled.id())
        .bind(TransferState::Rejected.id())
        .bind(TransferState::Failed.id())
        .bind(threshold.as_secs() as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(row_to_record(&row)?);
        }

        Ok(records)
    }
}

fn parse<T: std::str::FromStr>(column: &str, value: String) -> Result<T, TransferError> {
    value
        .parse()
        .map_err(|_| TransferError::SystemError(format!("Invalid {} format: {}", column, value)))
}

/// Convert database row to TransferRecord
fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<TransferRecord, TransferError> {
    let field = |e: String| TransferError::SystemError(e);

    let state_id: i16 = row.require("state").map_err(field)?;
    let state = TransferState::from_id(state_id)
        .ok_or_else(|| TransferError::SystemError(format!("Invalid state ID: {}", state_id)))?;
    let caller: i64 = row.require("caller_id").map_err(field)?;

    Ok(TransferRecord {
        transfer_id: parse("id", row.require("id").map_err(field)?)?,
        caller: caller as u64,
        idempotency_key: row.require("idempotency_key").map_err(field)?,
        request_hash: row.require("request_hash").map_err(field)?,
        source_account: parse("source_account", row.require("source_account").map_err(field)?)?,
        destination_account: parse(
            "destination_account",
            row.require("destination_account").map_err(field)?,
        )?,
        amount: row.require("amount").map_err(field)?,
        currency: row.require("currency").map_err(field)?,
        description: row.try_get_log("description").flatten(),
        state,
        failure_reason: row.try_get_log("failure_reason").flatten(),
        created_at: row.require("created_at").map_err(field)?,
        updated_at: row.require("updated_at").map_err(field)?,
    })
}
