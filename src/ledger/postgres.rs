//! PostgreSQL account store.
//!
//! One transaction per application. Each touched account is updated with a
//! version CAS (`WHERE version = $expected`), in account-id order; zero rows
//! affected means another writer got there first. Returning early drops the
//! transaction, which rolls it back.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Transaction};

use super::error::LedgerError;
use super::store::{AccountStore, expected_version, prospective_balance};
use super::types::{
    Account, AccountStatus, Direction, EntryStatus, ExpectedVersion, JournalEntry, NewAccount,
    Posting,
};
use crate::core_types::{AccountId, ReferenceId};
use crate::db::SafeRow;

const ACCOUNT_COLUMNS: &str =
    "id, owner_id, currency, status, version, cached_balance, overdraft_allowed";

pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_account<'e, E>(executor: E, id: AccountId) -> Result<Account, LedgerError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(executor)
        .await?;

        match row {
            Some(row) => row_to_account(&row),
            None => Err(LedgerError::AccountNotFound(id)),
        }
    }

    async fn insert_entry(
        tx: &mut Transaction<'_, Postgres>,
        entry: &JournalEntry,
    ) -> Result<(), LedgerError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO journal_entries (id, reference_id, status, failure_reason, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (reference_id) DO NOTHING
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.reference_id.as_str())
        .bind(entry.status.id())
        .bind(&entry.failure_reason)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(LedgerError::DuplicateReference(entry.reference_id.clone()));
        }

        for (seq, posting) in entry.postings.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO postings (id, journal_entry_id, seq, account_id, amount, direction)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(posting.id.to_string())
            .bind(entry.id.to_string())
            .bind(seq as i16)
            .bind(posting.account_id.to_string())
            .bind(posting.amount)
            .bind(posting.direction.id())
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    async fn load_postings<'e, E>(
        executor: E,
        column: &str,
        value: String,
    ) -> Result<Vec<Posting>, LedgerError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, journal_entry_id, account_id, amount, direction
            FROM postings
            WHERE {} = $1
            ORDER BY journal_entry_id, seq
            "#,
            column
        ))
        .bind(value)
        .fetch_all(executor)
        .await?;

        rows.iter().map(row_to_posting).collect()
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn get_account(&self, id: AccountId) -> Result<Account, LedgerError> {
        Self::fetch_account(&self.pool, id).await
    }

    async fn open_account(&self, account: NewAccount) -> Result<Account, LedgerError> {
        let account: Account = account.into();
        sqlx::query(
            r#"
            INSERT INTO accounts (id, owner_id, currency, status, version, cached_balance, overdraft_allowed)
            VALUES ($1, $2, $3, $4, 0, 0, $5)
            "#,
        )
        .bind(account.id.to_string())
        .bind(account.owner as i64)
        .bind(&account.currency)
        .bind(account.status.id())
        .bind(account.overdraft_allowed)
        .execute(&self.pool)
        .await?;

        tracing::info!(account_id = %account.id, owner = account.owner, currency = %account.currency, "Account opened");
        Ok(account)
    }

    async fn set_status(
        &self,
        id: AccountId,
        status: AccountStatus,
    ) -> Result<Account, LedgerError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE accounts SET status = $1, version = version + 1, updated_at = NOW()
            WHERE id = $2
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(status.id())
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_account(&row),
            None => Err(LedgerError::AccountNotFound(id)),
        }
    }

    async fn apply_postings(
        &self,
        entry: &JournalEntry,
        expected: &[ExpectedVersion],
    ) -> Result<JournalEntry, LedgerError> {
        let mut deltas = entry.deltas();
        deltas.sort_by_key(|(id, _)| *id);

        let mut tx = self.pool.begin().await?;

        for (account_id, delta) in &deltas {
            let expected_version = expected_version(expected, *account_id)?;
            let account = Self::fetch_account(&mut *tx, *account_id).await?;
            if account.version != expected_version {
                return Err(LedgerError::Conflict(*account_id));
            }
            let new_balance = prospective_balance(&account, *delta)?;

            let updated = sqlx::query(
                r#"
                UPDATE accounts
                SET cached_balance = $1, version = version + 1, updated_at = NOW()
                WHERE id = $2 AND version = $3
                "#,
            )
            .bind(new_balance)
            .bind(account_id.to_string())
            .bind(expected_version)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                return Err(LedgerError::Conflict(*account_id));
            }
        }

        let mut posted = entry.clone();
        posted.status = EntryStatus::Posted;
        Self::insert_entry(&mut tx, &posted).await?;

        tx.commit().await?;
        Ok(posted)
    }

    async fn record_failed_entry(&self, entry: &JournalEntry) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        Self::insert_entry(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_entry_by_reference(
        &self,
        reference: &ReferenceId,
    ) -> Result<Option<JournalEntry>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, reference_id, status, failure_reason, created_at
            FROM journal_entries
            WHERE reference_id = $1
            "#,
        )
        .bind(reference.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row.require("id").map_err(LedgerError::Storage)?;
        let status_id: i16 = row.require("status").map_err(LedgerError::Storage)?;
        let status = EntryStatus::from_id(status_id)
            .ok_or_else(|| LedgerError::Storage(format!("Invalid entry status: {}", status_id)))?;
        let postings = Self::load_postings(&self.pool, "journal_entry_id", id.clone()).await?;

        Ok(Some(JournalEntry {
            id: parse_id(&id)?,
            reference_id: reference.clone(),
            status,
            created_at: row.require("created_at").map_err(LedgerError::Storage)?,
            postings,
            failure_reason: row.try_get_log("failure_reason").flatten(),
        }))
    }

    async fn account_with_postings(
        &self,
        id: AccountId,
    ) -> Result<(Account, Vec<Posting>), LedgerError> {
        // REPEATABLE READ gives both reads the same snapshot
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let account = Self::fetch_account(&mut *tx, id).await?;
        let postings = Self::load_postings(&mut *tx, "account_id", id.to_string()).await?;
        tx.commit().await?;

        Ok((account, postings))
    }
}

fn parse_id<T: std::str::FromStr>(s: &str) -> Result<T, LedgerError> {
    s.parse()
        .map_err(|_| LedgerError::Storage(format!("Invalid id format: {}", s)))
}

fn row_to_account(row: &PgRow) -> Result<Account, LedgerError> {
    let id: String = row.require("id").map_err(LedgerError::Storage)?;
    let status_id: i16 = row.require("status").map_err(LedgerError::Storage)?;
    let status = AccountStatus::from_id(status_id)
        .ok_or_else(|| LedgerError::Storage(format!("Invalid account status: {}", status_id)))?;
    let owner: i64 = row.require("owner_id").map_err(LedgerError::Storage)?;

    Ok(Account {
        id: parse_id(&id)?,
        owner: owner as u64,
        currency: row.require("currency").map_err(LedgerError::Storage)?,
        status,
        version: row.require("version").map_err(LedgerError::Storage)?,
        cached_balance: row.require("cached_balance").map_err(LedgerError::Storage)?,
        overdraft_allowed: row
            .require("overdraft_allowed")
            .map_err(LedgerError::Storage)?,
    })
}

fn row_to_posting(row: &PgRow) -> Result<Posting, LedgerError> {
    let id: String = row.require("id").map_err(LedgerError::Storage)?;
    let entry_id: String = row.require("journal_entry_id").map_err(LedgerError::Storage)?;
    let account_id: String = row.require("account_id").map_err(LedgerError::Storage)?;
    let direction_id: i16 = row.require("direction").map_err(LedgerError::Storage)?;
    let direction = Direction::from_id(direction_id)
        .ok_or_else(|| LedgerError::Storage(format!("Invalid direction: {}", direction_id)))?;

    Ok(Posting {
        id: parse_id(&id)?,
        entry_id: parse_id(&entry_id)?,
        account_id: parse_id(&account_id)?,
        amount: row.require("amount").map_err(LedgerError::Storage)?,
        direction,
    })
}
