//! Account Store
//!
//! Repository interface over accounts, journal entries and postings. The
//! store is the single arbiter of the account version check: every
//! implementation must apply a journal entry all-or-nothing.

use async_trait::async_trait;

use super::error::LedgerError;
use super::types::{Account, AccountStatus, ExpectedVersion, JournalEntry, NewAccount, Posting};
use crate::core_types::{AccountId, ReferenceId};

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// `AccountNotFound` when the id is unknown
    async fn get_account(&self, id: AccountId) -> Result<Account, LedgerError>;

    /// Open a new ACTIVE account with zero balance and version 0
    async fn open_account(&self, account: NewAccount) -> Result<Account, LedgerError>;

    /// Status transition (e.g. freeze, close). Bumps the version so that any
    /// in-flight application against the old snapshot conflicts.
    async fn set_status(&self, id: AccountId, status: AccountStatus)
    -> Result<Account, LedgerError>;

    /// Apply a PENDING entry atomically.
    ///
    /// For every account touched: the current version must equal the expected
    /// one (`Conflict` otherwise), the account must be ACTIVE, and a debit may
    /// not take a non-overdraft account below zero (`InsufficientFunds`). On
    /// success all versions are incremented, balances updated and the entry is
    /// stored as POSTED together with its postings. A second entry for the same
    /// reference fails with `DuplicateReference`. Nothing is written on error.
    async fn apply_postings(
        &self,
        entry: &JournalEntry,
        expected: &[ExpectedVersion],
    ) -> Result<JournalEntry, LedgerError>;

    /// Store a FAILED entry (no postings, no balance change).
    /// `DuplicateReference` if the reference already has an entry.
    async fn record_failed_entry(&self, entry: &JournalEntry) -> Result<(), LedgerError>;

    async fn find_entry_by_reference(
        &self,
        reference: &ReferenceId,
    ) -> Result<Option<JournalEntry>, LedgerError>;

    /// Account together with every posting against it, read consistently
    async fn account_with_postings(
        &self,
        id: AccountId,
    ) -> Result<(Account, Vec<Posting>), LedgerError>;
}

/// Look up the expected version for an account
pub(crate) fn expected_version(
    expected: &[ExpectedVersion],
    account_id: AccountId,
) -> Result<i64, LedgerError> {
    expected
        .iter()
        .find(|e| e.account_id == account_id)
        .map(|e| e.version)
        .ok_or_else(|| {
            LedgerError::Storage(format!("no expected version supplied for {}", account_id))
        })
}

/// Balance after applying `delta`, enforcing status and overdraft rules
pub(crate) fn prospective_balance(account: &Account, delta: i64) -> Result<i64, LedgerError> {
    if account.status != AccountStatus::Active {
        return Err(LedgerError::AccountNotActive {
            account: account.id,
            status: account.status,
        });
    }

    let new_balance = account
        .cached_balance
        .checked_add(delta)
        .ok_or(LedgerError::AmountOverflow)?;

    if delta < 0 && new_balance < 0 && !account.overdraft_allowed {
        return Err(LedgerError::InsufficientFunds {
            account: account.id,
            balance: account.cached_balance,
            delta,
        });
    }

    Ok(new_balance)
}
