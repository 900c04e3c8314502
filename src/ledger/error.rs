//! Ledger Error Types

use thiserror::Error;

use super::types::AccountStatus;
use crate::core_types::{AccountId, MinorUnits, ReferenceId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    // === Entry validation (rejected before touching storage) ===
    #[error("Unbalanced journal entry: postings sum to {sum}")]
    UnbalancedEntry { sum: MinorUnits },

    #[error("Journal entry needs at least two postings, got {0}")]
    TooFewPostings(usize),

    #[error("Posting amount must be non-zero")]
    ZeroAmountPosting,

    #[error("Posting amounts overflow")]
    AmountOverflow,

    // === Business rejections (terminal, recorded as FAILED) ===
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Account {account} is {status}")]
    AccountNotActive {
        account: AccountId,
        status: AccountStatus,
    },

    #[error("Currency mismatch on account {account}: expected {expected}, found {found}")]
    CurrencyMismatch {
        account: AccountId,
        expected: String,
        found: String,
    },

    #[error("Insufficient funds on account {account}: balance {balance}, change {delta}")]
    InsufficientFunds {
        account: AccountId,
        balance: MinorUnits,
        delta: MinorUnits,
    },

    #[error("Journal entry {reference} already failed: {reason}")]
    EntryFailed {
        reference: ReferenceId,
        reason: String,
    },

    // === Concurrency ===
    #[error("Version conflict on account {0}")]
    Conflict(AccountId),

    #[error("Gave up after {attempts} conflicting attempts")]
    ConcurrencyExhausted { attempts: u32 },

    #[error("Journal entry already exists for reference {0}")]
    DuplicateReference(ReferenceId),

    // === Infrastructure ===
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Terminal business outcome: record FAILED, never retry
    pub fn is_business_rejection(&self) -> bool {
        matches!(
            self,
            LedgerError::AccountNotFound(_)
                | LedgerError::AccountNotActive { .. }
                | LedgerError::CurrencyMismatch { .. }
                | LedgerError::InsufficientFunds { .. }
                | LedgerError::EntryFailed { .. }
        )
    }

    /// Malformed entry; a programming error on the caller's side
    pub fn is_invalid_entry(&self) -> bool {
        matches!(
            self,
            LedgerError::UnbalancedEntry { .. }
                | LedgerError::TooFewPostings(_)
                | LedgerError::ZeroAmountPosting
                | LedgerError::AmountOverflow
        )
    }

    /// Safe to try again later with no risk of a double effect
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Conflict(_)
                | LedgerError::ConcurrencyExhausted { .. }
                | LedgerError::DeadlineExceeded
                | LedgerError::Storage(_)
        )
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}
