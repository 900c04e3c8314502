//! Ledger Data Types
//!
//! Status IDs are stored as SMALLINT in PostgreSQL, following the same
//! `id()` / `from_id()` convention as the transfer FSM.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core_types::{AccountId, EntryId, MinorUnits, PostingId, ReferenceId, UserId};

/// Account lifecycle status. Accounts are never deleted, only closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum AccountStatus {
    Active = 1,
    Frozen = 2,
    Closed = 3,
}

impl AccountStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(AccountStatus::Active),
            2 => Some(AccountStatus::Frozen),
            3 => Some(AccountStatus::Closed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Frozen => "FROZEN",
            AccountStatus::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger account with its optimistic-concurrency version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: UserId,
    /// Upper-case currency code
    pub currency: String,
    pub status: AccountStatus,
    /// Incremented by every successful posting application
    pub version: i64,
    /// Signed sum of all postings against this account
    pub cached_balance: MinorUnits,
    /// Whether the balance may go below zero
    pub overdraft_allowed: bool,
}

/// Input for account opening (external to the ledger core; used by
/// operators, seeding and tests)
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub id: AccountId,
    pub owner: UserId,
    pub currency: String,
    pub overdraft_allowed: bool,
}

impl NewAccount {
    pub fn new(owner: UserId, currency: &str) -> Self {
        Self {
            id: AccountId::new(),
            owner,
            currency: currency.to_ascii_uppercase(),
            overdraft_allowed: false,
        }
    }

    /// Funding/settlement accounts whose balance may go negative
    pub fn with_overdraft(mut self) -> Self {
        self.overdraft_allowed = true;
        self
    }
}

impl From<NewAccount> for Account {
    fn from(new: NewAccount) -> Self {
        Self {
            id: new.id,
            owner: new.owner,
            currency: new.currency,
            status: AccountStatus::Active,
            version: 0,
            cached_balance: 0,
            overdraft_allowed: new.overdraft_allowed,
        }
    }
}

/// Journal entry lifecycle: `PENDING -> POSTED | FAILED`, immutable after
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum EntryStatus {
    Pending = 0,
    Posted = 10,
    Failed = -10,
}

impl EntryStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Posted | EntryStatus::Failed)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(EntryStatus::Pending),
            10 => Some(EntryStatus::Posted),
            -10 => Some(EntryStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "PENDING",
            EntryStatus::Posted => "POSTED",
            EntryStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Debit decreases an account balance (negative amount), credit increases it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum Direction {
    Debit = 1,
    Credit = 2,
}

impl Direction {
    /// Direction implied by a signed amount; `None` for zero
    pub fn from_amount(amount: MinorUnits) -> Option<Self> {
        match amount.signum() {
            -1 => Some(Direction::Debit),
            1 => Some(Direction::Credit),
            _ => None,
        }
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(Direction::Debit),
            2 => Some(Direction::Credit),
            _ => None,
        }
    }
}

/// Requested posting, before it is assigned to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostingLine {
    pub account_id: AccountId,
    pub amount: MinorUnits,
}

impl PostingLine {
    pub fn debit(account_id: AccountId, amount: MinorUnits) -> Self {
        Self {
            account_id,
            amount: -amount,
        }
    }

    pub fn credit(account_id: AccountId, amount: MinorUnits) -> Self {
        Self { account_id, amount }
    }
}

/// Persisted posting; created atomically with its entry, never mutated
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Posting {
    pub id: PostingId,
    pub entry_id: EntryId,
    pub account_id: AccountId,
    pub amount: MinorUnits,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalEntry {
    pub id: EntryId,
    pub reference_id: ReferenceId,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
    /// Ordered; empty for entries that failed before application
    pub postings: Vec<Posting>,
    /// Business reason for a FAILED entry
    pub failure_reason: Option<String>,
}

impl JournalEntry {
    /// Build a PENDING entry from requested lines.
    ///
    /// Callers validate the lines first; zero-amount lines have no direction
    /// and are skipped here.
    pub fn pending(reference_id: ReferenceId, lines: &[PostingLine]) -> Self {
        let id = EntryId::new();
        let postings = lines
            .iter()
            .filter_map(|line| {
                Direction::from_amount(line.amount).map(|direction| Posting {
                    id: PostingId::new(),
                    entry_id: id,
                    account_id: line.account_id,
                    amount: line.amount,
                    direction,
                })
            })
            .collect();

        Self {
            id,
            reference_id,
            status: EntryStatus::Pending,
            created_at: Utc::now(),
            postings,
            failure_reason: None,
        }
    }

    /// FAILED entry with no postings, recorded so redelivery is detected
    pub fn failed(reference_id: ReferenceId, reason: impl Into<String>) -> Self {
        Self {
            id: EntryId::new(),
            reference_id,
            status: EntryStatus::Failed,
            created_at: Utc::now(),
            postings: Vec::new(),
            failure_reason: Some(reason.into()),
        }
    }

    /// Signed sum of all postings; `None` on overflow
    pub fn posting_sum(&self) -> Option<MinorUnits> {
        self.postings
            .iter()
            .try_fold(0i64, |acc, p| acc.checked_add(p.amount))
    }

    /// Net balance change per account, in first-seen order
    pub fn deltas(&self) -> Vec<(AccountId, MinorUnits)> {
        let mut deltas: Vec<(AccountId, MinorUnits)> = Vec::new();
        for posting in &self.postings {
            match deltas.iter_mut().find(|(id, _)| *id == posting.account_id) {
                Some((_, delta)) => *delta += posting.amount,
                None => deltas.push((posting.account_id, posting.amount)),
            }
        }
        deltas
    }
}

/// Account version observed by the journal engine before applying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedVersion {
    pub account_id: AccountId,
    pub version: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_id_roundtrip() {
        for s in [
            AccountStatus::Active,
            AccountStatus::Frozen,
            AccountStatus::Closed,
        ] {
            assert_eq!(AccountStatus::from_id(s.id()), Some(s));
        }
        for s in [EntryStatus::Pending, EntryStatus::Posted, EntryStatus::Failed] {
            assert_eq!(EntryStatus::from_id(s.id()), Some(s));
        }
        assert_eq!(AccountStatus::from_id(0), None);
        assert_eq!(EntryStatus::from_id(99), None);
    }

    #[test]
    fn test_direction_follows_sign() {
        assert_eq!(Direction::from_amount(-5), Some(Direction::Debit));
        assert_eq!(Direction::from_amount(5), Some(Direction::Credit));
        assert_eq!(Direction::from_amount(0), None);
    }

    #[test]
    fn test_pending_entry_postings_balance() {
        let a = AccountId::new();
        let b = AccountId::new();
        let entry = JournalEntry::pending(
            ReferenceId::new("r1"),
            &[PostingLine::debit(a, 3000), PostingLine::credit(b, 3000)],
        );

        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.postings.len(), 2);
        assert_eq!(entry.postings[0].direction, Direction::Debit);
        assert_eq!(entry.postings[0].amount, -3000);
        assert_eq!(entry.postings[1].direction, Direction::Credit);
        assert!(entry.postings.iter().all(|p| p.entry_id == entry.id));
        assert_eq!(entry.posting_sum(), Some(0));
    }

    #[test]
    fn test_deltas_merge_same_account() {
        let a = AccountId::new();
        let b = AccountId::new();
        let entry = JournalEntry::pending(
            ReferenceId::new("r2"),
            &[
                PostingLine::debit(a, 100),
                PostingLine::debit(a, 50),
                PostingLine::credit(b, 150),
            ],
        );
        assert_eq!(entry.deltas(), vec![(a, -150), (b, 150)]);
    }

    #[test]
    fn test_failed_entry_has_no_postings() {
        let entry = JournalEntry::failed(ReferenceId::new("r3"), "insufficient funds");
        assert_eq!(entry.status, EntryStatus::Failed);
        assert!(entry.postings.is_empty());
        assert_eq!(entry.failure_reason.as_deref(), Some("insufficient funds"));
    }
}
