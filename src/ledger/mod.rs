//! Double-entry ledger
//!
//! - [`AccountStore`]: accounts with a monotonically increasing version,
//!   journal entries and postings
//! - [`JournalEngine`]: validates balanced entries and applies them under
//!   optimistic concurrency control
//!
//! Postings are immutable once written; an account's cached balance always
//! equals the signed sum of its postings.

pub mod error;
pub mod journal;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod types;

pub use error::LedgerError;
pub use journal::{BalanceCheck, JournalEngine, RetryPolicy, validate_lines};
pub use memory::InMemoryAccountStore;
pub use postgres::PgAccountStore;
pub use store::AccountStore;
pub use types::{
    Account, AccountStatus, Direction, EntryStatus, ExpectedVersion, JournalEntry, NewAccount,
    Posting, PostingLine,
};
