//! Idempotency Layer
//!
//! Deduplicates money-moving requests by `(caller, Idempotency-Key)`. The
//! first request claims the key, executes, and caches its terminal outcome;
//! retries with the same body replay it, a different body is a conflict.

pub mod error;
pub mod layer;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod types;

pub use error::IdempotencyError;
pub use layer::IdempotencyLayer;
pub use memory::InMemoryIdempotencyStore;
pub use postgres::PgIdempotencyStore;
pub use store::IdempotencyStore;
pub use types::{BeginOutcome, MAX_KEY_LEN, ScopedKey, StoredResponse, request_hash};
