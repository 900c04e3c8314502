//! Settlement Ledger
//!
//! Double-entry ledger with optimistic concurrency, idempotent transfer
//! submission and event-driven settlement.
//!
//! # Modules
//!
//! - [`core_types`] - Identifiers and unit types (AccountId, UserId, etc.)
//! - [`money`] - Currency precision, decimal parsing and formatting
//! - [`ledger`] - Account Store and Journal Engine
//! - [`idempotency`] - Caller-scoped idempotency keys and cached outcomes
//! - [`transfer`] - Orchestrator, event transport, settlement consumer, recovery
//! - [`gateway`] - HTTP surface
//! - [`services`] - Wiring for PostgreSQL or in-memory deployments

// Core types - must be first!
pub mod core_types;

// Ambient
pub mod config;
pub mod db;
pub mod logging;

// Ledger and transfers
pub mod idempotency;
pub mod ledger;
pub mod money;
pub mod transfer;

// Serving
pub mod gateway;
pub mod services;

// Convenient re-exports at crate root
pub use core_types::{AccountId, EntryId, MinorUnits, PostingId, ReferenceId, TransferId, UserId};
pub use ledger::{AccountStore, JournalEngine, LedgerError};
pub use services::Services;
pub use transfer::{TransferError, TransferOrchestrator, TransferState};
