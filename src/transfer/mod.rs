//! Transfers
//!
//! Accepts transfer requests, persists them under idempotency protection and
//! settles them asynchronously through the journal engine.
//!
//! # State Machine
//!
//! ```text
//! RECEIVED ──► VALIDATED ──► EVENT_PUBLISHED ──► SETTLED
//!    │            │                │
//!    ▼            ▼                ▼
//! REJECTED     REJECTED          FAILED
//! ```
//!
//! A consumer running ahead of the publisher may conclude a VALIDATED
//! transfer directly.
//!
//! The orchestrator answers the caller once the event is published. The
//! settlement consumer moves the transfer to SETTLED or FAILED; the recovery
//! worker republishes events for transfers that stopped moving.
//!
//! # Safety Invariants
//!
//! 1. **Persist-Before-Publish**: the transfer row exists before its event does
//! 2. **One Entry Per Transfer**: the journal reference is the transfer id
//! 3. **CAS Transitions**: every state change names the states it moves from

pub mod consumer;
pub mod db;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod repository;
pub mod state;
pub mod types;
pub mod worker;


pub use consumer::SettlementConsumer;
pub use db::PgTransferRepository;
pub use error::TransferError;
pub use events::{
    Ack, DeadLetter, EventHandler, EventPublisher, InProcessTransport, PartitionReceivers,
    PublishError,
};
pub use orchestrator::{Submission, TransferOrchestrator};
pub use repository::{InMemoryTransferRepository, TransferRepository};
pub use state::TransferState;
pub use types::{TransferInitiated, TransferReceipt, TransferRecord, TransferRequest};
pub use worker::{RecoveryWorker, WorkerConfig};
