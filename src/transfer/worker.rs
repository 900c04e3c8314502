//! Recovery Worker
//!
//! Background worker that scans for transfers stuck in non-terminal states
//! and moves them forward: concludes those whose journal entry is already
//! final, republishes the event for the rest.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::consumer::SettlementConsumer;
use super::error::TransferError;
use super::events::EventPublisher;
use super::repository::TransferRepository;
use super::state::TransferState;
use super::types::TransferRecord;
use crate::config::RecoveryConfig;
use crate::ledger::{EntryStatus, JournalEngine};

const ABANDON_REASON: &str = "event never published";
const VOID_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to scan for stale transfers
    pub scan_interval: Duration,
    /// How long a transfer must be untouched to be considered stale
    pub stale_threshold: Duration,
    /// Maximum transfers to process per scan
    pub batch_size: usize,
    /// VALIDATED transfers older than this are rejected instead of republished
    pub abandon_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&RecoveryConfig::default())
    }
}

impl From<&RecoveryConfig> for WorkerConfig {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            scan_interval: Duration::from_secs(config.scan_interval_secs.max(1)),
            stale_threshold: Duration::from_secs(config.stale_threshold_secs),
            batch_size: config.batch_size.max(1),
            abandon_after: Duration::from_secs(config.abandon_after_secs),
        }
    }
}

/// What one recovery step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Journal entry was final; transfer state synced to it
    Concluded,
    /// Event published again
    Republished,
    /// Never-published transfer given up on
    Abandoned,
}

pub struct RecoveryWorker {
    transfers: Arc<dyn TransferRepository>,
    engine: Arc<JournalEngine>,
    consumer: Arc<SettlementConsumer>,
    publisher: Arc<dyn EventPublisher>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(
        transfers: Arc<dyn TransferRepository>,
        engine: Arc<JournalEngine>,
        consumer: Arc<SettlementConsumer>,
        publisher: Arc<dyn EventPublisher>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            transfers,
            engine,
            consumer,
            publisher,
            config,
        }
    }

    /// Run the recovery loop forever
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            "Starting recovery worker"
        );

        loop {
            tokio::time::sleep(self.config.scan_interval).await;
            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Recovery scan failed");
            }
        }
    }

    /// Run a single scan. Returns how many transfers were acted on.
    pub async fn scan_and_recover(&self) -> Result<usize, TransferError> {
        let stale = self
            .transfers
            .find_stale(self.config.stale_threshold, self.config.batch_size)
            .await?;

        if stale.is_empty() {
            debug!("No stale transfers found");
            return Ok(0);
        }
        info!(count = stale.len(), "Found stale transfers to recover");

        let mut acted = 0;
        for record in &stale {
            match self.recover(record).await {
                Ok(step) => {
                    info!(
                        transfer_id = %record.transfer_id,
                        state = %record.state,
                        step = ?step,
                        "Transfer recovered"
                    );
                    acted += 1;
                }
                Err(e) => {
                    error!(transfer_id = %record.transfer_id, error = %e, "Failed to recover transfer");
                }
            }
        }
        Ok(acted)
    }

    async fn recover(&self, record: &TransferRecord) -> Result<Recovery, TransferError> {
        let event = record.event();

        if let Some(entry) = self.engine.find_entry(&event.reference_id).await?
            && entry.status.is_terminal()
        {
            self.consumer.sync_transfer(&event, &entry).await?;
            return Ok(Recovery::Concluded);
        }

        if record.state == TransferState::Validated && self.is_abandoned(record) {
            // A published copy of the event may still be in flight; the void
            // entry makes any later application a no-op
            let entry = self
                .engine
                .void_reference(
                    event.reference_id.clone(),
                    ABANDON_REASON,
                    tokio::time::Instant::now() + VOID_TIMEOUT,
                )
                .await?;
            if entry.status == EntryStatus::Posted {
                self.consumer.sync_transfer(&event, &entry).await?;
                return Ok(Recovery::Concluded);
            }

            warn!(transfer_id = %record.transfer_id, "Abandoning transfer that was never published");
            self.transfers
                .update_state_with_error(
                    record.transfer_id,
                    &[TransferState::Validated],
                    TransferState::Rejected,
                    ABANDON_REASON,
                )
                .await?;
            return Ok(Recovery::Abandoned);
        }

        self.publisher
            .publish(&event)
            .await
            .map_err(|e| TransferError::PublishFailed(e.to_string()))?;
        if record.state == TransferState::Validated {
            self.transfers
                .update_state_if(
                    record.transfer_id,
                    &[TransferState::Validated],
                    TransferState::EventPublished,
                )
                .await?;
        }
        self.transfers.touch(record.transfer_id).await?;
        Ok(Recovery::Republished)
    }

    fn is_abandoned(&self, record: &TransferRecord) -> bool {
        let age = chrono::Utc::now() - record.created_at;
        age.to_std()
            .map(|age| age >= self.config.abandon_after)
            .unwrap_or(false)
    }
}
