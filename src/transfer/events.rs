//! Transfer Event Transport
//!
//! At-least-once delivery of [`TransferInitiated`] events. The in-process
//! transport partitions by source account, so events touching the same
//! source are consumed in order by a single task. A negative acknowledgement
//! schedules a redelivery with linear backoff; after the configured number of
//! deliveries the event is dead-lettered and kept for operators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::types::TransferInitiated;
use crate::config::ConsumerConfig;
use crate::core_types::{AccountId, ReferenceId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Transport closed")]
    Closed,

    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &TransferInitiated) -> Result<(), PublishError>;
}

/// Consumer verdict for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Processed (or intentionally skipped); do not deliver again
    Ack,
    /// Transient failure; redeliver later
    Nack,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &TransferInitiated, attempt: u32) -> Ack;
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: TransferInitiated,
    /// 1-based delivery attempt
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub event: TransferInitiated,
    pub attempts: u32,
    pub dead_at: DateTime<Utc>,
}

pub type PartitionReceivers = Vec<mpsc::UnboundedReceiver<Delivery>>;

pub struct InProcessTransport {
    partitions: Vec<mpsc::UnboundedSender<Delivery>>,
    dead_letters: DashMap<ReferenceId, DeadLetter>,
    /// Published but not yet acknowledged or dead-lettered
    pending: AtomicUsize,
    max_deliveries: u32,
    redelivery_backoff: Duration,
}

impl InProcessTransport {
    pub fn new(config: &ConsumerConfig) -> (Arc<Self>, PartitionReceivers) {
        let count = config.partitions.max(1);
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..count).map(|_| mpsc::unbounded_channel()).unzip();

        let transport = Arc::new(Self {
            partitions: senders,
            dead_letters: DashMap::new(),
            pending: AtomicUsize::new(0),
            max_deliveries: config.max_deliveries.max(1),
            redelivery_backoff: config.redelivery_backoff(),
        });
        (transport, receivers)
    }

    pub fn partition_for(&self, account: AccountId) -> usize {
        (u128::from(account.inner()) % self.partitions.len() as u128) as usize
    }

    /// Spawn one consumer task per partition
    pub fn start(
        self: &Arc<Self>,
        receivers: PartitionReceivers,
        handler: Arc<dyn EventHandler>,
    ) -> Vec<JoinHandle<()>> {
        receivers
            .into_iter()
            .enumerate()
            .map(|(partition, rx)| {
                let transport = self.clone();
                let handler = handler.clone();
                tokio::spawn(async move { transport.run_partition(partition, rx, handler).await })
            })
            .collect()
    }

    async fn run_partition(
        self: Arc<Self>,
        partition: usize,
        mut rx: mpsc::UnboundedReceiver<Delivery>,
        handler: Arc<dyn EventHandler>,
    ) {
        debug!(partition = partition, "Event partition consumer started");
        while let Some(delivery) = rx.recv().await {
            match handler.handle(&delivery.event, delivery.attempt).await {
                Ack::Ack => {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                }
                Ack::Nack if delivery.attempt >= self.max_deliveries => {
                    error!(
                        reference = %delivery.event.reference_id,
                        attempts = delivery.attempt,
                        "Event dead-lettered after exhausting deliveries"
                    );
                    self.dead_letters.insert(
                        delivery.event.reference_id.clone(),
                        DeadLetter {
                            event: delivery.event,
                            attempts: delivery.attempt,
                            dead_at: Utc::now(),
                        },
                    );
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                }
                Ack::Nack => self.schedule_redelivery(partition, delivery),
            }
        }
        debug!(partition = partition, "Event partition consumer stopped");
    }

    fn schedule_redelivery(&self, partition: usize, delivery: Delivery) {
        let delay = self.redelivery_backoff * delivery.attempt;
        warn!(
            reference = %delivery.event.reference_id,
            attempt = delivery.attempt,
            delay_ms = delay.as_millis() as u64,
            "Event not acknowledged, scheduling redelivery"
        );
        let tx = self.partitions[partition].clone();
        let next = Delivery {
            event: delivery.event,
            attempt: delivery.attempt + 1,
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(next).is_err() {
                error!("Partition closed before redelivery");
            }
        });
    }

    /// Events that exhausted their deliveries
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        let mut letters: Vec<DeadLetter> =
            self.dead_letters.iter().map(|e| e.value().clone()).collect();
        letters.sort_by_key(|l| l.dead_at);
        letters
    }

    /// Re-inject a dead letter with a fresh delivery budget
    pub fn redrive(&self, reference: &ReferenceId) -> Result<bool, PublishError> {
        let Some((_, letter)) = self.dead_letters.remove(reference) else {
            return Ok(false);
        };
        self.enqueue(letter.event)?;
        Ok(true)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Wait until every published event has been acknowledged or
    /// dead-lettered. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let give_up = tokio::time::Instant::now() + timeout;
        while self.pending() > 0 {
            if tokio::time::Instant::now() >= give_up {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    fn enqueue(&self, event: TransferInitiated) -> Result<(), PublishError> {
        let partition = self.partition_for(event.source_account);
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.partitions[partition]
            .send(Delivery { event, attempt: 1 })
            .map_err(|_| {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                PublishError::Closed
            })
    }
}

#[async_trait]
impl EventPublisher for InProcessTransport {
    async fn publish(&self, event: &TransferInitiated) -> Result<(), PublishError> {
        self.enqueue(event.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::TransferId;
    use std::sync::atomic::AtomicU32;

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            partitions: 2,
            max_deliveries: 3,
            redelivery_backoff_ms: 1,
        }
    }

    fn event() -> TransferInitiated {
        let id = TransferId::new();
        TransferInitiated {
            reference_id: ReferenceId::from(id),
            transfer_id: id,
            source_account: AccountId::new(),
            destination_account: AccountId::new(),
            amount: 100,
            currency: "USD".to_string(),
            issued_at: Utc::now(),
        }
    }

    /// Nacks the first `fail_first` deliveries
    struct Flaky {
        fail_first: u32,
        seen: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for Flaky {
        async fn handle(&self, _event: &TransferInitiated, _attempt: u32) -> Ack {
            let n = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first { Ack::Nack } else { Ack::Ack }
        }
    }

    #[tokio::test]
    async fn test_nack_is_redelivered() {
        let (transport, receivers) = InProcessTransport::new(&config());
        let handler = Arc::new(Flaky {
            fail_first: 2,
            seen: AtomicU32::new(0),
        });
        transport.start(receivers, handler.clone());

        transport.publish(&event()).await.unwrap();
        assert!(transport.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(handler.seen.load(Ordering::SeqCst), 3);
        assert!(transport.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_event_dead_lettered_and_redriven() {
        let (transport, receivers) = InProcessTransport::new(&config());
        let handler = Arc::new(Flaky {
            fail_first: 3,
            seen: AtomicU32::new(0),
        });
        transport.start(receivers, handler.clone());

        let e = event();
        transport.publish(&e).await.unwrap();
        assert!(transport.wait_idle(Duration::from_secs(2)).await);

        let letters = transport.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].event, e);

        assert!(transport.redrive(&e.reference_id).unwrap());
        assert!(transport.wait_idle(Duration::from_secs(2)).await);
        assert!(transport.dead_letters().is_empty());
        assert_eq!(handler.seen.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_same_source_same_partition() {
        let (transport, _receivers) = InProcessTransport::new(&config());
        let account = AccountId::new();
        let p = transport.partition_for(account);
        assert!(p < 2);
        assert_eq!(transport.partition_for(account), p);
    }
}
