//! Service wiring
//!
//! Builds the ledger, idempotency and transfer components for either the
//! PostgreSQL deployment or the in-memory single-instance mode, and starts
//! the background tasks.

use anyhow::Context;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::db::{Database, init_schema};
use crate::gateway::{AppState, TokenVerifier};
use crate::idempotency::{
    IdempotencyLayer, IdempotencyStore, InMemoryIdempotencyStore, PgIdempotencyStore,
};
use crate::ledger::{AccountStore, InMemoryAccountStore, JournalEngine, PgAccountStore, RetryPolicy};
use crate::money::CurrencyTable;
use crate::transfer::{
    InMemoryTransferRepository, InProcessTransport, PartitionReceivers, PgTransferRepository,
    RecoveryWorker, SettlementConsumer, TransferOrchestrator, TransferRepository, WorkerConfig,
};

/// Storage backends for one deployment
struct Backends {
    accounts: Arc<dyn AccountStore>,
    transfers: Arc<dyn TransferRepository>,
    idempotency: Arc<dyn IdempotencyStore>,
    pg_db: Option<Arc<Database>>,
}

pub struct Services {
    pub config: AppConfig,
    pub accounts: Arc<dyn AccountStore>,
    pub engine: Arc<JournalEngine>,
    pub transfers: Arc<dyn TransferRepository>,
    pub idempotency: Arc<IdempotencyLayer>,
    pub transport: Arc<InProcessTransport>,
    pub consumer: Arc<SettlementConsumer>,
    pub orchestrator: Arc<TransferOrchestrator>,
    pub recovery: Arc<RecoveryWorker>,
    pub pg_db: Option<Arc<Database>>,
    receivers: Option<PartitionReceivers>,
}

impl Services {
    /// PostgreSQL when `postgres_url` is set, in-memory otherwise
    pub async fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        match config.postgres_url.clone() {
            Some(url) => Self::postgres(config, &url).await,
            None => {
                tracing::warn!("No postgres_url configured, using in-memory stores (single instance only)");
                Ok(Self::in_memory(config))
            }
        }
    }

    pub fn in_memory(config: AppConfig) -> Self {
        let backends = Backends {
            accounts: Arc::new(InMemoryAccountStore::new()),
            transfers: Arc::new(InMemoryTransferRepository::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            pg_db: None,
        };
        Self::assemble(config, backends)
    }

    pub async fn postgres(config: AppConfig, url: &str) -> anyhow::Result<Self> {
        let db = Database::connect(url)
            .await
            .context("failed to connect to PostgreSQL")?;
        init_schema(db.pool()).await?;

        let pool = db.pool().clone();
        let backends = Backends {
            accounts: Arc::new(PgAccountStore::new(pool.clone())),
            transfers: Arc::new(PgTransferRepository::new(pool.clone())),
            idempotency: Arc::new(PgIdempotencyStore::new(pool)),
            pg_db: Some(Arc::new(db)),
        };
        Ok(Self::assemble(config, backends))
    }

    fn assemble(config: AppConfig, backends: Backends) -> Self {
        let engine = Arc::new(JournalEngine::new(
            backends.accounts.clone(),
            RetryPolicy::from(&config.ledger),
        ));
        let idempotency = Arc::new(IdempotencyLayer::new(
            backends.idempotency,
            &config.idempotency,
        ));
        let (transport, receivers) = InProcessTransport::new(&config.consumer);
        let consumer = Arc::new(SettlementConsumer::new(
            engine.clone(),
            backends.transfers.clone(),
            config.ledger.apply_timeout(),
        ));
        let orchestrator = Arc::new(TransferOrchestrator::new(
            backends.accounts.clone(),
            backends.transfers.clone(),
            idempotency.clone(),
            transport.clone(),
            CurrencyTable::new(config.currencies.clone()),
            &config.transfer,
        ));
        let recovery = Arc::new(RecoveryWorker::new(
            backends.transfers.clone(),
            engine.clone(),
            consumer.clone(),
            transport.clone(),
            WorkerConfig::from(&config.recovery),
        ));

        Self {
            config,
            accounts: backends.accounts,
            engine,
            transfers: backends.transfers,
            idempotency,
            transport,
            consumer,
            orchestrator,
            recovery,
            pg_db: backends.pg_db,
            receivers: Some(receivers),
        }
    }

    /// Start partition consumers, the idempotency purge task and the
    /// recovery worker. A second call starts nothing.
    pub fn start(&mut self) -> Vec<JoinHandle<()>> {
        let Some(receivers) = self.receivers.take() else {
            tracing::warn!("Services already started");
            return Vec::new();
        };

        let partitions = receivers.len();
        let mut handles = self.transport.start(receivers, self.consumer.clone());
        handles.push(
            self.idempotency
                .clone()
                .spawn_purge_task(self.config.idempotency.purge_interval()),
        );
        let recovery = self.recovery.clone();
        handles.push(tokio::spawn(async move {
            recovery.run().await;
        }));

        tracing::info!(partitions = partitions, "Settlement consumers and background tasks started");
        handles
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState::new(
            self.orchestrator.clone(),
            Arc::new(TokenVerifier::new(&self.config.jwt_secret)),
            self.pg_db.clone(),
        ))
    }
}
