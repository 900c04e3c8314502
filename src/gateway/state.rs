use std::sync::Arc;

use super::auth::TokenVerifier;
use crate::db::Database;
use crate::transfer::TransferOrchestrator;

/// Gateway shared state
#[derive(Clone)]
pub struct AppState {
    /// Transfer submission and reads
    pub orchestrator: Arc<TransferOrchestrator>,
    /// Bearer token verification
    pub verifier: Arc<TokenVerifier>,
    /// PostgreSQL pool, absent for in-memory deployments
    pub pg_db: Option<Arc<Database>>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<TransferOrchestrator>,
        verifier: Arc<TokenVerifier>,
        pg_db: Option<Arc<Database>>,
    ) -> Self {
        Self {
            orchestrator,
            verifier,
            pg_db,
        }
    }
}
