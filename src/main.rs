//! Settlement Ledger service
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌────────────┐    ┌──────────┐
//! │ Gateway  │───▶│ Orchestrator │───▶│ Transport  │───▶│ Consumer │
//! │  (HTTP)  │    │ (idempotent) │    │(partitions)│    │(journal) │
//! └──────────┘    └──────────────┘    └────────────┘    └──────────┘
//! ```
//!
//! Usage: `settlement_ledger [--env <name>] [--port <port>]`

use anyhow::Context;
use settlement_ledger::config::AppConfig;
use settlement_ledger::services::Services;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Get port override from command line (--port argument)
fn get_port_override() -> anyhow::Result<Option<u16>> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            let port = args[i + 1]
                .parse()
                .with_context(|| format!("invalid --port value: {}", args[i + 1]))?;
            return Ok(Some(port));
        }
    }
    Ok(None)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = settlement_ledger::logging::init_logging(&app_config);

    tracing::info!("Starting settlement ledger in {} mode", env);

    let port = get_port_override()?.unwrap_or(app_config.gateway.port);
    let host = app_config.gateway.host.clone();

    let mut services = Services::from_config(app_config).await?;
    let _tasks = services.start();
    let state = services.app_state();

    settlement_ledger::gateway::run_server(&host, port, state).await
}
