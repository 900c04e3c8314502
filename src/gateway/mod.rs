//! HTTP gateway: routing, caller authentication and response mapping.

pub mod auth;
pub mod handlers;
pub mod openapi;
pub mod response;
pub mod state;

use anyhow::Context;
use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use auth::{Caller, Claims, TokenVerifier};
pub use state::AppState;

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    // Authenticated routes
    let private_routes = Router::new()
        .route("/transfers", post(handlers::create_transfer))
        .route("/transfers/{id}", get(handlers::get_transfer))
        .route("/accounts/{id}", get(handlers::get_account))
        .layer(from_fn_with_state(state.clone(), auth::jwt_auth_middleware));

    Router::new()
        .route("/health", get(handlers::health_check))
        .merge(private_routes)
        .with_state(state)
        // Stateless, added after with_state
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()))
}

/// Serve on an already bound listener until the server stops
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    tracing::info!(%addr, "Gateway listening");
    tracing::info!("API docs: http://{}/docs", addr);

    axum::serve(listener, router(state))
        .await
        .context("gateway server error")
}

/// Bind `host:port` and serve
pub async fn run_server(host: &str, port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {} (port in use?)", addr))?;
    serve(listener, state).await
}
