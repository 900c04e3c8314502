//! OpenAPI / Swagger UI Documentation
//!
//! - Swagger UI: `http://localhost:8080/docs`
//! - OpenAPI JSON: `http://localhost:8080/api-docs/openapi.json`

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::gateway::handlers::{AccountView, HealthResponse};
use crate::transfer::{TransferReceipt, TransferRequest};

/// HS256 bearer token security scheme
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .description(Some("HS256 token, `sub` is the numeric user id"))
                        .build(),
                ),
            );
        }
    }
}

/// Main API Documentation struct
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Settlement Ledger API",
        version = "1.0.0",
        description = "Double-entry ledger with idempotent transfer submission and asynchronous settlement.",
        license(
            name = "MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Development"),
    ),
    paths(
        crate::gateway::handlers::health_check,
        crate::gateway::handlers::create_transfer,
        crate::gateway::handlers::get_transfer,
        crate::gateway::handlers::get_account,
    ),
    components(
        schemas(
            HealthResponse,
            TransferRequest,
            TransferReceipt,
            AccountView,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Transfer", description = "Transfer submission and status (auth required)"),
        (name = "Account", description = "Balance queries (auth required)"),
        (name = "System", description = "Health checks")
    )
)]
pub struct ApiDoc;
