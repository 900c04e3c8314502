//! HTTP handlers

mod account;
mod health;
mod transfer;

pub use account::{AccountView, __path_get_account, get_account};
pub use health::{HealthResponse, __path_health_check, health_check};
pub use transfer::{
    IDEMPOTENCY_KEY_HEADER, __path_create_transfer, __path_get_transfer, create_transfer,
    get_transfer,
};
