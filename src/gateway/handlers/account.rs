//! Account handlers

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
};
use serde::Serialize;
use utoipa::ToSchema;

use super::super::auth::Caller;
use super::super::response::ApiResponse;
use super::super::state::AppState;
use crate::core_types::AccountId;
use crate::ledger::Account;
use crate::money::format_minor;
use crate::transfer::TransferError;

/// Account balance as shown to its owner
#[derive(Debug, Serialize, ToSchema)]
pub struct AccountView {
    #[schema(value_type = String)]
    pub account_id: AccountId,
    #[schema(example = "USD")]
    pub currency: String,
    /// ACTIVE | FROZEN | CLOSED
    pub status: String,
    /// Decimal balance in major units
    #[schema(example = "70.00")]
    pub balance: String,
    pub version: i64,
    pub overdraft_allowed: bool,
}

impl AccountView {
    fn from_account(account: &Account, decimals: u32) -> Self {
        Self {
            account_id: account.id,
            currency: account.currency.clone(),
            status: account.status.as_str().to_string(),
            balance: format_minor(account.cached_balance, decimals),
            version: account.version,
            overdraft_allowed: account.overdraft_allowed,
        }
    }
}

/// Read an account balance
///
/// GET /accounts/{id}
#[utoipa::path(
    get,
    path = "/accounts/{id}",
    params(
        ("id" = String, Path, description = "Account id")
    ),
    responses(
        (status = 200, description = "Account balance", body = AccountView),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 404, description = "Unknown account, or not owned by the caller")
    ),
    security(("bearer_auth" = [])),
    tag = "Account"
)]
pub async fn get_account(
    State(state): State<Arc<AppState>>,
    Extension(Caller(caller)): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<AccountView>>, TransferError> {
    let account_id: AccountId = id
        .parse()
        .map_err(|_| TransferError::AccountNotFound(id.clone()))?;
    let account = state
        .orchestrator
        .account_for_owner(caller, account_id)
        .await?;
    let decimals = state
        .orchestrator
        .currencies()
        .decimals(&account.currency)
        .map_err(|e| TransferError::SystemError(e.to_string()))?;
    Ok(Json(ApiResponse::success(AccountView::from_account(
        &account, decimals,
    ))))
}
