//! Transfer handlers

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use super::super::auth::Caller;
use super::super::response::{ApiResponse, replay_response};
use super::super::state::AppState;
use crate::core_types::TransferId;
use crate::transfer::{Submission, TransferError, TransferReceipt, TransferRequest};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Submit a transfer
///
/// POST /transfers
///
/// Answers 202 once the transfer is persisted and its event published;
/// settlement happens asynchronously. A retry with the same
/// `Idempotency-Key` and body replays the first outcome.
#[utoipa::path(
    post,
    path = "/transfers",
    request_body = TransferRequest,
    params(
        ("Idempotency-Key" = String, Header, description = "Client-chosen key, 1-128 characters, unique per caller")
    ),
    responses(
        (status = 202, description = "Transfer accepted", body = TransferReceipt),
        (status = 400, description = "Invalid request or missing Idempotency-Key"),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 403, description = "Caller does not own the source account"),
        (status = 409, description = "Key reused with a different body, or original still in flight"),
        (status = 422, description = "Account frozen or closed"),
        (status = 503, description = "Temporarily unavailable, retry with the same key")
    ),
    security(("bearer_auth" = [])),
    tag = "Transfer"
)]
pub async fn create_transfer(
    State(state): State<Arc<AppState>>,
    Extension(Caller(caller)): Extension<Caller>,
    headers: HeaderMap,
    payload: Result<Json<TransferRequest>, JsonRejection>,
) -> Result<Response, TransferError> {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .ok_or(TransferError::MissingIdempotencyKey)?
        .to_str()
        .map_err(|_| TransferError::InvalidIdempotencyKey("not visible ASCII".to_string()))?;
    let Json(request) = payload.map_err(|e| TransferError::InvalidRequest(e.body_text()))?;

    tracing::info!(
        caller = caller,
        source = %request.source_account,
        destination = %request.destination_account,
        currency = %request.currency,
        "Transfer request"
    );

    match state.orchestrator.submit(caller, key, request).await? {
        Submission::Accepted(receipt) => {
            Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(receipt))).into_response())
        }
        Submission::Replayed(stored) => Ok(replay_response(stored)),
    }
}

/// Query transfer status
///
/// GET /transfers/{id}
#[utoipa::path(
    get,
    path = "/transfers/{id}",
    params(
        ("id" = String, Path, description = "Transfer id")
    ),
    responses(
        (status = 200, description = "Transfer status", body = TransferReceipt),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 404, description = "Unknown transfer, or not submitted by the caller")
    ),
    security(("bearer_auth" = [])),
    tag = "Transfer"
)]
pub async fn get_transfer(
    State(state): State<Arc<AppState>>,
    Extension(Caller(caller)): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<TransferReceipt>>, TransferError> {
    let transfer_id: TransferId = id
        .parse()
        .map_err(|_| TransferError::TransferNotFound(id.clone()))?;
    let receipt = state.orchestrator.transfer_status(caller, transfer_id).await?;
    Ok(Json(ApiResponse::success(receipt)))
}
