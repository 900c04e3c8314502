//! Transfer Error Types
//!
//! Caller-facing errors of the transfer orchestrator. Each variant carries a
//! stable string code, a numeric API code and an HTTP status.

use thiserror::Error;

use crate::idempotency::IdempotencyError;
use crate::ledger::{AccountStatus, LedgerError};
use crate::money::MoneyError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Source and destination account cannot be the same")]
    SameAccount,

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Amount precision exceeds currency limit of {max} decimals")]
    PrecisionOverflow { max: u32 },

    #[error("Amount would cause overflow")]
    Overflow,

    #[error("Unsupported currency: {0}")]
    UnknownCurrency(String),

    #[error("Account currency {account} does not match transfer currency {requested}")]
    CurrencyMismatch { account: String, requested: String },

    #[error("Destination account not found")]
    DestinationNotFound,

    #[error("Idempotency-Key header is required")]
    MissingIdempotencyKey,

    #[error("Invalid Idempotency-Key: {0}")]
    InvalidIdempotencyKey(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Auth Errors ===
    #[error("Caller not authenticated")]
    Unauthorized,

    #[error("Caller does not own the source account")]
    Forbidden,

    // === Account State ===
    #[error("Account is {0}")]
    AccountNotActive(AccountStatus),

    // === Idempotency ===
    #[error("Idempotency key reused with a different request")]
    IdempotencyKeyConflict,

    #[error("A request with this idempotency key is still in progress")]
    RequestInFlight,

    // === Lookup ===
    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    // === System Errors (retryable) ===
    #[error("Event publication failed: {0}")]
    PublishFailed(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Internal system error: {0}")]
    SystemError(String),
}

impl TransferError {
    /// Stable error code for API responses and logs
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::SameAccount => "SAME_ACCOUNT",
            TransferError::InvalidAmount => "INVALID_AMOUNT",
            TransferError::PrecisionOverflow { .. } => "PRECISION_OVERFLOW",
            TransferError::Overflow => "OVERFLOW",
            TransferError::UnknownCurrency(_) => "UNKNOWN_CURRENCY",
            TransferError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            TransferError::DestinationNotFound => "DESTINATION_NOT_FOUND",
            TransferError::MissingIdempotencyKey => "MISSING_IDEMPOTENCY_KEY",
            TransferError::InvalidIdempotencyKey(_) => "INVALID_IDEMPOTENCY_KEY",
            TransferError::InvalidRequest(_) => "INVALID_REQUEST",
            TransferError::Unauthorized => "UNAUTHORIZED",
            TransferError::Forbidden => "FORBIDDEN",
            TransferError::AccountNotActive(_) => "ACCOUNT_NOT_ACTIVE",
            TransferError::IdempotencyKeyConflict => "IDEMPOTENCY_KEY_CONFLICT",
            TransferError::RequestInFlight => "REQUEST_IN_FLIGHT",
            TransferError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            TransferError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            TransferError::PublishFailed(_) => "PUBLISH_FAILED",
            TransferError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            TransferError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            TransferError::SystemError(_) => "SYSTEM_ERROR",
        }
    }

    /// Numeric code for the `ApiResponse` envelope
    pub fn api_code(&self) -> i32 {
        use crate::gateway::response::error_codes::*;
        match self.http_status() {
            400 => INVALID_PARAMETER,
            401 => MISSING_AUTH,
            403 => FORBIDDEN,
            404 => NOT_FOUND,
            409 => IDEMPOTENCY_CONFLICT,
            422 => ACCOUNT_NOT_ACTIVE,
            503 => SERVICE_UNAVAILABLE,
            _ => INTERNAL_ERROR,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            TransferError::SameAccount
            | TransferError::InvalidAmount
            | TransferError::PrecisionOverflow { .. }
            | TransferError::Overflow
            | TransferError::UnknownCurrency(_)
            | TransferError::CurrencyMismatch { .. }
            | TransferError::DestinationNotFound
            | TransferError::MissingIdempotencyKey
            | TransferError::InvalidIdempotencyKey(_)
            | TransferError::InvalidRequest(_) => 400,
            TransferError::Unauthorized => 401,
            TransferError::Forbidden => 403,
            TransferError::TransferNotFound(_) | TransferError::AccountNotFound(_) => 404,
            TransferError::IdempotencyKeyConflict | TransferError::RequestInFlight => 409,
            TransferError::AccountNotActive(_) => 422,
            TransferError::PublishFailed(_)
            | TransferError::StorageUnavailable(_)
            | TransferError::DeadlineExceeded => 503,
            TransferError::SystemError(_) => 500,
        }
    }

    /// Message safe to show to callers; server-side detail stays in the logs
    pub fn public_message(&self) -> String {
        match self.http_status() {
            500 => "Internal error".to_string(),
            503 => "Temporarily unavailable, retry with the same Idempotency-Key".to_string(),
            _ => self.to_string(),
        }
    }

    /// Client retry with the same key may succeed
    pub fn is_retryable(&self) -> bool {
        self.http_status() == 503
    }
}

impl From<MoneyError> for TransferError {
    fn from(e: MoneyError) -> Self {
        match e {
            MoneyError::PrecisionOverflow { max, .. } => TransferError::PrecisionOverflow { max },
            MoneyError::InvalidAmount => TransferError::InvalidAmount,
            MoneyError::Overflow => TransferError::Overflow,
            MoneyError::UnknownCurrency(c) => TransferError::UnknownCurrency(c),
        }
    }
}

impl From<IdempotencyError> for TransferError {
    fn from(e: IdempotencyError) -> Self {
        match e {
            IdempotencyError::InvalidKey(msg) => TransferError::InvalidIdempotencyKey(msg),
            IdempotencyError::Storage(msg) => TransferError::StorageUnavailable(msg),
        }
    }
}

impl From<LedgerError> for TransferError {
    /// Ledger reads on the synchronous path; business rejections of the
    /// journal itself are settled asynchronously and never reach here.
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::AccountNotFound(id) => TransferError::AccountNotFound(id.to_string()),
            LedgerError::AccountNotActive { status, .. } => TransferError::AccountNotActive(status),
            LedgerError::DeadlineExceeded => TransferError::DeadlineExceeded,
            LedgerError::Storage(msg) => TransferError::StorageUnavailable(msg),
            other => TransferError::SystemError(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for TransferError {
    fn from(e: sqlx::Error) -> Self {
        TransferError::StorageUnavailable(e.to_string())
    }
}
