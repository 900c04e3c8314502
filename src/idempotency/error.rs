use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyError {
    #[error("Invalid idempotency key: {0}")]
    InvalidKey(String),

    #[error("Idempotency storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for IdempotencyError {
    fn from(e: sqlx::Error) -> Self {
        IdempotencyError::Storage(e.to_string())
    }
}
