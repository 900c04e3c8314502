//! Caller identity from `Authorization: Bearer <jwt>`.
//!
//! Tokens are HS256 with the numeric user id in `sub`. Only verification
//! happens here; tokens are issued elsewhere.

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::response::{ApiResponse, error_codes};
use super::state::AppState;
use crate::core_types::UserId;

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String, // Subject (user_id as string)
    pub exp: usize,  // Expiration time (as UTC timestamp)
    pub iat: usize,  // Issued at
}

/// Authenticated caller, injected into request extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub UserId);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing Authorization header")]
    Missing,
    #[error("Invalid token format")]
    Malformed,
    #[error("Invalid or expired token")]
    Invalid,
}

impl AuthError {
    fn code(&self) -> i32 {
        match self {
            AuthError::Missing => error_codes::MISSING_AUTH,
            AuthError::Malformed | AuthError::Invalid => error_codes::AUTH_FAILED,
        }
    }
}

pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Caller, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "Token rejected");
            AuthError::Invalid
        })?;
        let user = data
            .claims
            .sub
            .parse::<UserId>()
            .map_err(|_| AuthError::Invalid)?;
        Ok(Caller(user))
    }

    /// Verify an `Authorization` header value
    pub fn verify_header(&self, value: Option<&str>) -> Result<Caller, AuthError> {
        let value = value.ok_or(AuthError::Missing)?;
        let token = value.strip_prefix("Bearer ").ok_or(AuthError::Malformed)?;
        self.verify(token.trim())
    }
}

pub async fn jwt_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, (StatusCode, Json<ApiResponse<()>>)> {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    match state.verifier.verify_header(header) {
        Ok(caller) => {
            request.extensions_mut().insert(caller);
            Ok(next.run(request).await)
        }
        Err(e) => Err((
            StatusCode::UNAUTHORIZED,
            Json(ApiResponse::<()>::error(e.code(), e.to_string())),
        )),
    }
}
