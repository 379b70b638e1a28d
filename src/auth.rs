//! Bearer-token identity collaborator.
//!
//! The backend stores only SHA-256 hashes of API tokens, so it can verify
//! but not forge them. Token issuance happens once at registration; JWT
//! mechanics and password hashing live outside the core.

use crate::store::{Store, StoreError};
use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use ring::digest::{digest, SHA256};
use serde::Serialize;
use uuid::Uuid;

/// Hash a token using SHA-256 and return hex-encoded result
pub fn hash_token(token: &str) -> String {
    let hash = digest(&SHA256, token.as_bytes());
    hex::encode(hash.as_ref())
}

/// Generate a fresh opaque API token
pub fn generate_token() -> String {
    format!("hub_{}", Uuid::new_v4().simple())
}

/// Extract Bearer token from Authorization header
pub fn extract_bearer_token(authorization: &str) -> Option<&str> {
    authorization
        .strip_prefix("Bearer ")
        .or_else(|| authorization.strip_prefix("bearer "))
}

/// Authorization error
#[derive(Debug)]
pub enum AuthError {
    /// Missing Authorization header
    MissingHeader,
    /// Invalid Authorization header format
    InvalidHeader,
    /// Token does not resolve to an active user
    Unauthorized,
    /// Store failure during token lookup
    Internal,
}

impl From<StoreError> for AuthError {
    fn from(_: StoreError) -> Self {
        AuthError::Internal
    }
}

/// Resolve the calling user from the request headers.
///
/// Every user-scoped operation starts here; webhook ingestion does not
/// (it runs without a user context until contact linkage occurs).
pub async fn authenticate(store: &Store, headers: &HeaderMap) -> Result<i64, AuthError> {
    let header_value = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingHeader)?
        .to_str()
        .map_err(|_| AuthError::InvalidHeader)?;

    let token = extract_bearer_token(header_value).ok_or(AuthError::InvalidHeader)?;

    store
        .user_id_by_token_hash(&hash_token(token))
        .await?
        .ok_or(AuthError::Unauthorized)
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AuthError::MissingHeader => (
                StatusCode::UNAUTHORIZED,
                "MISSING_AUTH",
                "Authorization header required",
            ),
            AuthError::InvalidHeader => (
                StatusCode::BAD_REQUEST,
                "INVALID_AUTH",
                "Invalid Authorization header format",
            ),
            AuthError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Invalid or expired token",
            ),
            AuthError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "internal server error",
            ),
        };

        let body = Json(AuthErrorResponse {
            error: message.to_string(),
            code,
        });

        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct AuthErrorResponse {
    error: String,
    code: &'static str,
}
