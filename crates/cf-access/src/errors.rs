//! Access error types.
//!
//! All errors map to appropriate HTTP status codes via the `IntoResponse` impl.
//! Error messages returned to clients are intentionally generic; the reason a
//! token was rejected is only ever logged and counted server-side.

use crate::config::ConfigError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Client-facing message for every token rejection.
pub const INVALID_TOKEN_MESSAGE: &str = "The access token is invalid or expired";

/// Why a token was rejected.
///
/// Diagnostic only: it feeds logs and metrics labels, but callers of
/// `authenticate` still see a plain `false` and clients a generic 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Neither the assertion header nor the cookie carried a token.
    MissingToken,
    TokenTooLarge,
    Malformed,
    MissingKid,
    /// The `kid` is not in the broker's key set, even after a refresh.
    UnknownKey,
    /// The published key is not an RSA signing key we can use.
    UnsupportedKey,
    AlgorithmMismatch,
    BadSignature,
    Expired,
    NotYetValid,
    IssuedInFuture,
    WrongAudience,
    WrongIssuer,
    MissingClaim,
}

impl RejectReason {
    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingToken => "missing_token",
            RejectReason::TokenTooLarge => "token_too_large",
            RejectReason::Malformed => "malformed",
            RejectReason::MissingKid => "missing_kid",
            RejectReason::UnknownKey => "unknown_key",
            RejectReason::UnsupportedKey => "unsupported_key",
            RejectReason::AlgorithmMismatch => "algorithm_mismatch",
            RejectReason::BadSignature => "bad_signature",
            RejectReason::Expired => "expired",
            RejectReason::NotYetValid => "not_yet_valid",
            RejectReason::IssuedInFuture => "issued_in_future",
            RejectReason::WrongAudience => "wrong_audience",
            RejectReason::WrongIssuer => "wrong_issuer",
            RejectReason::MissingClaim => "missing_claim",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access error type.
///
/// Maps to appropriate HTTP status codes:
/// - InvalidToken: 401 Unauthorized
/// - Forbidden: 403 Forbidden
/// - KeyFetch, IdentityFetch: 503 Service Unavailable
/// - Configuration, Internal: 500 Internal Server Error
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("Invalid token: {0}")]
    InvalidToken(RejectReason),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Signing key fetch failed: {0}")]
    KeyFetch(String),

    #[error("Identity fetch failed: {0}")]
    IdentityFetch(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal server error")]
    Internal,
}

impl AccessError {
    /// Returns the HTTP status code for this error (for metrics recording).
    pub fn status_code(&self) -> u16 {
        match self {
            AccessError::InvalidToken(_) => 401,
            AccessError::Forbidden(_) => 403,
            AccessError::KeyFetch(_) | AccessError::IdentityFetch(_) => 503,
            AccessError::Configuration(_) | AccessError::Internal => 500,
        }
    }

    /// True for failures that mean no decision could be made at all.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            AccessError::KeyFetch(_) | AccessError::IdentityFetch(_)
        )
    }
}

impl From<ConfigError> for AccessError {
    fn from(err: ConfigError) -> Self {
        AccessError::Configuration(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for AccessError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AccessError::InvalidToken(reason) => {
                tracing::debug!(target: "cf_access.errors", reason = %reason, "Rejecting unauthenticated request");
                (
                    StatusCode::UNAUTHORIZED,
                    "INVALID_TOKEN",
                    INVALID_TOKEN_MESSAGE.to_string(),
                )
            }
            AccessError::Forbidden(reason) => {
                (StatusCode::FORBIDDEN, "FORBIDDEN", reason.clone())
            }
            AccessError::KeyFetch(reason) | AccessError::IdentityFetch(reason) => {
                // Log actual reason server-side
                tracing::warn!(target: "cf_access.availability", reason = %reason, "Access broker unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Service temporarily unavailable".to_string(),
                )
            }
            AccessError::Configuration(reason) => {
                tracing::error!(target: "cf_access.config", reason = %reason, "Access is misconfigured");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIGURATION_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
            AccessError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            ),
        };

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };

        let mut response = (status, Json(error_response)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            if let Ok(header_value) = "Bearer realm=\"cloudflare-access\", error=\"invalid_token\"".parse() {
                response
                    .headers_mut()
                    .insert("WWW-Authenticate", header_value);
            }
        }

        response
    }
}
