//! Access token validation.
//!
//! Validates Access tokens using public keys fetched from the team's certs
//! endpoint.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Only RS256 is accepted, whatever the token header claims
//! - `aud` must contain the configured audience tag exactly
//! - `exp`, `nbf` and `iat` are validated with the configured clock skew
//! - Every rejection collapses to `AccessError::InvalidToken`; only
//!   unreachable keys surface as a different error

use crate::auth::claims::AccessClaims;
use crate::auth::jwks::{Jwk, JwksClient};
use crate::errors::{AccessError, RejectReason};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Maximum allowed JWT size in bytes (8KB).
///
/// Access tokens are typically well under 2KB. Oversized tokens are rejected
/// before any base64 decoding or signature work.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Maximum allowed clock skew tolerance (10 minutes).
///
/// Caps configuration so a typo cannot effectively disable expiry checks.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

/// Extract the `kid` (key ID) from a JWT header without verifying the signature.
///
/// # Security
///
/// - Token size is checked BEFORE any parsing
/// - This function does NOT validate the token signature
/// - The `kid` value is only used for lookup in the broker's key set
///
/// # Errors
///
/// - `TokenTooLarge` - Token exceeds `MAX_JWT_SIZE_BYTES`
/// - `Malformed` - Wrong structure, bad base64, or invalid JSON
/// - `MissingKid` - Header has no non-empty string `kid`
pub fn extract_kid(token: &str) -> Result<String, RejectReason> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "cf_access.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(RejectReason::TokenTooLarge);
    }

    // JWT format: header.payload.signature
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        tracing::debug!(
            target: "cf_access.jwt",
            parts = parts.len(),
            "Token rejected: invalid JWT format"
        );
        return Err(RejectReason::Malformed);
    }

    let header_part = parts.first().ok_or(RejectReason::Malformed)?;
    let header_bytes = URL_SAFE_NO_PAD.decode(header_part).map_err(|e| {
        tracing::debug!(target: "cf_access.jwt", error = %e, "Failed to decode JWT header base64");
        RejectReason::Malformed
    })?;

    let header: serde_json::Value = serde_json::from_slice(&header_bytes).map_err(|e| {
        tracing::debug!(target: "cf_access.jwt", error = %e, "Failed to parse JWT header JSON");
        RejectReason::Malformed
    })?;

    header
        .get("kid")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or(RejectReason::MissingKid)
}

/// Validate the `iat` (issued-at) claim with clock skew tolerance.
///
/// # Errors
///
/// Returns `RejectReason::IssuedInFuture` if `iat` is more than `clock_skew`
/// ahead of the local clock.
pub fn validate_iat(iat: i64, clock_skew: Duration) -> Result<(), RejectReason> {
    validate_iat_at(iat, clock_skew, chrono::Utc::now().timestamp())
}

/// Deterministic `iat` validation against an explicit `now` timestamp.
pub(crate) fn validate_iat_at(iat: i64, clock_skew: Duration, now: i64) -> Result<(), RejectReason> {
    // Bounded by MAX_CLOCK_SKEW in config
    let clock_skew_secs = i64::try_from(clock_skew.as_secs()).unwrap_or(i64::MAX);
    let max_iat = now.saturating_add(clock_skew_secs);

    if iat > max_iat {
        tracing::debug!(
            target: "cf_access.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(RejectReason::IssuedInFuture);
    }

    Ok(())
}

/// Token validator backed by the broker's key set.
pub struct JwtValidator {
    /// JWKS client for fetching public keys.
    jwks_client: Arc<JwksClient>,

    /// Clock skew tolerance for `exp`, `nbf` and `iat`.
    clock_skew: Duration,

    /// Expected `iss`; `None` disables the check.
    issuer: Option<String>,
}

impl JwtValidator {
    /// Create a new validator.
    ///
    /// # Arguments
    ///
    /// * `jwks_client` - Client for fetching public keys
    /// * `clock_skew` - Clock skew tolerance for time-based claims
    pub fn new(jwks_client: Arc<JwksClient>, clock_skew: Duration) -> Self {
        Self {
            jwks_client,
            clock_skew: clock_skew.min(MAX_CLOCK_SKEW),
            issuer: None,
        }
    }

    /// Require the `iss` claim to equal `issuer`.
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn jwks_client(&self) -> &Arc<JwksClient> {
        &self.jwks_client
    }

    /// Validate a token for `audience` and return its claims.
    ///
    /// # Security Checks
    ///
    /// 1. Size check and `kid` extraction from the untrusted header
    /// 2. Key lookup in the broker's key set (refreshing on unknown `kid`)
    /// 3. RS256 signature verification
    /// 4. `aud`, `exp`, `nbf` and optionally `iss` validation
    /// 5. `iat` validation with clock skew tolerance
    ///
    /// # Errors
    ///
    /// Returns `AccessError::InvalidToken` for every verification failure and
    /// `AccessError::KeyFetch` if the key set cannot be retrieved.
    #[instrument(skip_all)]
    pub async fn validate(&self, token: &str, audience: &str) -> Result<AccessClaims, AccessError> {
        // 1. Extract kid from header (includes size check)
        let kid = extract_kid(token).map_err(|reason| {
            tracing::debug!(target: "cf_access.jwt", reason = %reason, "Token kid extraction failed");
            AccessError::InvalidToken(reason)
        })?;

        // 2. Resolve the public key; fetch failures propagate unchanged
        let jwk = self.jwks_client.get_key(&kid).await?;

        // 3 + 4. Verify signature and registered claims
        let claims = verify_token(token, &jwk, audience, self.issuer.as_deref(), self.clock_skew)
            .map_err(AccessError::InvalidToken)?;

        // 5. iat is not checked by jsonwebtoken
        if let Some(iat) = claims.iat {
            validate_iat(iat, self.clock_skew).map_err(AccessError::InvalidToken)?;
        }

        tracing::debug!(target: "cf_access.jwt", "Token validated successfully");
        Ok(claims)
    }
}

/// Verify the token signature and registered claims against one JWK.
fn verify_token(
    token: &str,
    jwk: &Jwk,
    audience: &str,
    issuer: Option<&str>,
    clock_skew: Duration,
) -> Result<AccessClaims, RejectReason> {
    if jwk.kty != "RSA" {
        tracing::warn!(target: "cf_access.jwt", kty = %jwk.kty, "Unexpected JWK key type");
        return Err(RejectReason::UnsupportedKey);
    }
    if let Some(alg) = &jwk.alg {
        if alg != "RS256" {
            tracing::warn!(target: "cf_access.jwt", alg = %alg, "Unexpected JWK algorithm");
            return Err(RejectReason::UnsupportedKey);
        }
    }

    let (Some(n), Some(e)) = (jwk.n.as_deref(), jwk.e.as_deref()) else {
        tracing::error!(target: "cf_access.jwt", kid = ?jwk.kid, "JWK missing RSA components");
        return Err(RejectReason::UnsupportedKey);
    };

    let decoding_key = DecodingKey::from_rsa_components(n, e).map_err(|e| {
        tracing::error!(target: "cf_access.jwt", error = %e, "Invalid RSA key components");
        RejectReason::UnsupportedKey
    })?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&[audience]);
    validation.set_required_spec_claims(&["exp", "aud"]);
    validation.validate_exp = true;
    validation.validate_nbf = true;
    validation.leeway = clock_skew.as_secs();
    if let Some(issuer) = issuer {
        validation.set_issuer(&[issuer]);
    }

    let token_data = decode::<AccessClaims>(token, &decoding_key, &validation).map_err(|e| {
        let reason = reject_reason(e.kind());
        tracing::debug!(target: "cf_access.jwt", error = %e, reason = %reason, "Token verification failed");
        reason
    })?;

    Ok(token_data.claims)
}

fn reject_reason(kind: &ErrorKind) -> RejectReason {
    match kind {
        ErrorKind::InvalidSignature => RejectReason::BadSignature,
        ErrorKind::ExpiredSignature => RejectReason::Expired,
        ErrorKind::ImmatureSignature => RejectReason::NotYetValid,
        ErrorKind::InvalidAudience => RejectReason::WrongAudience,
        ErrorKind::InvalidIssuer => RejectReason::WrongIssuer,
        ErrorKind::MissingRequiredClaim(_) => RejectReason::MissingClaim,
        ErrorKind::InvalidAlgorithm | ErrorKind::MissingAlgorithm => {
            RejectReason::AlgorithmMismatch
        }
        ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidKeyFormat => RejectReason::UnsupportedKey,
        _ => RejectReason::Malformed,
    }
}
