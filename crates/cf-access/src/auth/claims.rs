//! Access token claims.
//!
//! Contains the claims extracted from validated Access tokens. The `sub`
//! and `email` fields are redacted in Debug output to keep them out of logs.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Claims of a validated Cloudflare Access token.
///
/// Lives for the duration of one request; never persisted.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Audience tags; Access always emits an array, a bare string is accepted too.
    ///
    /// Absent audiences decode as empty so validation reports the missing
    /// claim instead of a malformed payload.
    #[serde(default, deserialize_with = "one_or_many")]
    pub aud: Vec<String>,

    /// Subject (user UUID, empty for service tokens) - redacted in Debug output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Authenticated user's email - redacted in Debug output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Expiration timestamp (Unix epoch seconds).
    #[serde(default)]
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Not-before timestamp (Unix epoch seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    /// Issuer, the team URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Token type (`app` for application tokens).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    /// Nonce binding the token to its identity document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_nonce: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,

    /// Client ID of the service token, set instead of `email` for service auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,

    /// Broker-specific claims not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl fmt::Debug for AccessClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessClaims")
            .field("aud", &self.aud)
            .field("sub", &self.sub.as_ref().map(|_| "[REDACTED]"))
            .field("email", &self.email.as_ref().map(|_| "[REDACTED]"))
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .field("nbf", &self.nbf)
            .field("iss", &self.iss)
            .field("token_type", &self.token_type)
            .field("common_name", &self.common_name)
            .finish_non_exhaustive()
    }
}

impl AccessClaims {
    /// Exact membership test; no prefix or substring matching.
    pub fn has_audience(&self, audience: &str) -> bool {
        self.aud.iter().any(|a| a == audience)
    }

    /// Service tokens carry a `common_name` and no user email.
    pub fn is_service_token(&self) -> bool {
        self.common_name.is_some() && self.email.is_none()
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(aud) => vec![aud],
        OneOrMany::Many(aud) => aud,
    })
}
