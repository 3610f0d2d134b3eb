//! Extended identity lookups.
//!
//! The broker's `/cdn-cgi/access/get-identity` endpoint returns the full
//! identity document behind a token (groups, identity provider, geo). It
//! authenticates the caller by the `CF_Authorization` cookie, so the raw
//! token is forwarded as that cookie. Documents are not cached.

use crate::errors::AccessError;
use crate::observability::metrics;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::instrument;

/// Cookie the broker reads the token from.
pub const ACCESS_COOKIE: &str = "CF_Authorization";

/// Identity provider that authenticated the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProvider {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub provider_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geo {
    #[serde(default)]
    pub country: Option<String>,
}

/// Group membership as reported by the identity provider.
///
/// Some providers report plain names, others objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdentityGroup {
    Named(String),
    Detailed {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        email: Option<String>,
    },
}

impl IdentityGroup {
    /// True if `name` equals the group's id, name or email.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            IdentityGroup::Named(group) => group == name,
            IdentityGroup::Detailed { id, name: n, email } => [id, n, email]
                .into_iter()
                .any(|field| field.as_deref() == Some(name)),
        }
    }
}

/// Identity document returned by the broker.
///
/// Named fields cover what Access documents for every identity provider;
/// provider-specific members (custom SAML/OIDC claims, device posture) land
/// in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idp: Option<IdentityProvider>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<Geo>,

    /// Empty when the provider reports no groups or `null`.
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub groups: Vec<IdentityGroup>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExtendedIdentity {
    /// Look up any top-level member of the document by name, typed or not.
    pub fn get(&self, field: &str) -> Option<Value> {
        if let Some(value) = self.extra.get(field) {
            return Some(value.clone());
        }
        match serde_json::to_value(self) {
            Ok(Value::Object(mut document)) => document.remove(field),
            _ => None,
        }
    }

    /// Membership test against the reported groups.
    pub fn in_group(&self, name: &str) -> bool {
        self.groups.iter().any(|group| group.matches(name))
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Client for the broker's identity endpoint.
pub struct IdentityClient {
    identity_url: String,
    http_client: reqwest::Client,
}

impl IdentityClient {
    pub fn new(identity_url: String, timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "cf_access.identity", error = %e, "Failed to build HTTP client with custom config, using defaults");
                reqwest::Client::new()
            });

        Self::with_http_client(identity_url, http_client)
    }

    pub fn with_http_client(identity_url: String, http_client: reqwest::Client) -> Self {
        Self {
            identity_url,
            http_client,
        }
    }

    pub fn identity_url(&self) -> &str {
        &self.identity_url
    }

    /// Fetch the identity document for `token`.
    ///
    /// The token is not validated here; callers that need that guarantee
    /// authenticate first.
    ///
    /// # Errors
    ///
    /// Returns `AccessError::IdentityFetch` on transport failure, a non-2xx
    /// status or an undecodable body.
    #[instrument(skip_all)]
    pub async fn fetch(&self, token: &SecretString) -> Result<ExtendedIdentity, AccessError> {
        let result = self.request(token).await;
        metrics::record_identity_fetch(if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn request(&self, token: &SecretString) -> Result<ExtendedIdentity, AccessError> {
        tracing::debug!(target: "cf_access.identity", url = %self.identity_url, "Fetching identity from broker");

        let response = self
            .http_client
            .get(&self.identity_url)
            .header(
                reqwest::header::COOKIE,
                format!("{}={}", ACCESS_COOKIE, token.expose_secret()),
            )
            .send()
            .await
            .map_err(|e| {
                tracing::error!(target: "cf_access.identity", error = %e, "Failed to reach identity endpoint");
                AccessError::IdentityFetch(format!("request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(target: "cf_access.identity", status = %status, "Identity endpoint returned error");
            return Err(AccessError::IdentityFetch(format!(
                "identity endpoint returned {}",
                status
            )));
        }

        response.json::<ExtendedIdentity>().await.map_err(|e| {
            tracing::error!(target: "cf_access.identity", error = %e, "Failed to parse identity document");
            AccessError::IdentityFetch(format!("invalid identity document: {}", e))
        })
    }
}
