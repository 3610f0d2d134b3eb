//! JWKS client for fetching and caching the broker's signing keys.
//!
//! Keys are fetched from the team's `/cdn-cgi/access/certs` endpoint on first
//! use and whenever a token names a key ID the cache does not know. Cloudflare
//! rotates keys by publishing the new one before using it, so an unknown `kid`
//! is the refresh signal; there is no TTL.
//!
//! # Concurrency
//!
//! - The cached set is an immutable `SigningKeySet` behind an `Arc`; a refresh
//!   swaps the `Arc`, so readers see either the old or the new set
//! - Refreshes are serialized by a fetch lock. A waiter that finds a newer
//!   generation than the one it missed on reuses it instead of fetching again

use crate::errors::{AccessError, RejectReason};
use crate::observability::metrics;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

/// Default timeout for the key set request.
const DEFAULT_FETCH_TIMEOUT_SECONDS: u64 = 10;

/// JSON Web Key from the certs endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Jwk {
    /// Key type (always "RSA" for Access).
    pub kty: String,

    /// Key ID - used to select the correct key for verification.
    #[serde(default)]
    pub kid: Option<String>,

    /// Algorithm (should be "RS256").
    #[serde(default)]
    pub alg: Option<String>,

    /// Key use (should be "sig" for signing).
    #[serde(default, rename = "use")]
    pub key_use: Option<String>,

    /// RSA modulus (base64url encoded).
    #[serde(default)]
    pub n: Option<String>,

    /// RSA public exponent (base64url encoded).
    #[serde(default)]
    pub e: Option<String>,
}

/// Certs document. Access also publishes `public_cert(s)` PEM copies, ignored here.
#[derive(Debug, Clone, Deserialize)]
pub struct JwksResponse {
    /// List of JSON Web Keys.
    pub keys: Vec<Jwk>,
}

/// Immutable snapshot of the broker's signing keys.
#[derive(Debug)]
pub struct SigningKeySet {
    /// Map of key ID to JWK.
    keys: HashMap<String, Arc<Jwk>>,

    /// Incremented on every successful refresh.
    generation: u64,

    fetched_at: Instant,
}

impl SigningKeySet {
    fn from_response(jwks: JwksResponse, generation: u64) -> Self {
        let keys = jwks
            .keys
            .into_iter()
            .filter_map(|key| match key.kid.clone() {
                Some(kid) if !kid.is_empty() => Some((kid, Arc::new(key))),
                _ => {
                    tracing::debug!(target: "cf_access.jwks", kty = %key.kty, "Skipping JWK without kid");
                    None
                }
            })
            .collect();

        Self {
            keys,
            generation,
            fetched_at: Instant::now(),
        }
    }

    pub fn get(&self, kid: &str) -> Option<Arc<Jwk>> {
        self.keys.get(kid).cloned()
    }

    pub fn contains(&self, kid: &str) -> bool {
        self.keys.contains_key(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Time since this set was fetched.
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

/// JWKS client for fetching and caching the broker's public keys.
///
/// Shared by all requests of one application.
pub struct JwksClient {
    /// URL to the certs endpoint.
    jwks_url: String,

    /// HTTP client for fetching JWKS.
    http_client: reqwest::Client,

    /// Currently published key set.
    cache: RwLock<Option<Arc<SigningKeySet>>>,

    /// Serializes refreshes.
    fetch_lock: Mutex<()>,
}

impl JwksClient {
    /// Create a new JWKS client with the default fetch timeout.
    ///
    /// # Arguments
    ///
    /// * `jwks_url` - URL to the team's certs endpoint
    pub fn new(jwks_url: String) -> Self {
        Self::with_timeout(jwks_url, Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECONDS))
    }

    /// Create a new JWKS client with a custom fetch timeout.
    pub fn with_timeout(jwks_url: String, timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "cf_access.jwks", error = %e, "Failed to build HTTP client with custom config, using defaults");
                reqwest::Client::new()
            });

        Self::with_http_client(jwks_url, http_client)
    }

    /// Create a new JWKS client sharing an existing HTTP client.
    pub fn with_http_client(jwks_url: String, http_client: reqwest::Client) -> Self {
        Self {
            jwks_url,
            http_client,
            cache: RwLock::new(None),
            fetch_lock: Mutex::new(()),
        }
    }

    pub fn jwks_url(&self) -> &str {
        &self.jwks_url
    }

    /// Get a JWK by key ID.
    ///
    /// Serves from cache when the key is known; otherwise refreshes the key
    /// set once and looks again.
    ///
    /// # Errors
    ///
    /// Returns `AccessError::KeyFetch` if the key set cannot be fetched.
    /// Returns `AccessError::InvalidToken(UnknownKey)` if the key ID is not
    /// published even after a refresh.
    #[instrument(skip(self), fields(kid = %kid))]
    pub async fn get_key(&self, kid: &str) -> Result<Arc<Jwk>, AccessError> {
        // Check cache first
        let seen_generation = {
            let cache = self.cache.read().await;
            match cache.as_ref() {
                Some(keys) => {
                    if let Some(key) = keys.get(kid) {
                        tracing::debug!(target: "cf_access.jwks", "JWKS cache hit");
                        return Ok(key);
                    }
                    keys.generation
                }
                None => 0,
            }
        };

        let _guard = self.fetch_lock.lock().await;

        // Another request may have refreshed while we waited for the lock
        let keys = match self.snapshot().await {
            Some(current) if current.generation != seen_generation => current,
            _ => self.refresh_cache().await?,
        };

        keys.get(kid).ok_or_else(|| {
            tracing::warn!(target: "cf_access.jwks", "Key not found in JWKS after refresh");
            AccessError::InvalidToken(RejectReason::UnknownKey)
        })
    }

    /// Force refresh the cache.
    ///
    /// # Errors
    ///
    /// Returns `AccessError::KeyFetch` if the key set cannot be fetched.
    pub async fn force_refresh(&self) -> Result<Arc<SigningKeySet>, AccessError> {
        let _guard = self.fetch_lock.lock().await;
        self.refresh_cache().await
    }

    /// Currently cached key set, if any has been fetched.
    pub async fn cached_keys(&self) -> Option<Arc<SigningKeySet>> {
        self.snapshot().await
    }

    async fn snapshot(&self) -> Option<Arc<SigningKeySet>> {
        self.cache.read().await.clone()
    }

    /// Fetch the key set and publish it. Caller must hold `fetch_lock`.
    #[instrument(skip(self))]
    async fn refresh_cache(&self) -> Result<Arc<SigningKeySet>, AccessError> {
        tracing::debug!(target: "cf_access.jwks", url = %self.jwks_url, "Fetching JWKS from broker");
        let start = Instant::now();

        let result = self.fetch().await;
        metrics::record_jwks_fetch(
            if result.is_ok() { "success" } else { "error" },
            start.elapsed(),
        );
        let jwks = result?;

        let next_generation = self
            .snapshot()
            .await
            .map_or(1, |current| current.generation + 1);
        let keys = Arc::new(SigningKeySet::from_response(jwks, next_generation));

        tracing::info!(
            target: "cf_access.jwks",
            key_count = keys.len(),
            generation = keys.generation,
            "JWKS cache refreshed"
        );

        // Publish atomically: readers hold either the old or the new Arc
        let mut cache = self.cache.write().await;
        *cache = Some(Arc::clone(&keys));

        Ok(keys)
    }

    async fn fetch(&self) -> Result<JwksResponse, AccessError> {
        let response = self
            .http_client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(target: "cf_access.jwks", error = %e, "Failed to fetch JWKS");
                AccessError::KeyFetch(format!("request failed: {}", e))
            })?;

        if !response.status().is_success() {
            tracing::error!(
                target: "cf_access.jwks",
                status = %response.status(),
                "JWKS endpoint returned error"
            );
            return Err(AccessError::KeyFetch(format!(
                "certs endpoint returned {}",
                response.status()
            )));
        }

        response.json::<JwksResponse>().await.map_err(|e| {
            tracing::error!(target: "cf_access.jwks", error = %e, "Failed to parse JWKS response");
            AccessError::KeyFetch(format!("invalid key set document: {}", e))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_jwk_deserialization() {
        let json = r#"{
            "kid": "b1f0d3b5b0e1c2",
            "kty": "RSA",
            "alg": "RS256",
            "use": "sig",
            "e": "AQAB",
            "n": "uL7La0_dFr6kyBv_xiDTtgho5IFWVm2l7qqiMKtGlgVP7DPEtdZgJlZRUicvN41C"
        }"#;

        let jwk: Jwk = serde_json::from_str(json).unwrap();

        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.kid.as_deref(), Some("b1f0d3b5b0e1c2"));
        assert_eq!(jwk.alg.as_deref(), Some("RS256"));
        assert_eq!(jwk.key_use.as_deref(), Some("sig"));
        assert_eq!(jwk.e.as_deref(), Some("AQAB"));
        assert!(jwk.n.is_some());
    }

    #[test]
    fn test_jwk_deserialization_minimal() {
        let jwk: Jwk = serde_json::from_str(r#"{"kty": "RSA"}"#).unwrap();

        assert_eq!(jwk.kty, "RSA");
        assert!(jwk.kid.is_none());
        assert!(jwk.alg.is_none());
        assert!(jwk.n.is_none());
        assert!(jwk.e.is_none());
    }

    #[test]
    fn test_jwks_response_ignores_public_certs() {
        let json = r#"{
            "keys": [
                {"kty": "RSA", "kid": "key-1", "e": "AQAB", "n": "abc"},
                {"kty": "RSA", "kid": "key-2", "e": "AQAB", "n": "def"}
            ],
            "public_cert": {"kid": "key-1", "cert": "-----BEGIN CERTIFICATE-----"},
            "public_certs": [{"kid": "key-1", "cert": "-----BEGIN CERTIFICATE-----"}]
        }"#;

        let jwks: JwksResponse = serde_json::from_str(json).unwrap();

        assert_eq!(jwks.keys.len(), 2);
        assert_eq!(jwks.keys.first().unwrap().kid.as_deref(), Some("key-1"));
    }

    #[test]
    fn test_signing_key_set_skips_keys_without_kid() {
        let jwks: JwksResponse = serde_json::from_str(
            r#"{"keys": [
                {"kty": "RSA", "kid": "key-1"},
                {"kty": "RSA"},
                {"kty": "RSA", "kid": ""}
            ]}"#,
        )
        .unwrap();

        let set = SigningKeySet::from_response(jwks, 3);

        assert_eq!(set.len(), 1);
        assert!(set.contains("key-1"));
        assert!(set.get("key-2").is_none());
        assert_eq!(set.generation(), 3);
        assert_eq!(set.key_ids().collect::<Vec<_>>(), vec!["key-1"]);
    }

    #[test]
    fn test_jwks_client_creation() {
        let client = JwksClient::new(
            "https://yourteam.cloudflareaccess.com/cdn-cgi/access/certs".to_string(),
        );
        assert_eq!(
            client.jwks_url(),
            "https://yourteam.cloudflareaccess.com/cdn-cgi/access/certs"
        );
    }

    #[tokio::test]
    async fn test_cache_starts_empty() {
        let client = JwksClient::new("http://127.0.0.1:1/cdn-cgi/access/certs".to_string());
        assert!(client.cached_keys().await.is_none());
    }

    #[tokio::test]
    async fn test_get_key_unreachable_broker_is_key_fetch_error() {
        // Port 1 is reserved; the connection is refused immediately
        let client = JwksClient::with_timeout(
            "http://127.0.0.1:1/cdn-cgi/access/certs".to_string(),
            Duration::from_secs(2),
        );

        let result = client.get_key("any-kid").await;
        assert!(
            matches!(result, Err(AccessError::KeyFetch(_))),
            "Expected KeyFetch, got {:?}",
            result
        );
        assert!(client.cached_keys().await.is_none());
    }
}
