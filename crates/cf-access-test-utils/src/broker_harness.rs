//! Mock Cloudflare Access broker
//!
//! Serves `/cdn-cgi/access/certs` and `/cdn-cgi/access/get-identity` from a
//! `wiremock` server so tests exercise the real HTTP paths.

use crate::crypto_fixtures::TestKeypair;
use crate::token_builders::{TestTokenBuilder, TEST_AUDIENCE, TEST_TEAM};
use cf_access::config::{AccessConfig, CERTS_PATH, IDENTITY_PATH};
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{header_regex, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Mocked Access broker for one team.
///
/// # Example
/// ```rust,ignore
/// let broker = MockBroker::start().await;
/// let state = Arc::new(AccessState::new(broker.config()));
/// let token = TestKeypair::broker().sign(&broker.token_builder().build())?;
/// ```
pub struct MockBroker {
    server: MockServer,
}

impl MockBroker {
    /// Start a broker publishing the `TestKeypair::broker()` key.
    pub async fn start() -> Self {
        Self::start_with_keys(&[TestKeypair::broker()]).await
    }

    /// Start a broker publishing exactly `keys`.
    pub async fn start_with_keys(keys: &[TestKeypair]) -> Self {
        let broker = Self {
            server: MockServer::start().await,
        };
        broker.mount_certs(keys, None).await;
        broker
    }

    /// Replace everything mounted with a certs endpoint publishing `keys`.
    ///
    /// Also clears recorded requests and identity mounts.
    pub async fn publish(&self, keys: &[TestKeypair]) {
        self.server.reset().await;
        self.mount_certs(keys, None).await;
    }

    /// Like `publish`, but the certs endpoint answers after `delay`.
    pub async fn publish_slowly(&self, keys: &[TestKeypair], delay: Duration) {
        self.server.reset().await;
        self.mount_certs(keys, Some(delay)).await;
    }

    /// Make the certs endpoint answer with `status` and no key set.
    pub async fn fail_certs(&self, status: u16) {
        self.server.reset().await;
        Mock::given(method("GET"))
            .and(path(CERTS_PATH))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Serve `identity` to requests presenting a `CF_Authorization` cookie.
    pub async fn mount_identity(&self, identity: Value) {
        Mock::given(method("GET"))
            .and(path(IDENTITY_PATH))
            .and(header_regex("cookie", r"CF_Authorization=[^;\s]+"))
            .respond_with(ResponseTemplate::new(200).set_body_json(identity))
            .mount(&self.server)
            .await;
    }

    /// Make the identity endpoint answer with `status`.
    pub async fn fail_identity(&self, status: u16) {
        Mock::given(method("GET"))
            .and(path(IDENTITY_PATH))
            .respond_with(
                ResponseTemplate::new(status)
                    .set_body_json(json!({"err": "identity lookup failed"})),
            )
            .mount(&self.server)
            .await;
    }

    async fn mount_certs(&self, keys: &[TestKeypair], delay: Option<Duration>) {
        let body = json!({
            "keys": keys.iter().map(TestKeypair::jwk_json).collect::<Vec<_>>(),
            "public_cert": {"kid": "ignored", "cert": "-----BEGIN CERTIFICATE-----"},
            "public_certs": []
        });

        let mut response = ResponseTemplate::new(200).set_body_json(body);
        if let Some(delay) = delay {
            response = response.set_delay(delay);
        }

        Mock::given(method("GET"))
            .and(path(CERTS_PATH))
            .respond_with(response)
            .mount(&self.server)
            .await;
    }

    /// Base URL of the broker, standing in for `https://{team}.cloudflareaccess.com`.
    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Configuration for the test application, pointed at this broker.
    pub fn config(&self) -> AccessConfig {
        AccessConfig::new(TEST_AUDIENCE, TEST_TEAM)
            .and_then(|config| config.with_team_url(&self.uri()))
            .unwrap_or_else(|e| panic!("Failed to build test config: {}", e))
    }

    /// Token builder whose issuer matches this broker.
    pub fn token_builder(&self) -> TestTokenBuilder {
        TestTokenBuilder::new().issued_by(&self.uri())
    }

    /// Number of requests the certs endpoint has received.
    pub async fn certs_requests(&self) -> usize {
        self.requests_to(CERTS_PATH).await.len()
    }

    /// Number of requests the identity endpoint has received.
    pub async fn identity_requests(&self) -> usize {
        self.requests_to(IDENTITY_PATH).await.len()
    }

    /// `Cookie` headers the identity endpoint received, in order.
    pub async fn identity_cookies(&self) -> Vec<String> {
        self.requests_to(IDENTITY_PATH)
            .await
            .iter()
            .filter_map(|request| request.headers.get("cookie"))
            .filter_map(|value| value.to_str().ok())
            .map(ToString::to_string)
            .collect()
    }

    /// Total requests of any kind.
    pub async fn total_requests(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map(|requests| requests.len())
            .unwrap_or(0)
    }

    async fn requests_to(&self, request_path: &str) -> Vec<wiremock::Request> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|request| request.url.path() == request_path)
            .collect()
    }
}
