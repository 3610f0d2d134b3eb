//! Builder patterns for test data construction
//!
//! Provides fluent APIs for Access token payloads and identity documents.
//! Defaults mirror a real Access application token: valid for five more
//! minutes, issued five minutes ago.

use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};

/// Audience tag used by the test fixtures.
pub const TEST_AUDIENCE: &str = "32eafc7626e974616deaf0dc3ce63d7bcbed58a2731e84d06bc3cdf1b53c4228";

/// Team name used by the test fixtures.
pub const TEST_TEAM: &str = "yourteam";

pub const TEST_EMAIL: &str = "user@example.com";

pub const TEST_SUBJECT: &str = "7335d417-61da-459d-899c-0a01c76a2f94";

/// Builder for Access token claims
///
/// # Example
/// ```rust,ignore
/// let claims = TestTokenBuilder::new()
///     .with_audience("other-app")
///     .expires_in(-60)
///     .build();
/// let token = TestKeypair::broker().sign(&claims)?;
/// ```
pub struct TestTokenBuilder {
    aud: Vec<String>,
    email: Option<String>,
    sub: String,
    iss: String,
    exp: i64,
    iat: i64,
    nbf: Option<i64>,
    extra: Map<String, Value>,
}

impl TestTokenBuilder {
    /// Create a new token builder with defaults
    pub fn new() -> Self {
        let now = Utc::now();
        let issued = (now - Duration::seconds(300)).timestamp();
        Self {
            aud: vec![TEST_AUDIENCE.to_string()],
            email: Some(TEST_EMAIL.to_string()),
            sub: TEST_SUBJECT.to_string(),
            iss: format!("https://{}.cloudflareaccess.com", TEST_TEAM),
            exp: (now + Duration::seconds(300)).timestamp(),
            iat: issued,
            nbf: Some(issued),
            extra: Map::new(),
        }
    }

    /// Replace the audience list with a single tag
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.aud = vec![audience.to_string()];
        self
    }

    /// Add another audience tag
    pub fn and_audience(mut self, audience: &str) -> Self {
        self.aud.push(audience.to_string());
        self
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    pub fn for_user(mut self, subject: &str) -> Self {
        self.sub = subject.to_string();
        self
    }

    /// Service token shape: no email, empty subject, `common_name` set
    pub fn as_service_token(mut self, client_id: &str) -> Self {
        self.email = None;
        self.sub = String::new();
        self.extra
            .insert("common_name".to_string(), Value::String(client_id.to_string()));
        self
    }

    /// Set the issuer (team URL)
    pub fn issued_by(mut self, issuer: &str) -> Self {
        self.iss = issuer.to_string();
        self
    }

    /// Set expiration in seconds from now (negative for already expired)
    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.exp = (Utc::now() + Duration::seconds(seconds)).timestamp();
        self
    }

    /// Set not-before in seconds from now
    pub fn not_before_in(mut self, seconds: i64) -> Self {
        self.nbf = Some((Utc::now() + Duration::seconds(seconds)).timestamp());
        self
    }

    /// Set issued-at timestamp
    pub fn issued_at(mut self, timestamp: i64) -> Self {
        self.iat = timestamp;
        self
    }

    /// Set an arbitrary extra claim
    pub fn with_claim(mut self, name: &str, value: Value) -> Self {
        self.extra.insert(name.to_string(), value);
        self
    }

    /// Remove a claim from the built payload
    pub fn without(mut self, name: &str) -> Self {
        match name {
            "nbf" => self.nbf = None,
            "email" => self.email = None,
            _ => {
                self.extra.insert(name.to_string(), Value::Null);
            }
        }
        self
    }

    /// Build the claims as a JSON value
    pub fn build(self) -> Value {
        let mut claims = json!({
            "aud": self.aud,
            "sub": self.sub,
            "iss": self.iss,
            "exp": self.exp,
            "iat": self.iat,
            "type": "app",
            "identity_nonce": "6ei69kawdKzMIAPF",
            "country": "US",
        });

        if let Some(object) = claims.as_object_mut() {
            if let Some(email) = self.email {
                object.insert("email".to_string(), Value::String(email));
            }
            if let Some(nbf) = self.nbf {
                object.insert("nbf".to_string(), Value::from(nbf));
            }
            for (name, value) in self.extra {
                if value.is_null() {
                    object.remove(&name);
                } else {
                    object.insert(name, value);
                }
            }
        }

        claims
    }
}

impl Default for TestTokenBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity document as served by the broker's identity endpoint.
pub fn test_identity(email: &str, groups: &[&str]) -> Value {
    json!({
        "id": "P51Tuu01fWHMBjIBvrCK1lK-eUDWs2aQMv03WDqT5oY",
        "name": "Test User",
        "email": email,
        "user_uuid": TEST_SUBJECT,
        "account_id": "1c2f3e4d5a6b7c8d",
        "iat": Utc::now().timestamp(),
        "ip": "203.0.113.7",
        "idp": {"id": "b1e36b5e-8ad7-4b0e-8f4e-0d7e0bb4a001", "type": "github"},
        "geo": {"country": "US"},
        "groups": groups,
        "is_warp": false,
        "is_gateway": false,
        "version": 2
    })
}
