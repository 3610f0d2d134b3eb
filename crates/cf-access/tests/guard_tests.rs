//! Guard integration tests.
//!
//! Drives `require_auth` and `require_identity` end-to-end through a real
//! HTTP server backed by a mocked Access broker.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use cf_access::errors::INVALID_TOKEN_MESSAGE;
use cf_access_test_utils::*;
use serde_json::Value;

struct Fixture {
    broker: MockBroker,
    server: TestAccessServer,
    client: reqwest::Client,
}

impl Fixture {
    async fn start() -> Result<Self> {
        init_test_tracing();
        let broker = MockBroker::start().await;
        let server = TestAccessServer::spawn(broker.config()).await?;
        Ok(Self {
            broker,
            server,
            client: reqwest::Client::new(),
        })
    }

    fn token(&self) -> String {
        TestKeypair::broker()
            .sign(&self.broker.token_builder().build())
            .unwrap()
    }

    async fn get(&self, route: &str, token: Option<&str>) -> Result<reqwest::Response> {
        let mut request = self.client.get(format!("{}{}", self.server.url(), route));
        if let Some(token) = token {
            request = request.header("Cf-Access-Jwt-Assertion", token);
        }
        Ok(request.send().await?)
    }
}

// ============================================================================
// require_auth
// ============================================================================

#[tokio::test]
async fn test_public_route_needs_no_token() -> Result<()> {
    let fixture = Fixture::start().await?;

    let response = fixture.get("/public", None).await?;

    assert_eq!(response.status(), 200);
    assert_eq!(fixture.broker.total_requests().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_protected_route_without_token_is_401() -> Result<()> {
    let fixture = Fixture::start().await?;

    let response = fixture.get("/protected", None).await?;

    assert_eq!(response.status(), 401);
    let www_auth = response
        .headers()
        .get("www-authenticate")
        .expect("401 should carry WWW-Authenticate");
    assert!(www_auth.to_str()?.starts_with("Bearer"));

    let body: Value = response.json().await?;
    assert_eq!(body["error"]["code"], "INVALID_TOKEN");
    assert_eq!(body["error"]["message"], INVALID_TOKEN_MESSAGE);

    assert_eq!(fixture.broker.total_requests().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_protected_route_with_valid_header_token() -> Result<()> {
    let fixture = Fixture::start().await?;
    let token = fixture.token();

    let response = fixture.get("/protected", Some(&token)).await?;

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await?;
    assert_eq!(body["email"], TEST_EMAIL);
    assert_eq!(body["aud"][0], TEST_AUDIENCE);
    assert_eq!(body["service_token"], false);
    Ok(())
}

#[tokio::test]
async fn test_protected_route_with_cookie_token() -> Result<()> {
    let fixture = Fixture::start().await?;
    let token = fixture.token();

    let response = fixture
        .client
        .get(format!("{}/protected", fixture.server.url()))
        .header("Cookie", format!("theme=dark; CF_Authorization={}", token))
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    Ok(())
}

#[tokio::test]
async fn test_rejection_reason_is_not_disclosed() -> Result<()> {
    let fixture = Fixture::start().await?;

    let expired = TestKeypair::broker()
        .sign(&fixture.broker.token_builder().expires_in(-60).build())?;
    let wrong_audience = TestKeypair::broker()
        .sign(&fixture.broker.token_builder().with_audience("other").build())?;
    let rogue = TestKeypair::rogue().sign(&fixture.broker.token_builder().build())?;

    let mut bodies = Vec::new();
    for token in [&expired, &wrong_audience, &rogue] {
        let response = fixture.get("/protected", Some(token)).await?;
        assert_eq!(response.status(), 401);
        bodies.push(response.text().await?);
    }

    assert!(bodies.windows(2).all(|pair| pair.first() == pair.last()));
    Ok(())
}

#[tokio::test]
async fn test_protected_route_when_certs_unavailable_is_503() -> Result<()> {
    let fixture = Fixture::start().await?;
    let token = fixture.token();
    fixture.broker.fail_certs(502).await;

    let response = fixture.get("/protected", Some(&token)).await?;

    assert_eq!(response.status(), 503);
    let body: Value = response.json().await?;
    assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
    Ok(())
}

#[tokio::test]
async fn test_handler_reuses_bound_context_for_identity() -> Result<()> {
    let fixture = Fixture::start().await?;
    fixture
        .broker
        .mount_identity(test_identity(TEST_EMAIL, &["staff"]))
        .await;
    let token = fixture.token();

    let response = fixture.get("/whoami", Some(&token)).await?;

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await?;
    assert_eq!(body["email"], TEST_EMAIL);
    assert_eq!(body["groups"][0], "staff");
    assert_eq!(fixture.broker.certs_requests().await, 1);
    assert_eq!(fixture.broker.identity_requests().await, 1);
    Ok(())
}

// ============================================================================
// require_identity
// ============================================================================

#[tokio::test]
async fn test_admin_route_allows_matching_identity() -> Result<()> {
    let fixture = Fixture::start().await?;
    fixture
        .broker
        .mount_identity(test_identity(TEST_EMAIL, &[ADMIN_GROUP]))
        .await;
    let token = fixture.token();

    let response = fixture.get("/admin", Some(&token)).await?;

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await?;
    assert_eq!(body["email"], TEST_EMAIL);
    Ok(())
}

#[tokio::test]
async fn test_admin_route_forbids_non_matching_identity() -> Result<()> {
    let fixture = Fixture::start().await?;
    fixture
        .broker
        .mount_identity(test_identity(TEST_EMAIL, &["staff"]))
        .await;
    let token = fixture.token();

    let response = fixture.get("/admin", Some(&token)).await?;

    assert_eq!(response.status(), 403);
    assert!(response.headers().get("www-authenticate").is_none());
    let body: Value = response.json().await?;
    assert_eq!(body["error"]["code"], "FORBIDDEN");
    Ok(())
}

#[tokio::test]
async fn test_admin_route_without_token_is_401_and_skips_identity() -> Result<()> {
    let fixture = Fixture::start().await?;
    fixture
        .broker
        .mount_identity(test_identity(TEST_EMAIL, &[ADMIN_GROUP]))
        .await;

    let response = fixture.get("/admin", None).await?;

    assert_eq!(response.status(), 401);
    assert_eq!(fixture.broker.identity_requests().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_admin_route_with_invalid_token_is_401() -> Result<()> {
    let fixture = Fixture::start().await?;
    fixture
        .broker
        .mount_identity(test_identity(TEST_EMAIL, &[ADMIN_GROUP]))
        .await;
    let rogue = TestKeypair::rogue().sign(&fixture.broker.token_builder().build())?;

    let response = fixture.get("/admin", Some(&rogue)).await?;

    assert_eq!(response.status(), 401);
    assert_eq!(fixture.broker.identity_requests().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_admin_route_when_identity_unavailable_is_503() -> Result<()> {
    let fixture = Fixture::start().await?;
    fixture.broker.fail_identity(500).await;
    let token = fixture.token();

    let response = fixture.get("/admin", Some(&token)).await?;

    assert_eq!(response.status(), 503);
    Ok(())
}
