//! Test server harness for E2E testing
//!
//! Provides `TestAccessServer`, a real axum server on an ephemeral port with
//! routes behind each Access guard.

use axum::{
    extract::Extension,
    middleware,
    routing::get,
    Json, Router,
};
use cf_access::config::AccessConfig;
use cf_access::errors::{AccessError, RejectReason};
use cf_access::middleware::{require_auth, require_identity, AccessContext, AccessState, IdentityGuard};
use cf_access::{AccessClaims, ExtendedIdentity};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Group `/admin` requires.
pub const ADMIN_GROUP: &str = "admins";

/// Test harness for spawning an Access-protected server in E2E tests.
///
/// Routes:
/// - `GET /public` - no guard
/// - `GET /protected` - `require_auth`, echoes the bound claims
/// - `GET /whoami` - `require_auth`, fetches the identity through `AccessContext`
/// - `GET /admin` - `require_identity` with a membership check on `ADMIN_GROUP`
///
/// # Example
/// ```rust,ignore
/// let broker = MockBroker::start().await;
/// let server = TestAccessServer::spawn(broker.config()).await?;
///
/// let response = reqwest::get(format!("{}/protected", server.url())).await?;
/// assert_eq!(response.status(), 401);
/// ```
pub struct TestAccessServer {
    addr: SocketAddr,
    state: Arc<AccessState>,
    _handle: JoinHandle<()>,
}

impl TestAccessServer {
    /// Spawn a new test server for `config`.
    ///
    /// The server binds to 127.0.0.1:0 and runs in the background until
    /// dropped.
    pub async fn spawn(config: AccessConfig) -> Result<Self, anyhow::Error> {
        let state = Arc::new(AccessState::new(config));
        let app = build_routes(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            state,
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shared Access state, e.g. to inspect the key cache.
    pub fn state(&self) -> &Arc<AccessState> {
        &self.state
    }
}

impl Drop for TestAccessServer {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

/// Router used by `TestAccessServer`.
pub fn build_routes(state: Arc<AccessState>) -> Router {
    let authenticated: Router<Arc<AccessState>> = Router::new()
        .route("/protected", get(protected))
        .route("/whoami", get(whoami))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_auth,
        ));

    let admins = IdentityGuard::new(Arc::clone(&state), |identity| {
        identity.in_group(ADMIN_GROUP)
    });
    let admin_routes: Router<Arc<AccessState>> = Router::new()
        .route("/admin", get(admin))
        .route_layer(middleware::from_fn_with_state(admins, require_identity));

    Router::new()
        .route("/public", get(|| async { "public" }))
        .merge(authenticated)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}

async fn protected(Extension(claims): Extension<AccessClaims>) -> Json<Value> {
    Json(json!({
        "email": claims.email,
        "aud": claims.aud,
        "service_token": claims.is_service_token(),
    }))
}

async fn whoami(context: AccessContext) -> Result<Json<ExtendedIdentity>, AccessError> {
    context
        .get_identity(None)
        .await?
        .map(Json)
        .ok_or(AccessError::InvalidToken(RejectReason::MissingToken))
}

async fn admin(Extension(identity): Extension<ExtendedIdentity>) -> Json<Value> {
    Json(json!({ "email": identity.email }))
}
