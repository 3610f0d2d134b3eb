//! Request binding and guard middleware for Access-protected routes.
//!
//! Extracts the Access token from the `Cf-Access-Jwt-Assertion` header
//! (falling back to the `CF_Authorization` cookie), validates it, and binds
//! the token and claims to the current request.
//!
//! # Usage
//!
//! ```rust,ignore
//! let state = Arc::new(AccessState::from_env()?);
//! let admins = IdentityGuard::new(Arc::clone(&state), |identity| identity.in_group("admins"));
//!
//! let app = Router::new()
//!     .route("/protected", get(protected))
//!     .route_layer(middleware::from_fn_with_state(Arc::clone(&state), require_auth))
//!     .route("/admin", get(admin).route_layer(middleware::from_fn_with_state(admins, require_identity)))
//!     .with_state(state);
//! ```

use crate::auth::identity::ACCESS_COOKIE;
use crate::auth::{AccessClaims, ExtendedIdentity, IdentityClient, JwksClient, JwtValidator};
use crate::config::AccessConfig;
use crate::errors::{AccessError, RejectReason};
use crate::observability::metrics::{self, AuthOutcome};
use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::{header::COOKIE, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use secrecy::{ExposeSecret, SecretString};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::instrument;

/// Header Cloudflare Access sets on every request it forwards to the origin.
pub const ACCESS_JWT_HEADER: &str = "cf-access-jwt-assertion";

/// Application-scoped Access state.
///
/// One per application; shared by all requests through axum `State`.
pub struct AccessState {
    config: AccessConfig,
    jwt_validator: JwtValidator,
    identity_client: IdentityClient,
}

impl AccessState {
    /// Build the key resolver, validator and identity client for `config`.
    ///
    /// Both broker calls share one HTTP client bounded by the configured
    /// timeout.
    pub fn new(config: AccessConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "cf_access.middleware", error = %e, "Failed to build HTTP client with custom config, using defaults");
                reqwest::Client::new()
            });

        let jwks_client = Arc::new(JwksClient::with_http_client(
            config.certs_url(),
            http_client.clone(),
        ));

        let mut jwt_validator = JwtValidator::new(jwks_client, config.clock_skew());
        if config.verify_issuer() {
            jwt_validator = jwt_validator.with_issuer(config.issuer());
        }

        let identity_client = IdentityClient::with_http_client(config.identity_url(), http_client);

        tracing::info!(
            target: "cf_access.middleware",
            team = %config.team(),
            team_url = %config.team_url(),
            verify_issuer = config.verify_issuer(),
            "Cloudflare Access configured"
        );

        Self {
            config,
            jwt_validator,
            identity_client,
        }
    }

    /// Load the configuration from the environment and build the state.
    ///
    /// # Errors
    ///
    /// Returns `AccessError::Configuration` if the audience or team is
    /// missing or any optional setting is invalid.
    pub fn from_env() -> Result<Self, AccessError> {
        Ok(Self::new(AccessConfig::from_env()?))
    }

    pub fn config(&self) -> &AccessConfig {
        &self.config
    }

    pub fn jwt_validator(&self) -> &JwtValidator {
        &self.jwt_validator
    }

    pub fn identity_client(&self) -> &IdentityClient {
        &self.identity_client
    }
}

/// Request-scoped binding, created empty for every request.
#[derive(Default)]
struct Binding {
    token: Option<SecretString>,
    claims: Option<AccessClaims>,
    rejection: Option<RejectReason>,
}

/// Per-request Access binder.
///
/// Holds the token found on the request and, once `authenticate` succeeds,
/// the validated token and claims. Clones share the same binding, so a
/// context bound by a guard is seen by the handler.
#[derive(Clone)]
pub struct AccessContext {
    state: Arc<AccessState>,
    request_token: Option<SecretString>,
    binding: Arc<RwLock<Binding>>,
}

impl fmt::Debug for AccessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessContext")
            .field("has_request_token", &self.request_token.is_some())
            .finish_non_exhaustive()
    }
}

impl AccessContext {
    /// Create an unauthenticated context for a request with `headers`.
    pub fn new(state: Arc<AccessState>, headers: &HeaderMap) -> Self {
        Self {
            state,
            request_token: token_from_headers(headers).map(SecretString::from),
            binding: Arc::new(RwLock::new(Binding::default())),
        }
    }

    /// Validate a token and bind it to the request.
    ///
    /// Without an explicit token the request's own token is used, header
    /// first, then cookie. Returns `Ok(false)` for a missing or rejected
    /// token; a rejection leaves an earlier successful binding in place.
    ///
    /// # Errors
    ///
    /// Returns `AccessError::KeyFetch` if the signing keys cannot be
    /// retrieved, since no decision can be made.
    #[instrument(skip_all, name = "cf_access.middleware.authenticate")]
    pub async fn authenticate(&self, token: Option<&str>) -> Result<bool, AccessError> {
        let candidate = match token.filter(|t| !t.is_empty()) {
            Some(explicit) => Some(SecretString::from(explicit)),
            None => self.request_token.clone(),
        };

        let Some(candidate) = candidate else {
            tracing::debug!(target: "cf_access.middleware", "No Access token on request");
            self.reject(RejectReason::MissingToken).await;
            return Ok(false);
        };

        match self
            .state
            .jwt_validator
            .validate(candidate.expose_secret(), self.state.config.audience())
            .await
        {
            Ok(claims) => {
                metrics::record_authentication(AuthOutcome::Accepted);
                tracing::debug!(
                    target: "cf_access.middleware",
                    service_token = claims.is_service_token(),
                    "Request authenticated"
                );

                let mut binding = self.binding.write().await;
                binding.token = Some(candidate);
                binding.claims = Some(claims);
                binding.rejection = None;
                Ok(true)
            }
            Err(AccessError::InvalidToken(reason)) => {
                self.reject(reason).await;
                Ok(false)
            }
            Err(e) => {
                metrics::record_authentication(AuthOutcome::Error);
                tracing::warn!(target: "cf_access.middleware", error = %e, "Authentication could not be decided");
                Err(e)
            }
        }
    }

    /// Fetch the extended identity for a token.
    ///
    /// An explicit token is sent to the broker as-is. Otherwise the bound
    /// token is used, authenticating the request first if nothing is bound;
    /// `Ok(None)` means there is still no token.
    ///
    /// # Errors
    ///
    /// Returns `AccessError::IdentityFetch` if the broker call fails or
    /// answers with a non-2xx status, and `AccessError::KeyFetch` from the
    /// implicit authentication.
    #[instrument(skip_all, name = "cf_access.middleware.get_identity")]
    pub async fn get_identity(
        &self,
        token: Option<&str>,
    ) -> Result<Option<ExtendedIdentity>, AccessError> {
        let token = match token.filter(|t| !t.is_empty()) {
            Some(explicit) => SecretString::from(explicit),
            None => {
                if self.token().await.is_none() {
                    self.authenticate(None).await?;
                }
                match self.token().await {
                    Some(bound) => bound,
                    None => {
                        tracing::debug!(target: "cf_access.middleware", "No authenticated token for identity lookup");
                        return Ok(None);
                    }
                }
            }
        };

        self.state.identity_client.fetch(&token).await.map(Some)
    }

    /// Claims of the bound token.
    pub async fn claims(&self) -> Option<AccessClaims> {
        self.binding.read().await.claims.clone()
    }

    /// The bound raw token.
    pub async fn token(&self) -> Option<SecretString> {
        self.binding.read().await.token.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.binding.read().await.claims.is_some()
    }

    /// Why the most recent `authenticate` call returned false.
    ///
    /// Diagnostic only; never sent to clients.
    pub async fn rejection(&self) -> Option<RejectReason> {
        self.binding.read().await.rejection
    }

    async fn reject(&self, reason: RejectReason) {
        metrics::record_authentication(AuthOutcome::Rejected(reason));
        tracing::debug!(target: "cf_access.middleware", reason = %reason, "Access token rejected");
        self.binding.write().await.rejection = Some(reason);
    }

    /// Context already bound to the request, or a fresh one.
    fn for_request(state: &Arc<AccessState>, req: &Request) -> Self {
        req.extensions()
            .get::<AccessContext>()
            .cloned()
            .unwrap_or_else(|| Self::new(Arc::clone(state), req.headers()))
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AccessContext
where
    Arc<AccessState>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(context) = parts.extensions.get::<AccessContext>() {
            return Ok(context.clone());
        }

        let context = AccessContext::new(Arc::<AccessState>::from_ref(state), &parts.headers);
        parts.extensions.insert(context.clone());
        Ok(context)
    }
}

/// Token from the assertion header, or else from the `CF_Authorization` cookie.
fn token_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(ACCESS_JWT_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or_else(|| cookie_value(headers, ACCESS_COOKIE))
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value.trim_matches('"'))
}

/// Guard that requires an authenticated request.
///
/// On success the `AccessContext` and `AccessClaims` are stored in request
/// extensions for handlers.
///
/// # Response
///
/// - 401 Unauthorized with WWW-Authenticate header if the token is missing or invalid
/// - 503 Service Unavailable if the signing keys cannot be fetched
#[instrument(skip(state, req, next), name = "cf_access.middleware.require_auth")]
pub async fn require_auth(
    State(state): State<Arc<AccessState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AccessError> {
    let context = AccessContext::for_request(&state, &req);

    let claims = authenticated_claims(&context, "require_auth").await?;

    req.extensions_mut().insert(claims);
    req.extensions_mut().insert(context);
    metrics::record_guard_decision("require_auth", "allow");

    Ok(next.run(req).await)
}

type IdentityPredicate = dyn Fn(&ExtendedIdentity) -> bool + Send + Sync;

/// State for `require_identity`: the Access state plus the predicate the
/// identity must satisfy.
#[derive(Clone)]
pub struct IdentityGuard {
    state: Arc<AccessState>,
    predicate: Arc<IdentityPredicate>,
}

impl IdentityGuard {
    pub fn new<F>(state: Arc<AccessState>, predicate: F) -> Self
    where
        F: Fn(&ExtendedIdentity) -> bool + Send + Sync + 'static,
    {
        Self {
            state,
            predicate: Arc::new(predicate),
        }
    }

    pub fn allows(&self, identity: &ExtendedIdentity) -> bool {
        (self.predicate)(identity)
    }
}

/// Guard that requires an authenticated request whose extended identity
/// satisfies the guard's predicate.
///
/// The predicate is only evaluated for authenticated requests. On success
/// `AccessContext`, `AccessClaims` and `ExtendedIdentity` are stored in
/// request extensions.
///
/// # Response
///
/// - 401 Unauthorized if the token is missing or invalid
/// - 403 Forbidden if the predicate rejects the identity
/// - 503 Service Unavailable if the broker cannot be reached
#[instrument(skip(guard, req, next), name = "cf_access.middleware.require_identity")]
pub async fn require_identity(
    State(guard): State<IdentityGuard>,
    mut req: Request,
    next: Next,
) -> Result<Response, AccessError> {
    let context = AccessContext::for_request(&guard.state, &req);

    let claims = authenticated_claims(&context, "require_identity").await?;

    let identity = match context.get_identity(None).await {
        Ok(Some(identity)) => identity,
        Ok(None) => {
            metrics::record_guard_decision("require_identity", "unauthorized");
            return Err(AccessError::InvalidToken(RejectReason::MissingToken));
        }
        Err(e) => {
            metrics::record_guard_decision("require_identity", "unavailable");
            return Err(e);
        }
    };

    if !guard.allows(&identity) {
        tracing::debug!(target: "cf_access.middleware", "Identity rejected by guard predicate");
        metrics::record_guard_decision("require_identity", "forbidden");
        return Err(AccessError::Forbidden("Access denied".to_string()));
    }

    req.extensions_mut().insert(claims);
    req.extensions_mut().insert(identity);
    req.extensions_mut().insert(context);
    metrics::record_guard_decision("require_identity", "allow");

    Ok(next.run(req).await)
}

/// Authenticate for a guard, mapping `false` to a 401 error.
async fn authenticated_claims(
    context: &AccessContext,
    guard: &'static str,
) -> Result<AccessClaims, AccessError> {
    match context.authenticate(None).await {
        Ok(true) => {}
        Ok(false) => {
            metrics::record_guard_decision(guard, "unauthorized");
            let reason = context
                .rejection()
                .await
                .unwrap_or(RejectReason::MissingToken);
            return Err(AccessError::InvalidToken(reason));
        }
        Err(e) => {
            metrics::record_guard_decision(guard, "unavailable");
            return Err(e);
        }
    }

    context.claims().await.ok_or(AccessError::Internal)
}

/// Extension trait for reading what the guards stored on a request.
pub trait ClaimsExt {
    /// Returns `None` if no Access guard ran for this request.
    fn claims(&self) -> Option<&AccessClaims>;

    /// Returns `None` unless `require_identity` ran for this request.
    fn identity(&self) -> Option<&ExtendedIdentity>;
}

impl<B> ClaimsExt for axum::http::Request<B> {
    fn claims(&self) -> Option<&AccessClaims> {
        self.extensions().get::<AccessClaims>()
    }

    fn identity(&self) -> Option<&ExtendedIdentity> {
        self.extensions().get::<ExtendedIdentity>()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, routing::get, Router};
    use tower::ServiceExt;

    /// State pointing at a closed port; any broker call fails with KeyFetch.
    fn offline_state() -> Arc<AccessState> {
        let config = AccessConfig::new("32eafc7626e974616deaf0dc3ce63d7b", "yourteam")
            .unwrap()
            .with_team_url("http://127.0.0.1:1")
            .unwrap();
        Arc::new(AccessState::new(config))
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_token_from_header() {
        let map = headers(&[("Cf-Access-Jwt-Assertion", "header.jwt.token")]);
        assert_eq!(token_from_headers(&map), Some("header.jwt.token"));
    }

    #[test]
    fn test_header_takes_precedence_over_cookie() {
        let map = headers(&[
            ("cookie", "CF_Authorization=cookie.jwt.token"),
            ("cf-access-jwt-assertion", "header.jwt.token"),
        ]);
        assert_eq!(token_from_headers(&map), Some("header.jwt.token"));
    }

    #[test]
    fn test_cookie_fallback() {
        let map = headers(&[(
            "cookie",
            "theme=dark; CF_Authorization=cookie.jwt.token; lang=en",
        )]);
        assert_eq!(token_from_headers(&map), Some("cookie.jwt.token"));
    }

    #[test]
    fn test_cookie_across_multiple_headers() {
        let map = headers(&[
            ("cookie", "theme=dark"),
            ("cookie", "CF_Authorization=cookie.jwt.token"),
        ]);
        assert_eq!(token_from_headers(&map), Some("cookie.jwt.token"));
    }

    #[test]
    fn test_empty_header_falls_back_to_cookie() {
        let map = headers(&[
            ("cf-access-jwt-assertion", ""),
            ("cookie", "CF_Authorization=cookie.jwt.token"),
        ]);
        assert_eq!(token_from_headers(&map), Some("cookie.jwt.token"));
    }

    #[test]
    fn test_cookie_name_is_exact() {
        let map = headers(&[("cookie", "XCF_Authorization=a; CF_Authorization2=b")]);
        assert_eq!(token_from_headers(&map), None);

        let map = headers(&[("cookie", "CF_Authorization=")]);
        assert_eq!(token_from_headers(&map), None);
    }

    #[tokio::test]
    async fn test_authenticate_without_token_makes_no_network_call() {
        // Any broker call would surface as KeyFetch, not Ok(false)
        let context = AccessContext::new(offline_state(), &HeaderMap::new());

        assert!(!context.authenticate(None).await.unwrap());
        assert!(!context.is_authenticated().await);
        assert_eq!(context.rejection().await, Some(RejectReason::MissingToken));
        assert!(context.claims().await.is_none());
    }

    #[tokio::test]
    async fn test_authenticate_malformed_token_is_false() {
        let map = headers(&[("cf-access-jwt-assertion", "not-a-jwt")]);
        let context = AccessContext::new(offline_state(), &map);

        assert!(!context.authenticate(None).await.unwrap());
        assert_eq!(context.rejection().await, Some(RejectReason::Malformed));
    }

    #[tokio::test]
    async fn test_authenticate_unreachable_broker_is_error() {
        let token = "eyJhbGciOiJSUzI1NiIsImtpZCI6ImtleS0xIn0.e30.c2ln";
        let context = AccessContext::new(offline_state(), &HeaderMap::new());

        let result = context.authenticate(Some(token)).await;
        assert!(matches!(result, Err(AccessError::KeyFetch(_))));
    }

    #[tokio::test]
    async fn test_get_identity_without_token_is_none() {
        let context = AccessContext::new(offline_state(), &HeaderMap::new());

        let identity = context.get_identity(None).await.unwrap();
        assert!(identity.is_none());
        assert_eq!(context.rejection().await, Some(RejectReason::MissingToken));
    }

    #[tokio::test]
    async fn test_clones_share_binding() {
        let context = AccessContext::new(offline_state(), &HeaderMap::new());
        let clone = context.clone();

        context.authenticate(None).await.unwrap();
        assert_eq!(clone.rejection().await, Some(RejectReason::MissingToken));
    }

    #[tokio::test]
    async fn test_require_auth_missing_token_is_401() {
        let state = offline_state();
        let app = Router::new()
            .route("/protected", get(|| async { "secret" }))
            .route_layer(axum::middleware::from_fn_with_state(state, require_auth));

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/protected")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get("WWW-Authenticate").is_some());
    }

    #[tokio::test]
    async fn test_require_identity_missing_token_skips_predicate() {
        let evaluated = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&evaluated);
        let guard = IdentityGuard::new(offline_state(), move |_| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            true
        });

        let app = Router::new()
            .route("/admin", get(|| async { "admin" }))
            .route_layer(axum::middleware::from_fn_with_state(guard, require_identity));

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/admin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(!evaluated.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_extractor_reuses_bound_context() {
        let state = offline_state();
        let existing = AccessContext::new(Arc::clone(&state), &HeaderMap::new());
        existing.authenticate(None).await.unwrap();

        let request = axum::http::Request::builder()
            .uri("/")
            .extension(existing)
            .body(())
            .unwrap();
        let (mut parts, _) = request.into_parts();

        let extracted = AccessContext::from_request_parts(&mut parts, &state)
            .await
            .unwrap();
        assert_eq!(
            extracted.rejection().await,
            Some(RejectReason::MissingToken)
        );
    }

    #[test]
    fn test_claims_ext_reads_extensions() {
        let claims: AccessClaims = serde_json::from_value(serde_json::json!({
            "aud": ["aud"],
            "exp": 1_700_000_300,
            "iss": "https://yourteam.cloudflareaccess.com",
            "email": "user@example.com"
        }))
        .unwrap();

        let mut request = axum::http::Request::new(());
        assert!(request.claims().is_none());

        request.extensions_mut().insert(claims.clone());
        assert_eq!(request.claims(), Some(&claims));
        assert!(request.identity().is_none());
    }

    #[test]
    fn test_identity_guard_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<IdentityGuard>();
        assert_clone::<AccessContext>();
    }
}
