//! Cloudflare Access authentication for axum services.
//!
//! This library verifies the identity token Cloudflare Access attaches to
//! every request it forwards to an origin, and exposes the verified identity
//! to request handlers:
//!
//! - Signing keys are fetched from the team's `/cdn-cgi/access/certs`
//!   endpoint and cached until an unknown key ID forces a refresh
//! - Tokens are verified (RS256 signature, `aud`, `exp`, `nbf`, `iat`, `iss`)
//!   and bound to the current request
//! - Extended identity is fetched from `/cdn-cgi/access/get-identity` on demand
//! - Guard middleware turns the outcome into 401 / 403 responses
//!
//! # Architecture
//!
//! ```text
//! middleware/auth.rs (AccessContext, guards)
//!     -> auth/jwt.rs (JwtValidator) -> auth/jwks.rs (JwksClient)
//!     -> auth/identity.rs (IdentityClient)
//! ```
//!
//! # Modules
//!
//! - `config` - Access configuration from environment
//! - `errors` - Error types with HTTP status code mapping
//! - `auth` - Key resolution, token validation, identity lookups
//! - `middleware` - Per-request binder and guard middleware
//! - `observability` - Metrics

pub mod auth;
pub mod config;
pub mod errors;
pub mod middleware;
pub mod observability;

pub use auth::{AccessClaims, ExtendedIdentity};
pub use config::AccessConfig;
pub use errors::{AccessError, RejectReason};
pub use middleware::{require_auth, require_identity, AccessContext, AccessState, IdentityGuard};
