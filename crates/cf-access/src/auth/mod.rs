//! Authentication against Cloudflare Access.
//!
//! # Components
//!
//! - `jwks` - Key resolver fetching and caching the team's signing keys
//! - `jwt` - Token validation using the cached keys
//! - `claims` - Claims carried by a validated Access token
//! - `identity` - Extended identity lookups against the broker

pub mod claims;
pub mod identity;
pub mod jwks;
pub mod jwt;

pub use claims::AccessClaims;
pub use identity::{ExtendedIdentity, IdentityClient};
pub use jwks::{JwksClient, SigningKeySet};
pub use jwt::JwtValidator;
