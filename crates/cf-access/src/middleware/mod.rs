//! Request binding and guard middleware.
//!
//! # Components
//!
//! - `auth` - Per-request `AccessContext` and the `require_auth` /
//!   `require_identity` guards

pub mod auth;

pub use auth::{
    require_auth, require_identity, AccessContext, AccessState, ClaimsExt, IdentityGuard,
};
