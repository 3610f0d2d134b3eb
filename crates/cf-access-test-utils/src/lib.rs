//! # Access Test Utilities
//!
//! Shared test utilities for the `cf-access` crate.
//!
//! This crate provides:
//! - Deterministic crypto fixtures (fixed RSA keypairs for the broker and a rogue signer)
//! - Test data builders (`TestTokenBuilder`, identity documents)
//! - Mock broker (`MockBroker`, serving certs and identity via wiremock)
//! - Server test harness (`TestAccessServer` for E2E tests)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cf_access_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> anyhow::Result<()> {
//!     let broker = MockBroker::start().await;
//!     let server = TestAccessServer::spawn(broker.config()).await?;
//!
//!     let token = TestKeypair::broker().sign(&broker.token_builder().build())?;
//!     let response = reqwest::Client::new()
//!         .get(format!("{}/protected", server.url()))
//!         .header("Cf-Access-Jwt-Assertion", token)
//!         .send()
//!         .await?;
//!
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```

pub mod broker_harness;
pub mod crypto_fixtures;
pub mod server_harness;
pub mod token_builders;

// Re-export commonly used items
pub use broker_harness::*;
pub use crypto_fixtures::*;
pub use server_harness::*;
pub use token_builders::*;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a test-friendly tracing subscriber once per test binary.
///
/// Honours `RUST_LOG`; defaults to `cf_access=debug`. Safe to call from
/// every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cf_access=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
