//! Shared test utilities for credvend integration tests.
//!
//! This crate provides:
//! - [`ScriptedProvider`]: A credential provider with scripted outcomes and call counting
//! - Fixtures for locations, principals and intents on every provider kind
//! - Assertion helpers for error classes and shared credentials
//!
//! # Example
//!
//! ```rust,ignore
//! use credvend_test_utils::{ScriptedProvider, principal, intent, s3_location, vendor_with};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let provider = ScriptedProvider::new(ProviderKind::ObjectStore);
//!     let (vendor, clock) = vendor_with(provider.clone(), VendingConfig::default());
//!     // ... run test ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod provider;

pub use assertions::*;
pub use fixtures::*;
pub use provider::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("credvend=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
