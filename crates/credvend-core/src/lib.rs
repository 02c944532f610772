//! # credvend-core
//!
//! Shared primitives for the credvend storage credential vending workspace.
//!
//! This crate provides the foundational pieces used by every credvend crate:
//!
//! - **Error Types**: Shared error definitions and result types
//! - **Canonical JSON**: Deterministic serialization for policy documents and fingerprints
//! - **Observability**: Logging initialisation, standard spans and secret redaction
//!
//! ## Example
//!
//! ```rust
//! use credvend_core::prelude::*;
//! use serde_json::json;
//!
//! let doc = json!({"b": 1, "a": 2});
//! assert_eq!(to_canonical_string(&doc).unwrap(), r#"{"a":2,"b":1}"#);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod canonical_json;
pub mod error;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::canonical_json::{
        CanonicalJsonError, sha256_fingerprint, to_canonical_bytes, to_canonical_string,
    };
    pub use crate::error::{Error, Result};
    pub use crate::observability::{LogFormat, Redacted, init_logging};
}

pub use canonical_json::{CanonicalJsonError, sha256_fingerprint};
pub use error::{Error, Result};
pub use observability::{LogFormat, Redacted, init_logging};
