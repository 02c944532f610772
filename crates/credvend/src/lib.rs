//! # credvend
//!
//! Scoped, short-lived storage credentials for table catalog clients.
//!
//! A catalog that has already authorized a principal for a table asks
//! [`CredentialVendor::vend`] for credentials covering a set of operations on a
//! set of paths. The vendor:
//!
//! - **Scopes**: translates the intent into the provider's least-privilege policy
//!   (IAM session policy, SAS permissions, HDFS delegation scope, GCS access
//!   boundary) rooted at the storage location
//! - **Caches**: keeps issued credentials per scope until shortly before they
//!   expire, bounded by an LRU per provider
//! - **Collapses**: concurrent misses for the same scope share one provider call
//! - **Classifies**: request, denial, retryable and terminal failures stay distinct
//!
//! ## Providers
//!
//! | Kind | Adapter | Real client (feature) |
//! |------|---------|-----------------------|
//! | S3 / S3-compatible | [`credentials::S3CredentialProvider`] | `AwsStsClient` (`aws`) |
//! | ADLS | [`credentials::AdlsCredentialProvider`] | `AzureDelegationKeyClient` (`azure`) |
//! | HDFS | [`credentials::HdfsCredentialProvider`] | `WebHdfsClient` (`hdfs`) |
//! | GCS | [`credentials::GcsCredentialProvider`] | `GcpDownscoper` (`gcp`) |
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use credvend::prelude::*;
//!
//! let registry = ProviderRegistry::new()
//!     .with_provider(Arc::new(S3CredentialProvider::new(Arc::new(AwsStsClient::from_env().await))));
//! let vendor = CredentialVendor::new(registry, VendingConfig::from_env()?)?;
//!
//! let location = StorageLocation::new("warehouse", ProviderKind::ObjectStore, "s3://lake/warehouse/")
//!     .with_identity("arn:aws:iam::123456789012:role/vend");
//! let principal = PrincipalContext::new("alice", [Operation::Read, Operation::List]);
//! let intent = AccessIntent::new([Operation::Read], ["s3://lake/warehouse/sales/orders/"]);
//!
//! let credential = vendor.vend(&principal, &location, &intent).await?;
//! for storage_credential in credential.storage_credentials() {
//!     println!("{}", storage_credential.prefix);
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod retry;
pub mod scope_key;
pub mod types;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cache::{CacheOutcome, CredentialCache};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{ProviderLimits, VendingConfig};
    pub use crate::coordinator::CredentialVendor;
    pub use crate::credentials::{
        AdlsCredentialProvider, CredentialProvider, GcsCredentialProvider, HdfsCredentialProvider,
        IssueRequest, IssuedCredential, ProviderError, ProviderRegistry, S3CredentialProvider,
    };
    pub use crate::error::{ErrorClass, VendError, VendResult};
    pub use crate::policy::build_scope;
    pub use crate::retry::RetryPolicy;
    pub use crate::scope_key::ScopeKey;
    pub use crate::types::*;

    #[cfg(feature = "aws")]
    pub use crate::credentials::AwsStsClient;
    #[cfg(feature = "azure")]
    pub use crate::credentials::AzureDelegationKeyClient;
    #[cfg(feature = "gcp")]
    pub use crate::credentials::GcpDownscoper;
    #[cfg(feature = "hdfs")]
    pub use crate::credentials::WebHdfsClient;
}

// Re-export key types at crate root
pub use cache::{CacheOutcome, CredentialCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ProviderLimits, VendingConfig};
pub use coordinator::CredentialVendor;
pub use credentials::{CredentialProvider, ProviderError, ProviderRegistry};
pub use error::{ErrorClass, VendError, VendResult};
pub use retry::RetryPolicy;
pub use scope_key::ScopeKey;
pub use types::{
    AccessIntent, CachedCredential, Operation, PrincipalContext, ProviderKind, ProviderScope,
    StorageCredential, StorageLocation, StoragePath,
};
