//! Credential providers for storage access delegation.
//!
//! Each backend implements [`CredentialProvider`] on top of a narrow client
//! trait. The real clients sit behind cargo features; tests plug in fakes.
//!
//! ## Supported Providers
//!
//! - **S3**: STS `AssumeRole` with an inline session policy (`aws`)
//! - **ADLS**: user delegation key + per-prefix user delegation SAS (`azure`)
//! - **HDFS**: delegation token for the location's proxy user (`hdfs`)
//! - **GCS**: downscoped `OAuth2` token via Credential Access Boundary (`gcp`)

pub mod adls;
pub mod gcs;
pub mod hdfs;
pub mod s3;

pub use adls::{AdlsCredentialProvider, DelegationKeySource, UserDelegationKey};
pub use gcs::{DownscopedToken, GcsCredentialProvider, GcsDownscoper};
pub use hdfs::{DelegationToken, DelegationTokenClient, HdfsCredentialProvider};
pub use s3::{AssumeRoleRequest, S3CredentialProvider, SessionCredentials, StsClient};

#[cfg(feature = "aws")]
pub use s3::AwsStsClient;

#[cfg(feature = "azure")]
pub use adls::AzureDelegationKeyClient;

#[cfg(feature = "hdfs")]
pub use hdfs::{WebHdfsClient, WebHdfsConfig};

#[cfg(feature = "gcp")]
pub use gcs::{DEFAULT_STATIC_TOKEN_LIFESPAN, GcpDownscoper};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::{VendError, VendResult};
use crate::types::{ProviderKind, ProviderScope, StorageCredential, StorageLocation};

/// Default session duration (1 hour).
pub const DEFAULT_SESSION_DURATION: Duration = Duration::from_secs(3600);

/// Shortest session STS `AssumeRole` accepts (15 minutes).
pub const MIN_SESSION_DURATION: Duration = Duration::from_secs(15 * 60);

const MAX_SESSION_NAME_LEN: usize = 64;

/// Effective session duration for a request.
///
/// The smallest of the configured limit, the location ceiling and the
/// provider maximum. S3 requests never go below [`MIN_SESSION_DURATION`];
/// an S3 location whose ceiling is below it cannot be served.
///
/// # Errors
///
/// Returns [`VendError::Terminal`] for an S3 location with a ceiling below
/// [`MIN_SESSION_DURATION`].
pub fn effective_session_duration(
    kind: ProviderKind,
    configured: Duration,
    location_ceiling: Option<Duration>,
) -> VendResult<Duration> {
    let mut duration = configured.min(kind.max_session_duration());
    if kind == ProviderKind::ObjectStore {
        if let Some(ceiling) = location_ceiling.filter(|c| *c < MIN_SESSION_DURATION) {
            return Err(VendError::terminal(
                kind,
                format!(
                    "session ceiling of {}s is below the {}s AssumeRole minimum",
                    ceiling.as_secs(),
                    MIN_SESSION_DURATION.as_secs()
                ),
            ));
        }
        duration = duration.max(MIN_SESSION_DURATION);
    }
    if let Some(ceiling) = location_ceiling {
        duration = duration.min(ceiling);
    }
    Ok(duration)
}

/// Session name derived from the principal.
///
/// Restricted to the characters STS accepts for `RoleSessionName`
/// (`[\w+=,.@-]`, at most 64 characters).
#[must_use]
pub fn session_name_for(principal: &str) -> String {
    let mut name = String::from("credvend-");
    name.extend(principal.chars().map(|c| {
        if c.is_ascii_alphanumeric() || "_+=,.@-".contains(c) {
            c
        } else {
            '_'
        }
    }));
    name.truncate(MAX_SESSION_NAME_LEN);
    name
}

/// Everything an adapter needs for one provider call.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    /// Scope computed by the policy builder.
    pub scope: ProviderScope,
    /// Location the scope belongs to.
    pub location: StorageLocation,
    /// Session duration to request.
    pub session_duration: Duration,
    /// Principal-derived session name.
    pub session_name: String,
    /// Time of the attempt.
    pub now: DateTime<Utc>,
}

impl IssueRequest {
    /// Requested expiry: `now + session_duration`.
    #[must_use]
    pub fn requested_expiry(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.session_duration)
            .ok()
            .and_then(|d| self.now.checked_add_signed(d))
            .unwrap_or(self.now)
    }
}

/// What a provider returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    /// One credential per vended prefix.
    pub credentials: Vec<StorageCredential>,
    /// Absolute expiry reported by the provider.
    pub expires_at: DateTime<Utc>,
}

/// Adapter-level failure classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Timeouts, throttling, 5xx and transport failures.
    #[error("retryable provider failure: {message}")]
    Retryable {
        /// Provider error.
        message: String,
    },
    /// 4xx, access denied, malformed policy, invalid identity.
    #[error("terminal provider failure: {message}")]
    Terminal {
        /// Provider error.
        message: String,
    },
}

impl ProviderError {
    /// Creates a retryable error.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    /// Creates a terminal error.
    #[must_use]
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal {
            message: message.into(),
        }
    }

    /// Classifies an HTTP error status.
    #[must_use]
    pub fn from_status(status: u16, context: &str) -> Self {
        if status == 408 || status == 429 || status >= 500 {
            Self::retryable(format!("{context}: HTTP {status}"))
        } else {
            Self::terminal(format!("{context}: HTTP {status}"))
        }
    }

    /// Returns true for [`ProviderError::Retryable`].
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// Error message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable { message } | Self::Terminal { message } => message,
        }
    }
}

/// Refuses credentials that are already expired when they arrive.
///
/// # Errors
///
/// Returns [`ProviderError::Retryable`] if `expires_at <= now`.
pub fn reject_expired(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), ProviderError> {
    if expires_at <= now {
        return Err(ProviderError::retryable(format!(
            "provider returned an expired credential (expires_at={expires_at}, now={now})"
        )));
    }
    Ok(())
}

/// Issues scoped credentials from one backend.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Backend family served by this provider.
    fn kind(&self) -> ProviderKind;

    /// Issues credentials for `request.scope`.
    async fn issue(&self, request: &IssueRequest) -> Result<IssuedCredential, ProviderError>;
}

/// One provider slot per [`ProviderKind`].
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    object_store: Option<Arc<dyn CredentialProvider>>,
    blob_container: Option<Arc<dyn CredentialProvider>>,
    distributed_fs: Option<Arc<dyn CredentialProvider>>,
    gcs: Option<Arc<dyn CredentialProvider>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let configured: Vec<ProviderKind> = ProviderKind::ALL
            .into_iter()
            .filter(|k| self.get(*k).is_some())
            .collect();
        f.debug_struct("ProviderRegistry")
            .field("configured", &configured)
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` in the slot for its kind, replacing any previous one.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        let kind = provider.kind();
        *self.slot_mut(kind) = Some(provider);
        self
    }

    /// Provider registered for `kind`.
    #[must_use]
    pub const fn get(&self, kind: ProviderKind) -> Option<&Arc<dyn CredentialProvider>> {
        match kind {
            ProviderKind::ObjectStore => self.object_store.as_ref(),
            ProviderKind::BlobContainer => self.blob_container.as_ref(),
            ProviderKind::DistributedFs => self.distributed_fs.as_ref(),
            ProviderKind::Gcs => self.gcs.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: ProviderKind) -> &mut Option<Arc<dyn CredentialProvider>> {
        match kind {
            ProviderKind::ObjectStore => &mut self.object_store,
            ProviderKind::BlobContainer => &mut self.blob_container,
            ProviderKind::DistributedFs => &mut self.distributed_fs,
            ProviderKind::Gcs => &mut self.gcs,
        }
    }
}
