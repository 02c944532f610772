//! GCS credential provider using downscoped `OAuth2` tokens.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use credvend_core::Redacted;
use tracing::{debug, instrument};

use super::{CredentialProvider, IssueRequest, IssuedCredential, ProviderError, reject_expired};
use crate::types::{ProviderKind, StorageCredential};

/// A downscoped access token.
#[derive(Debug, Clone)]
pub struct DownscopedToken {
    /// Bearer token value.
    pub token: Redacted<String>,
    /// Token expiry.
    pub expires_at: DateTime<Utc>,
}

/// Exchanges the service identity's token for one restricted by a
/// Credential Access Boundary.
#[async_trait]
pub trait GcsDownscoper: Send + Sync {
    /// Returns a token limited to `access_boundary` (canonical JSON).
    async fn downscope(&self, access_boundary: &str) -> Result<DownscopedToken, ProviderError>;
}

/// GCS credential provider.
pub struct GcsCredentialProvider {
    downscoper: Arc<dyn GcsDownscoper>,
}

impl fmt::Debug for GcsCredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcsCredentialProvider").finish_non_exhaustive()
    }
}

impl GcsCredentialProvider {
    /// Creates a provider over `downscoper`.
    #[must_use]
    pub fn new(downscoper: Arc<dyn GcsDownscoper>) -> Self {
        Self { downscoper }
    }
}

#[async_trait]
impl CredentialProvider for GcsCredentialProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gcs
    }

    #[instrument(skip_all, fields(location = %request.location.id))]
    async fn issue(&self, request: &IssueRequest) -> Result<IssuedCredential, ProviderError> {
        debug!("fetching downscoped GCS token");
        let token = self.downscoper.downscope(&request.scope.policy).await?;
        reject_expired(token.expires_at, request.now)?;

        let expires_at = token.expires_at.min(request.requested_expiry());
        debug!(prefixes = request.scope.prefixes.len(), expires_at = %expires_at, "vending GCS credentials");

        let credentials = request
            .scope
            .prefix_uris()
            .into_iter()
            .map(|prefix| StorageCredential::gcs(prefix, token.token.expose().clone(), expires_at))
            .collect();

        Ok(IssuedCredential {
            credentials,
            expires_at,
        })
    }
}

#[cfg(feature = "gcp")]
mod gcp {
    use std::time::Duration;

    use gcp_auth::TokenProvider;
    use serde::Deserialize;

    use super::*;
    use crate::error::{VendError, VendResult};

    const CLOUD_PLATFORM_SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-platform"];
    const STS_TOKEN_URL: &str = "https://sts.googleapis.com/v1/token";
    const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
    const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

    /// Lifetime assumed for a static source token when none is given (1 hour).
    pub const DEFAULT_STATIC_TOKEN_LIFESPAN: Duration = Duration::from_secs(3600);

    enum SourceToken {
        Provider(Arc<dyn TokenProvider>),
        Static {
            token: Redacted<String>,
            lifespan: Duration,
        },
    }

    #[derive(Deserialize)]
    struct ExchangeResponse {
        access_token: String,
        #[serde(default)]
        expires_in: Option<i64>,
    }

    /// [`GcsDownscoper`] backed by Application Default Credentials and the
    /// Security Token Service token exchange.
    ///
    /// The source token comes from a [`TokenProvider`] or, for deployments
    /// without ambient credentials, from a static access token.
    pub struct GcpDownscoper {
        source: SourceToken,
        http: reqwest::Client,
    }

    impl fmt::Debug for GcpDownscoper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("GcpDownscoper").finish_non_exhaustive()
        }
    }

    impl GcpDownscoper {
        /// Initializes from the ambient Google credentials.
        ///
        /// # Errors
        ///
        /// Returns an error if GCP authentication cannot be initialized.
        pub async fn from_environment() -> VendResult<Self> {
            let token_provider = gcp_auth::provider()
                .await
                .map_err(|e| VendError::internal(format!("failed to initialize GCP authentication: {e}")))?;
            Ok(Self::with_token_provider(token_provider))
        }

        /// Uses `token_provider` for source tokens.
        #[must_use]
        pub fn with_token_provider(token_provider: Arc<dyn TokenProvider>) -> Self {
            Self {
                source: SourceToken::Provider(token_provider),
                http: reqwest::Client::new(),
            }
        }

        /// Uses a fixed access token as the source, treated as valid for
        /// `lifespan` from each call.
        #[must_use]
        pub fn with_static_token(token: impl Into<String>, lifespan: Duration) -> Self {
            Self {
                source: SourceToken::Static {
                    token: Redacted(token.into()),
                    lifespan,
                },
                http: reqwest::Client::new(),
            }
        }

        async fn source_token(&self) -> Result<(Redacted<String>, DateTime<Utc>), ProviderError> {
            match &self.source {
                SourceToken::Provider(provider) => {
                    let token = provider
                        .token(CLOUD_PLATFORM_SCOPES)
                        .await
                        .map_err(|e| ProviderError::retryable(format!("failed to get GCP token: {e}")))?;
                    Ok((Redacted(token.as_str().to_string()), token.expires_at()))
                }
                SourceToken::Static { token, lifespan } => {
                    let lifespan = chrono::Duration::from_std(*lifespan).map_err(|e| {
                        ProviderError::terminal(format!("static token lifespan out of range: {e}"))
                    })?;
                    Ok((token.clone(), Utc::now() + lifespan))
                }
            }
        }
    }

    #[async_trait]
    impl GcsDownscoper for GcpDownscoper {
        async fn downscope(&self, access_boundary: &str) -> Result<DownscopedToken, ProviderError> {
            let (source, source_expiry) = self.source_token().await?;

            let response = self
                .http
                .post(STS_TOKEN_URL)
                .form(&[
                    ("grant_type", TOKEN_EXCHANGE_GRANT),
                    ("subject_token_type", ACCESS_TOKEN_TYPE),
                    ("requested_token_type", ACCESS_TOKEN_TYPE),
                    ("subject_token", source.expose().as_str()),
                    ("options", access_boundary),
                ])
                .send()
                .await
                .map_err(|e| ProviderError::retryable(format!("token exchange failed: {e}")))?;
            let status = response.status();
            if !status.is_success() {
                return Err(ProviderError::from_status(status.as_u16(), "token exchange"));
            }
            let body: ExchangeResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::terminal(format!("invalid token exchange response: {e}")))?;

            let expires_at = body
                .expires_in
                .map_or(source_expiry, |secs| {
                    source_expiry.min(Utc::now() + chrono::Duration::seconds(secs))
                });

            Ok(DownscopedToken {
                token: Redacted(body.access_token),
                expires_at,
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn static_token_is_valid_for_its_lifespan() {
            let downscoper = GcpDownscoper::with_static_token("ya29.static", Duration::from_secs(600));
            let before = Utc::now();

            let (token, expires_at) = downscoper
                .source_token()
                .await
                .unwrap_or_else(|e| panic!("source token: {e}"));

            assert_eq!(token.expose(), "ya29.static");
            assert!(expires_at >= before + chrono::Duration::seconds(600));
            assert!(expires_at <= Utc::now() + chrono::Duration::seconds(600));
        }
    }
}

#[cfg(feature = "gcp")]
pub use gcp::{DEFAULT_STATIC_TOKEN_LIFESPAN, GcpDownscoper};
