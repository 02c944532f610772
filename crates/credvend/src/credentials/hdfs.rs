//! HDFS credential provider: delegation tokens for the location's proxy user.
//!
//! HDFS has no policy language; the token carries the proxy user's own
//! permissions, so scope narrowing relies on the user configured per location.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use credvend_core::Redacted;
use tracing::{debug, instrument};

use super::{CredentialProvider, IssueRequest, IssuedCredential, ProviderError, reject_expired};
use crate::types::{ProviderKind, StorageCredential};

/// A delegation token and its expiry.
#[derive(Debug, Clone)]
pub struct DelegationToken {
    /// URL-safe encoded token.
    pub token: Redacted<String>,
    /// Token expiry as reported by the namenode.
    pub expires_at: DateTime<Utc>,
}

/// Obtains delegation tokens from a namenode.
#[async_trait]
pub trait DelegationTokenClient: Send + Sync {
    /// Requests a token for `user` from `namenode` (`host[:port]`).
    async fn delegation_token(
        &self,
        namenode: &str,
        user: &str,
        renewer: Option<&str>,
    ) -> Result<DelegationToken, ProviderError>;
}

/// HDFS credential provider.
pub struct HdfsCredentialProvider {
    client: Arc<dyn DelegationTokenClient>,
    renewer: Option<String>,
}

impl fmt::Debug for HdfsCredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HdfsCredentialProvider")
            .field("renewer", &self.renewer)
            .finish_non_exhaustive()
    }
}

impl HdfsCredentialProvider {
    /// Creates a provider over `client`.
    #[must_use]
    pub fn new(client: Arc<dyn DelegationTokenClient>) -> Self {
        Self {
            client,
            renewer: None,
        }
    }

    /// Names the principal allowed to renew issued tokens.
    #[must_use]
    pub fn with_renewer(mut self, renewer: impl Into<String>) -> Self {
        self.renewer = Some(renewer.into());
        self
    }
}

#[async_trait]
impl CredentialProvider for HdfsCredentialProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::DistributedFs
    }

    #[instrument(skip_all, fields(location = %request.location.id))]
    async fn issue(&self, request: &IssueRequest) -> Result<IssuedCredential, ProviderError> {
        let location = &request.location;
        let user = location.identity.as_deref().ok_or_else(|| {
            ProviderError::terminal(format!("location {} has no HDFS proxy user", location.id))
        })?;
        let namenode = request
            .scope
            .prefixes
            .first()
            .map(|p| p.authority.as_str())
            .ok_or_else(|| ProviderError::terminal("scope has no prefixes"))?;

        let token = self
            .client
            .delegation_token(namenode, user, self.renewer.as_deref())
            .await?;
        reject_expired(token.expires_at, request.now)?;

        let expires_at = token.expires_at.min(request.requested_expiry());
        debug!(namenode = %namenode, user = %user, expires_at = %expires_at, "vending HDFS delegation token");

        let credentials = request
            .scope
            .prefix_uris()
            .into_iter()
            .map(|prefix| StorageCredential::hdfs(prefix, token.token.expose().clone(), expires_at))
            .collect();

        Ok(IssuedCredential {
            credentials,
            expires_at,
        })
    }
}

#[cfg(feature = "hdfs")]
mod webhdfs {
    use serde::Deserialize;

    use super::*;

    /// WebHDFS endpoint settings.
    #[derive(Debug, Clone)]
    pub struct WebHdfsConfig {
        /// `http` or `https`.
        pub scheme: String,
        /// Namenode HTTP port (the RPC port in the location URI differs).
        pub http_port: u16,
    }

    impl Default for WebHdfsConfig {
        fn default() -> Self {
            Self {
                scheme: "http".to_string(),
                http_port: 9870,
            }
        }
    }

    #[derive(Deserialize)]
    struct TokenEnvelope {
        #[serde(rename = "Token")]
        token: TokenBody,
    }

    #[derive(Deserialize)]
    struct TokenBody {
        #[serde(rename = "urlString")]
        url_string: String,
    }

    #[derive(Deserialize)]
    struct RenewResponse {
        long: i64,
    }

    /// [`DelegationTokenClient`] over the WebHDFS REST API.
    ///
    /// Issues `GETDELEGATIONTOKEN`, then `RENEWDELEGATIONTOKEN` to learn the
    /// expiry.
    #[derive(Debug, Clone, Default)]
    pub struct WebHdfsClient {
        http: reqwest::Client,
        config: WebHdfsConfig,
    }

    impl WebHdfsClient {
        /// Creates a client.
        #[must_use]
        pub fn new(config: WebHdfsConfig) -> Self {
            Self {
                http: reqwest::Client::new(),
                config,
            }
        }

        fn base_url(&self, namenode: &str) -> String {
            let host = namenode.split(':').next().unwrap_or(namenode);
            format!("{}://{host}:{}/webhdfs/v1/", self.config.scheme, self.config.http_port)
        }

        async fn call<T: serde::de::DeserializeOwned>(
            &self,
            request: reqwest::RequestBuilder,
            context: &str,
        ) -> Result<T, ProviderError> {
            let response = request
                .send()
                .await
                .map_err(|e| ProviderError::retryable(format!("{context} failed: {e}")))?;
            let status = response.status();
            if !status.is_success() {
                return Err(ProviderError::from_status(status.as_u16(), context));
            }
            response
                .json()
                .await
                .map_err(|e| ProviderError::terminal(format!("invalid {context} response: {e}")))
        }
    }

    #[async_trait]
    impl DelegationTokenClient for WebHdfsClient {
        async fn delegation_token(
            &self,
            namenode: &str,
            user: &str,
            renewer: Option<&str>,
        ) -> Result<DelegationToken, ProviderError> {
            let base = self.base_url(namenode);
            let renewer = renewer.unwrap_or(user);

            let issued: TokenEnvelope = self
                .call(
                    self.http.get(&base).query(&[
                        ("op", "GETDELEGATIONTOKEN"),
                        ("user.name", user),
                        ("renewer", renewer),
                    ]),
                    "GETDELEGATIONTOKEN",
                )
                .await?;
            let token = issued.token.url_string;

            let renewed: RenewResponse = self
                .call(
                    self.http.put(&base).query(&[
                        ("op", "RENEWDELEGATIONTOKEN"),
                        ("user.name", renewer),
                        ("token", token.as_str()),
                    ]),
                    "RENEWDELEGATIONTOKEN",
                )
                .await?;
            let expires_at = DateTime::from_timestamp_millis(renewed.long).ok_or_else(|| {
                ProviderError::terminal(format!("namenode returned invalid expiry {}", renewed.long))
            })?;

            Ok(DelegationToken {
                token: Redacted(token),
                expires_at,
            })
        }
    }
}

#[cfg(feature = "hdfs")]
pub use webhdfs::{WebHdfsClient, WebHdfsConfig};

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::credentials::test_support::{fixed_now, request_for};
    use crate::types::{Operation, StorageLocation};

    struct FakeNamenode {
        lifetime: chrono::Duration,
        seen: Mutex<Vec<(String, String, Option<String>)>>,
    }

    #[async_trait]
    impl DelegationTokenClient for FakeNamenode {
        async fn delegation_token(
            &self,
            namenode: &str,
            user: &str,
            renewer: Option<&str>,
        ) -> Result<DelegationToken, ProviderError> {
            self.seen
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push((namenode.to_string(), user.to_string(), renewer.map(String::from)));
            Ok(DelegationToken {
                token: Redacted("HAAEZXRs".into()),
                expires_at: fixed_now() + self.lifetime,
            })
        }
    }

    fn location() -> StorageLocation {
        StorageLocation::new("loc-hdfs", ProviderKind::DistributedFs, "hdfs://nn1:8020/warehouse/")
            .with_identity("etl")
    }

    #[tokio::test]
    async fn token_expiry_is_capped_by_session() {
        let namenode = Arc::new(FakeNamenode {
            lifetime: chrono::Duration::days(1),
            seen: Mutex::new(Vec::new()),
        });
        let provider = HdfsCredentialProvider::new(namenode.clone()).with_renewer("yarn");
        let request = request_for(&location(), &[Operation::Read], &["hdfs://nn1:8020/warehouse/db/t/"]);

        let issued = provider
            .issue(&request)
            .await
            .unwrap_or_else(|e| panic!("issue failed: {e}"));

        assert_eq!(issued.expires_at, fixed_now() + chrono::Duration::hours(1));
        assert_eq!(issued.credentials.len(), 1);
        assert_eq!(
            issued.credentials[0].config.get("hdfs.delegation-token").map(String::as_str),
            Some("HAAEZXRs")
        );
        let seen = namenode.seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        assert_eq!(
            seen[0],
            ("nn1:8020".to_string(), "etl".to_string(), Some("yarn".to_string()))
        );
    }

    #[tokio::test]
    async fn missing_proxy_user_is_terminal() {
        let provider = HdfsCredentialProvider::new(Arc::new(FakeNamenode {
            lifetime: chrono::Duration::hours(1),
            seen: Mutex::new(Vec::new()),
        }));
        let location = StorageLocation::new("loc", ProviderKind::DistributedFs, "hdfs://nn1/");
        let request = request_for(&location, &[Operation::Read], &["hdfs://nn1/x/"]);
        let err = provider.issue(&request).await.expect_err("no user");
        assert!(!err.is_retryable());
    }
}
