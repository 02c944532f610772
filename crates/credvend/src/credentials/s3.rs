//! S3 credential provider using STS `AssumeRole` with an inline session policy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use credvend_core::Redacted;
use tracing::{debug, instrument};

use super::{CredentialProvider, IssueRequest, IssuedCredential, ProviderError, reject_expired};
use crate::types::{ProviderKind, StorageCredential};

/// Parameters of one `AssumeRole` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumeRoleRequest {
    /// Role to assume.
    pub role_arn: String,
    /// `RoleSessionName`.
    pub session_name: String,
    /// Inline session policy (canonical JSON).
    pub policy: String,
    /// Requested session duration.
    pub duration: Duration,
    /// External id, if the role's trust policy requires one.
    pub external_id: Option<String>,
    /// Region to call STS in.
    pub region: Option<String>,
    /// Endpoint override for S3-compatible stores.
    pub endpoint: Option<String>,
}

/// Temporary credentials returned by STS.
#[derive(Clone)]
pub struct SessionCredentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: Redacted<String>,
    /// Session token.
    pub session_token: Redacted<String>,
    /// Expiration reported by STS.
    pub expiration: DateTime<Utc>,
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("secret_access_key", &self.secret_access_key)
            .field("session_token", &self.session_token)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

/// Token exchange against STS.
#[async_trait]
pub trait StsClient: Send + Sync {
    /// Calls `AssumeRole`.
    async fn assume_role(&self, request: AssumeRoleRequest) -> Result<SessionCredentials, ProviderError>;
}

/// S3 credential provider.
pub struct S3CredentialProvider {
    sts: Arc<dyn StsClient>,
}

impl fmt::Debug for S3CredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3CredentialProvider").finish_non_exhaustive()
    }
}

impl S3CredentialProvider {
    /// Creates a provider over `sts`.
    #[must_use]
    pub fn new(sts: Arc<dyn StsClient>) -> Self {
        Self { sts }
    }
}

#[async_trait]
impl CredentialProvider for S3CredentialProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ObjectStore
    }

    #[instrument(skip_all, fields(location = %request.location.id, session = %request.session_name))]
    async fn issue(&self, request: &IssueRequest) -> Result<IssuedCredential, ProviderError> {
        let location = &request.location;
        let role_arn = location.identity.clone().ok_or_else(|| {
            ProviderError::terminal(format!("location {} has no role to assume", location.id))
        })?;

        let creds = self
            .sts
            .assume_role(AssumeRoleRequest {
                role_arn,
                session_name: request.session_name.clone(),
                policy: request.scope.policy.clone(),
                duration: request.session_duration,
                external_id: location.options.external_id.clone(),
                region: location.options.region.clone(),
                endpoint: location.options.endpoint.clone(),
            })
            .await?;

        reject_expired(creds.expiration, request.now)?;

        debug!(
            prefixes = request.scope.prefixes.len(),
            expires_at = %creds.expiration,
            "vending S3 session credentials"
        );

        let credentials = request
            .scope
            .prefix_uris()
            .into_iter()
            .map(|prefix| {
                let mut cred = StorageCredential::s3(
                    prefix,
                    creds.access_key_id.clone(),
                    creds.secret_access_key.expose().clone(),
                    creds.session_token.expose().clone(),
                    creds.expiration,
                );
                if let Some(region) = &location.options.region {
                    cred = cred.with_property("client.region", region.clone());
                }
                if let Some(endpoint) = &location.options.endpoint {
                    cred = cred.with_property("s3.endpoint", endpoint.clone());
                }
                if location.options.path_style_access {
                    cred = cred.with_property("s3.path-style-access", "true");
                }
                cred
            })
            .collect();

        Ok(IssuedCredential {
            credentials,
            expires_at: creds.expiration,
        })
    }
}

#[cfg(feature = "aws")]
mod aws {
    use aws_config::BehaviorVersion;
    use aws_sdk_sts::config::{Credentials, Region};
    use aws_sdk_sts::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

    use super::*;

    const STATIC_CREDENTIALS_SOURCE: &str = "credvend-static";

    const RETRYABLE_CODES: &[&str] = &[
        "Throttling",
        "ThrottlingException",
        "RequestLimitExceeded",
        "IDPCommunicationError",
        "ServiceUnavailable",
        "InternalFailure",
    ];

    /// [`StsClient`] backed by `aws-sdk-sts`.
    #[derive(Debug, Clone)]
    pub struct AwsStsClient {
        base: aws_config::SdkConfig,
    }

    impl AwsStsClient {
        /// Loads the default AWS credential chain and region.
        pub async fn from_env() -> Self {
            Self::new(aws_config::load_defaults(BehaviorVersion::latest()).await)
        }

        /// Wraps an existing SDK configuration.
        #[must_use]
        pub fn new(base: aws_config::SdkConfig) -> Self {
            Self { base }
        }

        /// Uses a fixed access key pair instead of the default credential
        /// chain. `region` falls back to the default region chain.
        pub async fn with_static_keys(
            access_key_id: impl Into<String>,
            secret_access_key: impl Into<String>,
            region: Option<&str>,
        ) -> Self {
            let credentials = Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                STATIC_CREDENTIALS_SOURCE,
            );
            let mut loader =
                aws_config::defaults(BehaviorVersion::latest()).credentials_provider(credentials);
            if let Some(region) = region {
                loader = loader.region(Region::new(region.to_string()));
            }
            Self::new(loader.load().await)
        }

        fn client(&self, region: Option<&str>, endpoint: Option<&str>) -> aws_sdk_sts::Client {
            let mut builder = aws_sdk_sts::config::Builder::from(&self.base);
            if let Some(region) = region {
                builder = builder.region(Region::new(region.to_string()));
            }
            if let Some(endpoint) = endpoint {
                builder = builder.endpoint_url(endpoint);
            }
            aws_sdk_sts::Client::from_conf(builder.build())
        }
    }

    fn classify<E, R>(err: &SdkError<E, R>) -> ProviderError
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
        R: fmt::Debug,
    {
        let message = format!("sts AssumeRole failed: {}", DisplayErrorContext(err));
        match err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                ProviderError::retryable(message)
            }
            SdkError::ServiceError(_) => {
                if err.code().is_some_and(|code| RETRYABLE_CODES.contains(&code)) {
                    ProviderError::retryable(message)
                } else {
                    ProviderError::terminal(message)
                }
            }
            _ => ProviderError::terminal(message),
        }
    }

    #[async_trait]
    impl StsClient for AwsStsClient {
        async fn assume_role(
            &self,
            request: AssumeRoleRequest,
        ) -> Result<SessionCredentials, ProviderError> {
            let client = self.client(request.region.as_deref(), request.endpoint.as_deref());
            let duration_secs = i32::try_from(request.duration.as_secs()).unwrap_or(i32::MAX);

            let output = client
                .assume_role()
                .role_arn(&request.role_arn)
                .role_session_name(&request.session_name)
                .policy(&request.policy)
                .duration_seconds(duration_secs)
                .set_external_id(request.external_id.clone())
                .send()
                .await
                .map_err(|e| classify(&e))?;

            let creds = output
                .credentials()
                .ok_or_else(|| ProviderError::retryable("sts AssumeRole returned no credentials"))?;
            let expiration = creds.expiration();
            let expiration = DateTime::from_timestamp(expiration.secs(), expiration.subsec_nanos())
                .ok_or_else(|| ProviderError::terminal("sts returned an unrepresentable expiration"))?;

            Ok(SessionCredentials {
                access_key_id: creds.access_key_id().to_string(),
                secret_access_key: Redacted(creds.secret_access_key().to_string()),
                session_token: Redacted(creds.session_token().to_string()),
                expiration,
            })
        }
    }

}

#[cfg(feature = "aws")]
pub use aws::AwsStsClient;
