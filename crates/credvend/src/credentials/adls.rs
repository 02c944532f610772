//! ADLS credential provider: user delegation key + user delegation SAS.
//!
//! One key is fetched per issue; each prefix then gets its own
//! directory-scoped SAS (`sr=d`), or a container SAS (`sr=c`) when the prefix
//! is the container root.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use credvend_core::Redacted;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, instrument};

use super::{CredentialProvider, IssueRequest, IssuedCredential, ProviderError, reject_expired};
use crate::policy::{AdlsAuthority, sas_permissions};
use crate::types::{ProviderKind, StorageCredential};

/// Storage service version used for signing.
pub const SAS_VERSION: &str = "2020-12-06";

const SAS_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// A user delegation key as returned by the Blob service.
#[derive(Clone)]
pub struct UserDelegationKey {
    /// `SignedOid`.
    pub signed_oid: String,
    /// `SignedTid`.
    pub signed_tid: String,
    /// `SignedStart`, verbatim.
    pub signed_start: String,
    /// `SignedExpiry`, verbatim.
    pub signed_expiry: String,
    /// `SignedService`.
    pub signed_service: String,
    /// `SignedVersion`.
    pub signed_version: String,
    /// Base64 key value.
    pub value: Redacted<String>,
    /// `SignedExpiry`, parsed.
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for UserDelegationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserDelegationKey")
            .field("signed_oid", &self.signed_oid)
            .field("signed_tid", &self.signed_tid)
            .field("signed_expiry", &self.signed_expiry)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

/// Source of user delegation keys.
#[async_trait]
pub trait DelegationKeySource: Send + Sync {
    /// Requests a key for `account` valid from `start` to `expiry`.
    async fn user_delegation_key(
        &self,
        account: &str,
        start: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<UserDelegationKey, ProviderError>;
}

/// Inputs to one SAS signature.
#[derive(Debug, Clone, Copy)]
pub struct SasParams<'a> {
    /// Storage account name.
    pub account: &'a str,
    /// Container name.
    pub container: &'a str,
    /// Directory path without leading or trailing slash; empty for the container.
    pub directory: &'a str,
    /// Permission letters in service order.
    pub permissions: &'a str,
    /// Validity start.
    pub start: DateTime<Utc>,
    /// Validity end.
    pub expiry: DateTime<Utc>,
    /// `scid`, logged by the service for correlation.
    pub correlation_id: &'a str,
}

/// Signs a user delegation SAS and returns its query string (no leading `?`).
///
/// # Errors
///
/// Returns [`ProviderError::Terminal`] if the key value is not valid base64.
pub fn sign_user_delegation_sas(key: &UserDelegationKey, params: &SasParams<'_>) -> Result<String, ProviderError> {
    let start = params.start.format(SAS_TIME_FORMAT).to_string();
    let expiry = params.expiry.format(SAS_TIME_FORMAT).to_string();
    let (resource, depth) = if params.directory.is_empty() {
        ("c", None)
    } else {
        ("d", Some(params.directory.split('/').count()))
    };
    let canonical_resource = if params.directory.is_empty() {
        format!("/blob/{}/{}", params.account, params.container)
    } else {
        format!("/blob/{}/{}/{}", params.account, params.container, params.directory)
    };

    let string_to_sign = [
        params.permissions,
        start.as_str(),
        expiry.as_str(),
        canonical_resource.as_str(),
        key.signed_oid.as_str(),
        key.signed_tid.as_str(),
        key.signed_start.as_str(),
        key.signed_expiry.as_str(),
        key.signed_service.as_str(),
        key.signed_version.as_str(),
        "", // saoid
        "", // suoid
        params.correlation_id,
        "", // sip
        "https",
        SAS_VERSION,
        resource,
        "", // snapshot time
        "", // encryption scope
        "", // rscc
        "", // rscd
        "", // rsce
        "", // rscl
        "", // rsct
    ]
    .join("\n");

    let key_bytes = STANDARD
        .decode(key.value.expose())
        .map_err(|e| ProviderError::terminal(format!("user delegation key is not base64: {e}")))?;
    let mut mac = Hmac::<Sha256>::new_from_slice(&key_bytes)
        .map_err(|e| ProviderError::terminal(format!("invalid user delegation key: {e}")))?;
    mac.update(string_to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let mut query = vec![
        ("sp", params.permissions.to_string()),
        ("st", start),
        ("se", expiry),
        ("skoid", key.signed_oid.clone()),
        ("sktid", key.signed_tid.clone()),
        ("skt", key.signed_start.clone()),
        ("ske", key.signed_expiry.clone()),
        ("sks", key.signed_service.clone()),
        ("skv", key.signed_version.clone()),
    ];
    if !params.correlation_id.is_empty() {
        query.push(("scid", params.correlation_id.to_string()));
    }
    query.push(("spr", "https".to_string()));
    query.push(("sv", SAS_VERSION.to_string()));
    query.push(("sr", resource.to_string()));
    if let Some(depth) = depth {
        query.push(("sdd", depth.to_string()));
    }
    query.push(("sig", signature));

    Ok(query
        .into_iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(&v)))
        .collect::<Vec<_>>()
        .join("&"))
}

/// ADLS credential provider.
pub struct AdlsCredentialProvider {
    keys: Arc<dyn DelegationKeySource>,
}

impl fmt::Debug for AdlsCredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdlsCredentialProvider").finish_non_exhaustive()
    }
}

impl AdlsCredentialProvider {
    /// Creates a provider over `keys`.
    #[must_use]
    pub fn new(keys: Arc<dyn DelegationKeySource>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl CredentialProvider for AdlsCredentialProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::BlobContainer
    }

    #[instrument(skip_all, fields(location = %request.location.id))]
    async fn issue(&self, request: &IssueRequest) -> Result<IssuedCredential, ProviderError> {
        let scope = &request.scope;
        let first = scope
            .prefixes
            .first()
            .ok_or_else(|| ProviderError::terminal("scope has no prefixes"))?;
        let authority = AdlsAuthority::parse(&first.authority).ok_or_else(|| {
            ProviderError::terminal(format!("'{}' is not an ADLS authority", first.authority))
        })?;

        let requested_expiry = request.requested_expiry();
        let key = self
            .keys
            .user_delegation_key(authority.account, request.now, requested_expiry)
            .await?;
        reject_expired(key.expires_at, request.now)?;

        let expires_at = requested_expiry.min(key.expires_at);
        let permissions = sas_permissions(&scope.actions);

        let mut credentials = Vec::with_capacity(scope.prefixes.len());
        for prefix in &scope.prefixes {
            let token = sign_user_delegation_sas(
                &key,
                &SasParams {
                    account: authority.account,
                    container: authority.container,
                    directory: prefix.key.trim_end_matches('/'),
                    permissions: &permissions,
                    start: request.now,
                    expiry: expires_at,
                    correlation_id: &request.session_name,
                },
            )?;
            credentials.push(StorageCredential::adls(
                prefix.uri(),
                authority.host,
                token,
                expires_at,
            ));
        }

        debug!(
            prefixes = credentials.len(),
            permissions = %permissions,
            expires_at = %expires_at,
            "vending ADLS user delegation SAS"
        );

        Ok(IssuedCredential {
            credentials,
            expires_at,
        })
    }
}

#[cfg(feature = "azure")]
mod azure {
    use serde::Deserialize;
    use tokio::sync::Mutex;

    use super::*;

    const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
    const DEFAULT_BLOB_SUFFIX: &str = "blob.core.windows.net";
    const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";
    const TOKEN_REFRESH_SKEW_SECS: i64 = 60;

    #[derive(Deserialize)]
    struct TokenResponse {
        access_token: String,
        expires_in: i64,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct KeyResponse {
        signed_oid: String,
        signed_tid: String,
        signed_start: String,
        signed_expiry: String,
        signed_service: String,
        signed_version: String,
        value: String,
    }

    struct CachedToken {
        value: Redacted<String>,
        expires_at: DateTime<Utc>,
    }

    /// [`DelegationKeySource`] using an Entra ID service principal.
    pub struct AzureDelegationKeyClient {
        http: reqwest::Client,
        tenant_id: String,
        client_id: String,
        client_secret: Redacted<String>,
        authority_host: String,
        blob_suffix: String,
        token: Mutex<Option<CachedToken>>,
    }

    impl fmt::Debug for AzureDelegationKeyClient {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("AzureDelegationKeyClient")
                .field("tenant_id", &self.tenant_id)
                .field("client_id", &self.client_id)
                .field("client_secret", &self.client_secret)
                .finish_non_exhaustive()
        }
    }

    impl AzureDelegationKeyClient {
        /// Creates a client for a service principal.
        #[must_use]
        pub fn new(
            tenant_id: impl Into<String>,
            client_id: impl Into<String>,
            client_secret: impl Into<String>,
        ) -> Self {
            Self {
                http: reqwest::Client::new(),
                tenant_id: tenant_id.into(),
                client_id: client_id.into(),
                client_secret: Redacted(client_secret.into()),
                authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
                blob_suffix: DEFAULT_BLOB_SUFFIX.to_string(),
                token: Mutex::new(None),
            }
        }

        /// Overrides the Entra ID authority host (sovereign clouds).
        #[must_use]
        pub fn with_authority_host(mut self, host: impl Into<String>) -> Self {
            self.authority_host = host.into();
            self
        }

        /// Overrides the blob endpoint suffix (sovereign clouds, emulators).
        #[must_use]
        pub fn with_blob_suffix(mut self, suffix: impl Into<String>) -> Self {
            self.blob_suffix = suffix.into();
            self
        }

        async fn access_token(&self) -> Result<String, ProviderError> {
            let mut cached = self.token.lock().await;
            let now = Utc::now();
            if let Some(token) = cached.as_ref() {
                if token.expires_at - chrono::Duration::seconds(TOKEN_REFRESH_SKEW_SECS) > now {
                    return Ok(token.value.expose().clone());
                }
            }

            let url = format!(
                "{}/{}/oauth2/v2.0/token",
                self.authority_host.trim_end_matches('/'),
                self.tenant_id
            );
            let body = format!(
                "grant_type=client_credentials&client_id={}&client_secret={}&scope={}",
                urlencoding::encode(&self.client_id),
                urlencoding::encode(self.client_secret.expose()),
                urlencoding::encode(STORAGE_SCOPE),
            );
            let response = self
                .http
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(body)
                .send()
                .await
                .map_err(|e| transport_error("entra token request", &e))?;
            let status = response.status();
            if !status.is_success() {
                return Err(ProviderError::from_status(status.as_u16(), "entra token request"));
            }
            let token: TokenResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::terminal(format!("invalid entra token response: {e}")))?;

            let value = token.access_token.clone();
            *cached = Some(CachedToken {
                value: Redacted(token.access_token),
                expires_at: now + chrono::Duration::seconds(token.expires_in),
            });
            Ok(value)
        }
    }

    fn transport_error(context: &str, err: &reqwest::Error) -> ProviderError {
        ProviderError::retryable(format!("{context} failed: {err}"))
    }

    fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>, ProviderError> {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| ProviderError::terminal(format!("invalid {field} '{value}': {e}")))
    }

    #[async_trait]
    impl DelegationKeySource for AzureDelegationKeyClient {
        async fn user_delegation_key(
            &self,
            account: &str,
            start: DateTime<Utc>,
            expiry: DateTime<Utc>,
        ) -> Result<UserDelegationKey, ProviderError> {
            let token = self.access_token().await?;
            let url = format!(
                "https://{account}.{}/?restype=service&comp=userdelegationkey",
                self.blob_suffix
            );
            let body = format!(
                "<?xml version=\"1.0\" encoding=\"utf-8\"?><KeyInfo><Start>{}</Start><Expiry>{}</Expiry></KeyInfo>",
                start.format(SAS_TIME_FORMAT),
                expiry.format(SAS_TIME_FORMAT)
            );

            let response = self
                .http
                .post(url)
                .bearer_auth(token)
                .header("x-ms-version", SAS_VERSION)
                .header(reqwest::header::CONTENT_TYPE, "application/xml")
                .body(body)
                .send()
                .await
                .map_err(|e| transport_error("get user delegation key", &e))?;
            let status = response.status();
            if !status.is_success() {
                return Err(ProviderError::from_status(
                    status.as_u16(),
                    "get user delegation key",
                ));
            }
            let text = response
                .text()
                .await
                .map_err(|e| transport_error("read user delegation key", &e))?;
            let key: KeyResponse = quick_xml::de::from_str(&text)
                .map_err(|e| ProviderError::terminal(format!("invalid user delegation key XML: {e}")))?;

            Ok(UserDelegationKey {
                expires_at: parse_time("SignedExpiry", &key.signed_expiry)?,
                signed_oid: key.signed_oid,
                signed_tid: key.signed_tid,
                signed_start: key.signed_start,
                signed_expiry: key.signed_expiry,
                signed_service: key.signed_service,
                signed_version: key.signed_version,
                value: Redacted(key.value),
            })
        }
    }
}

#[cfg(feature = "azure")]
pub use azure::AzureDelegationKeyClient;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::credentials::test_support::{fixed_now, request_for};
    use crate::types::{Operation, StorageLocation};

    const KEY_VALUE: &str = "c2VjcmV0LWRlbGVnYXRpb24ta2V5LWJ5dGVz";

    fn key(expires_at: DateTime<Utc>) -> UserDelegationKey {
        UserDelegationKey {
            signed_oid: "oid-1".into(),
            signed_tid: "tid-1".into(),
            signed_start: "2025-01-15T12:00:00Z".into(),
            signed_expiry: expires_at.format(SAS_TIME_FORMAT).to_string(),
            signed_service: "b".into(),
            signed_version: SAS_VERSION.into(),
            value: Redacted(KEY_VALUE.into()),
            expires_at,
        }
    }

    struct FakeKeys {
        calls: AtomicUsize,
        lifetime: chrono::Duration,
    }

    #[async_trait]
    impl DelegationKeySource for FakeKeys {
        async fn user_delegation_key(
            &self,
            account: &str,
            start: DateTime<Utc>,
            _expiry: DateTime<Utc>,
        ) -> Result<UserDelegationKey, ProviderError> {
            assert_eq!(account, "acct");
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(key(start + self.lifetime))
        }
    }

    fn location() -> StorageLocation {
        StorageLocation::new(
            "loc-adls",
            ProviderKind::BlobContainer,
            "abfss://lake@acct.dfs.core.windows.net/",
        )
    }

    fn query_value<'a>(token: &'a str, name: &str) -> Option<&'a str> {
        token
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    #[test]
    fn directory_sas_signature_matches_string_to_sign() {
        let start = fixed_now();
        let expiry = start + chrono::Duration::hours(1);
        let key = key(expiry);
        let token = sign_user_delegation_sas(
            &key,
            &SasParams {
                account: "acct",
                container: "lake",
                directory: "warehouse/t1",
                permissions: "rl",
                start,
                expiry,
                correlation_id: "",
            },
        )
        .unwrap_or_else(|e| panic!("sign failed: {e}"));

        let expected_string = [
            "rl",
            "2025-01-15T12:00:00Z",
            "2025-01-15T13:00:00Z",
            "/blob/acct/lake/warehouse/t1",
            "oid-1",
            "tid-1",
            "2025-01-15T12:00:00Z",
            "2025-01-15T13:00:00Z",
            "b",
            SAS_VERSION,
            "",
            "",
            "",
            "",
            "https",
            SAS_VERSION,
            "d",
            "",
            "",
            "",
            "",
            "",
            "",
            "",
        ]
        .join("\n");
        let key_bytes = STANDARD
            .decode(KEY_VALUE)
            .unwrap_or_else(|e| panic!("decode: {e}"));
        let mut mac = Hmac::<Sha256>::new_from_slice(&key_bytes).unwrap_or_else(|e| panic!("{e}"));
        mac.update(expected_string.as_bytes());
        let expected_sig = STANDARD.encode(mac.finalize().into_bytes());

        let encoded_sig = urlencoding::encode(&expected_sig).into_owned();
        assert_eq!(query_value(&token, "sig"), Some(encoded_sig.as_str()));
        assert_eq!(query_value(&token, "sr"), Some("d"));
        assert_eq!(query_value(&token, "sdd"), Some("2"));
        assert_eq!(query_value(&token, "sp"), Some("rl"));
        assert_eq!(query_value(&token, "se"), Some("2025-01-15T13%3A00%3A00Z"));
        assert!(query_value(&token, "scid").is_none());
    }

    #[test]
    fn container_root_gets_container_sas() {
        let start = fixed_now();
        let token = sign_user_delegation_sas(
            &key(start + chrono::Duration::hours(1)),
            &SasParams {
                account: "acct",
                container: "lake",
                directory: "",
                permissions: "racwdl",
                start,
                expiry: start + chrono::Duration::hours(1),
                correlation_id: "credvend-alice",
            },
        )
        .unwrap_or_else(|e| panic!("sign failed: {e}"));
        assert_eq!(query_value(&token, "sr"), Some("c"));
        assert!(query_value(&token, "sdd").is_none());
        assert_eq!(query_value(&token, "scid"), Some("credvend-alice"));
    }

    #[test]
    fn invalid_key_value_is_terminal() {
        let mut bad = key(fixed_now());
        bad.value = Redacted("not base64!".into());
        let err = sign_user_delegation_sas(
            &bad,
            &SasParams {
                account: "acct",
                container: "lake",
                directory: "",
                permissions: "r",
                start: fixed_now(),
                expiry: fixed_now(),
                correlation_id: "",
            },
        )
        .expect_err("bad key");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn issues_one_sas_per_prefix_with_one_key() {
        let keys = Arc::new(FakeKeys {
            calls: AtomicUsize::new(0),
            lifetime: chrono::Duration::minutes(30),
        });
        let provider = AdlsCredentialProvider::new(keys.clone());
        let request = request_for(
            &location(),
            &[Operation::Read, Operation::Write],
            &[
                "abfss://lake@acct.dfs.core.windows.net/wh/t1/",
                "abfss://lake@acct.dfs.core.windows.net/wh/t2/",
            ],
        );

        let issued = provider
            .issue(&request)
            .await
            .unwrap_or_else(|e| panic!("issue failed: {e}"));

        assert_eq!(keys.calls.load(Ordering::SeqCst), 1);
        assert_eq!(issued.credentials.len(), 2);
        // Key expiry (30m) is tighter than the requested hour.
        assert_eq!(issued.expires_at, fixed_now() + chrono::Duration::minutes(30));
        let host_key = "adls.sas-token.acct.dfs.core.windows.net";
        for cred in &issued.credentials {
            let token = cred
                .config
                .get(host_key)
                .unwrap_or_else(|| panic!("missing {host_key}"));
            assert_eq!(query_value(token, "sp"), Some("racwl"));
            assert_eq!(query_value(token, "sdd"), Some("2"));
        }
        assert_eq!(issued.credentials[0].prefix, "abfss://lake@acct.dfs.core.windows.net/wh/t1/");
    }

    #[tokio::test]
    async fn expired_key_is_retryable() {
        let provider = AdlsCredentialProvider::new(Arc::new(FakeKeys {
            calls: AtomicUsize::new(0),
            lifetime: chrono::Duration::zero(),
        }));
        let request = request_for(
            &location(),
            &[Operation::Read],
            &["abfss://lake@acct.dfs.core.windows.net/wh/"],
        );
        let err = provider.issue(&request).await.expect_err("expired key");
        assert!(err.is_retryable());
    }
}
