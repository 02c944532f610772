//! Data model for credential vending.
//!
//! Locations, intents and principals come from the catalog and are never
//! mutated here. Scopes and credentials are produced by this crate.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use credvend_core::canonical_json::sha256_fingerprint;
use serde::{Deserialize, Serialize};

use crate::error::VendResult;
use crate::scope_key::ScopeKey;

/// The storage backend family a location lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// S3 and S3-compatible object stores.
    ObjectStore,
    /// Azure Data Lake Storage / blob containers.
    BlobContainer,
    /// HDFS.
    DistributedFs,
    /// Google Cloud Storage.
    Gcs,
}

impl ProviderKind {
    /// Every provider kind, in shard order.
    pub const ALL: [Self; 4] = [
        Self::ObjectStore,
        Self::BlobContainer,
        Self::DistributedFs,
        Self::Gcs,
    ];

    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ObjectStore => "s3",
            Self::BlobContainer => "adls",
            Self::DistributedFs => "hdfs",
            Self::Gcs => "gcs",
        }
    }

    /// URI schemes accepted for locations of this kind.
    #[must_use]
    pub const fn schemes(self) -> &'static [&'static str] {
        match self {
            Self::ObjectStore => &["s3", "s3a"],
            Self::BlobContainer => &["abfs", "abfss", "wasb", "wasbs"],
            Self::DistributedFs => &["hdfs"],
            Self::Gcs => &["gs"],
        }
    }

    /// Returns true if `scheme` (lowercase) is accepted by this kind.
    #[must_use]
    pub fn accepts_scheme(self, scheme: &str) -> bool {
        self.schemes().contains(&scheme)
    }

    /// Longest session the provider itself will grant.
    #[must_use]
    pub const fn max_session_duration(self) -> Duration {
        match self {
            Self::ObjectStore => Duration::from_secs(12 * 3600),
            Self::BlobContainer | Self::DistributedFs => Duration::from_secs(7 * 24 * 3600),
            Self::Gcs => Duration::from_secs(3600),
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::ObjectStore => 0,
            Self::BlobContainer => 1,
            Self::DistributedFs => 2,
            Self::Gcs => 3,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A storage operation a principal may request.
///
/// Declaration order is the normalization order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Read object contents.
    Read,
    /// Create or overwrite objects.
    Write,
    /// Enumerate objects under a prefix.
    List,
    /// Remove objects.
    Delete,
}

impl Operation {
    /// Every operation, in normalization order.
    pub const ALL: [Self; 4] = [Self::Read, Self::Write, Self::List, Self::Delete];

    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::List => "list",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider connection options attached to a location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Cloud region (S3 only).
    pub region: Option<String>,
    /// Endpoint override for S3-compatible stores.
    pub endpoint: Option<String>,
    /// Use path-style addressing (S3-compatible stores).
    pub path_style_access: bool,
    /// External id presented when assuming the role.
    pub external_id: Option<String>,
}

/// A catalog-registered storage location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocation {
    /// Catalog-assigned location id.
    pub id: String,
    /// Backend family.
    pub kind: ProviderKind,
    /// Root URI; every vended prefix lies beneath it.
    pub root: String,
    /// Assumable identity: role ARN, HDFS proxy user, or service account.
    #[serde(default)]
    pub identity: Option<String>,
    /// Administrator-set ceiling on session duration.
    #[serde(default)]
    pub session_ceiling: Option<Duration>,
    /// Provider connection options.
    #[serde(default)]
    pub options: ConnectionOptions,
}

impl StorageLocation {
    /// Creates a location with no identity, ceiling or options.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ProviderKind, root: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            root: root.into(),
            identity: None,
            session_ceiling: None,
            options: ConnectionOptions::default(),
        }
    }

    /// Sets the assumable identity.
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Sets the session-duration ceiling.
    #[must_use]
    pub fn with_session_ceiling(mut self, ceiling: Duration) -> Self {
        self.session_ceiling = Some(ceiling);
        self
    }

    /// Sets the region.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.options.region = Some(region.into());
        self
    }

    /// Sets an endpoint override.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.options.endpoint = Some(endpoint.into());
        self
    }

    /// Enables or disables path-style access.
    #[must_use]
    pub fn with_path_style_access(mut self, enabled: bool) -> Self {
        self.options.path_style_access = enabled;
        self
    }

    /// Sets the external id.
    #[must_use]
    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.options.external_id = Some(external_id.into());
        self
    }

    /// Deterministic configuration fingerprint (hex SHA-256 of canonical JSON).
    ///
    /// # Errors
    ///
    /// Returns an internal error if the location cannot be serialized.
    pub fn fingerprint(&self) -> VendResult<String> {
        Ok(sha256_fingerprint(self)?)
    }
}

/// The operations and paths one catalog call needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessIntent {
    /// Requested operations.
    pub operations: BTreeSet<Operation>,
    /// Absolute URIs under the location root.
    pub paths: Vec<String>,
}

impl AccessIntent {
    /// Creates an intent from operations and paths.
    pub fn new<P>(
        operations: impl IntoIterator<Item = Operation>,
        paths: impl IntoIterator<Item = P>,
    ) -> Self
    where
        P: Into<String>,
    {
        Self {
            operations: operations.into_iter().collect(),
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

/// The caller and what the catalog allows it to do on the target entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    /// Principal identity.
    pub principal: String,
    /// Operations the catalog permits.
    pub permitted: BTreeSet<Operation>,
}

impl PrincipalContext {
    /// Creates a principal context.
    pub fn new(principal: impl Into<String>, permitted: impl IntoIterator<Item = Operation>) -> Self {
        Self {
            principal: principal.into(),
            permitted: permitted.into_iter().collect(),
        }
    }

    /// Returns the requested operations this principal is not permitted.
    #[must_use]
    pub fn missing(&self, requested: &BTreeSet<Operation>) -> Vec<Operation> {
        requested.difference(&self.permitted).copied().collect()
    }
}

/// A parsed `scheme://authority/key` path. Keys are empty or end with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StoragePath {
    /// Lowercase scheme.
    pub scheme: String,
    /// Bucket, container@account host, or namenode.
    pub authority: String,
    /// Directory key without a leading slash.
    pub key: String,
}

impl StoragePath {
    /// Renders the path back into a URI.
    #[must_use]
    pub fn uri(&self) -> String {
        format!("{}://{}/{}", self.scheme, self.authority, self.key)
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.key)
    }
}

/// Output of the policy builder for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderScope {
    /// Backend family.
    pub kind: ProviderKind,
    /// Location the scope was computed for.
    pub location_id: String,
    /// Minimal non-overlapping prefixes, sorted.
    pub prefixes: Vec<StoragePath>,
    /// Normalized operations.
    pub operations: BTreeSet<Operation>,
    /// Provider-native actions granted.
    pub actions: BTreeSet<String>,
    /// Canonical policy document.
    pub policy: String,
}

impl ProviderScope {
    /// Prefixes rendered as URIs.
    #[must_use]
    pub fn prefix_uris(&self) -> Vec<String> {
        self.prefixes.iter().map(StoragePath::uri).collect()
    }
}

/// One vended credential bound to a storage prefix.
///
/// `config` uses Iceberg REST property names.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCredential {
    /// Prefix this credential applies to; clients pick the longest match.
    pub prefix: String,
    /// Provider-specific properties.
    pub config: HashMap<String, String>,
}

impl fmt::Debug for StorageCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.config.keys().collect();
        keys.sort();
        f.debug_struct("StorageCredential")
            .field("prefix", &self.prefix)
            .field("config_keys", &keys)
            .finish_non_exhaustive()
    }
}

impl StorageCredential {
    /// Creates an S3 session credential.
    #[must_use]
    pub fn s3(
        prefix: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            config: HashMap::from([
                ("s3.access-key-id".to_string(), access_key_id.into()),
                ("s3.secret-access-key".to_string(), secret_access_key.into()),
                ("s3.session-token".to_string(), session_token.into()),
                (
                    "s3.session-token-expires-at-ms".to_string(),
                    expires_at.timestamp_millis().to_string(),
                ),
            ]),
        }
    }

    /// Creates an ADLS credential with a SAS token for `account_host`.
    #[must_use]
    pub fn adls(
        prefix: impl Into<String>,
        account_host: &str,
        sas_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            config: HashMap::from([
                (format!("adls.sas-token.{account_host}"), sas_token.into()),
                (
                    format!("adls.sas-token-expires-at-ms.{account_host}"),
                    expires_at.timestamp_millis().to_string(),
                ),
            ]),
        }
    }

    /// Creates a GCS credential with a downscoped `OAuth2` token.
    #[must_use]
    pub fn gcs(prefix: impl Into<String>, token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            prefix: prefix.into(),
            config: HashMap::from([
                ("gcs.oauth2.token".to_string(), token.into()),
                (
                    "gcs.oauth2.token-expires-at".to_string(),
                    expires_at.timestamp_millis().to_string(),
                ),
            ]),
        }
    }

    /// Creates an HDFS delegation-token credential.
    #[must_use]
    pub fn hdfs(prefix: impl Into<String>, token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            prefix: prefix.into(),
            config: HashMap::from([
                ("hdfs.delegation-token".to_string(), token.into()),
                (
                    "hdfs.delegation-token-expires-at-ms".to_string(),
                    expires_at.timestamp_millis().to_string(),
                ),
            ]),
        }
    }

    /// Adds a config property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// A credential held by the cache and shared with every matching request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCredential {
    /// Key the credential was issued for.
    pub key: ScopeKey,
    /// Provider-issued secret material.
    pub credentials: Vec<StorageCredential>,
    /// When the provider call succeeded.
    pub issued_at: DateTime<Utc>,
    /// Absolute expiry reported by the provider.
    pub expires_at: DateTime<Utc>,
}

impl CachedCredential {
    /// Iceberg-REST-shaped credentials to hand to clients.
    #[must_use]
    pub fn storage_credentials(&self) -> &[StorageCredential] {
        &self.credentials
    }

    /// Returns true while `now < expires_at - safety_margin`.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>, safety_margin: Duration) -> bool {
        let Ok(margin) = chrono::Duration::from_std(safety_margin) else {
            return false;
        };
        self.expires_at
            .checked_sub_signed(margin)
            .is_some_and(|usable_until| now < usable_until)
    }

    /// Returns true once the provider expiry has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0)
            .single()
            .unwrap_or_else(|| panic!("valid timestamp {secs}"))
    }

    #[test]
    fn provider_kind_schemes() {
        assert!(ProviderKind::ObjectStore.accepts_scheme("s3a"));
        assert!(ProviderKind::BlobContainer.accepts_scheme("wasbs"));
        assert!(!ProviderKind::DistributedFs.accepts_scheme("s3"));
        assert!(!ProviderKind::Gcs.accepts_scheme("gcs"));
        assert_eq!(
            ProviderKind::Gcs.max_session_duration(),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn operations_are_ordered_for_normalization() {
        let ops: BTreeSet<Operation> = [Operation::Delete, Operation::Read, Operation::List]
            .into_iter()
            .collect();
        let ordered: Vec<Operation> = ops.into_iter().collect();
        assert_eq!(
            ordered,
            vec![Operation::Read, Operation::List, Operation::Delete]
        );
    }

    #[test]
    fn principal_reports_missing_operations() {
        let principal = PrincipalContext::new("alice", [Operation::Read]);
        let requested: BTreeSet<Operation> = [Operation::Read, Operation::Write].into_iter().collect();
        assert_eq!(principal.missing(&requested), vec![Operation::Write]);
    }

    #[test]
    fn fingerprint_tracks_configuration() {
        let a = StorageLocation::new("loc", ProviderKind::ObjectStore, "s3://b/")
            .with_identity("arn:aws:iam::123456789012:role/r");
        let b = a.clone().with_region("us-west-2");
        let fa = a.fingerprint().unwrap_or_else(|e| panic!("fingerprint: {e}"));
        let fa2 = a.fingerprint().unwrap_or_else(|e| panic!("fingerprint: {e}"));
        let fb = b.fingerprint().unwrap_or_else(|e| panic!("fingerprint: {e}"));
        assert_eq!(fa, fa2);
        assert_ne!(fa, fb);
    }

    #[test]
    fn storage_credential_debug_hides_secrets() {
        let cred = StorageCredential::s3("s3://b/t/", "AKIAEXAMPLE", "sekrit", "tok", at(1_700_000_000));
        let rendered = format!("{cred:?}");
        assert!(rendered.contains("s3.access-key-id"));
        assert!(!rendered.contains("sekrit"));
        assert!(!rendered.contains("AKIAEXAMPLE"));
        assert_eq!(
            cred.config.get("s3.session-token-expires-at-ms").map(String::as_str),
            Some("1700000000000")
        );
    }

    #[test]
    fn adls_properties_are_keyed_by_account_host() {
        let cred = StorageCredential::adls(
            "abfss://c@acct.dfs.core.windows.net/t/",
            "acct.dfs.core.windows.net",
            "sv=2020-12-06&sig=x",
            at(10),
        );
        assert!(cred.config.contains_key("adls.sas-token.acct.dfs.core.windows.net"));
        assert_eq!(
            cred.config
                .get("adls.sas-token-expires-at-ms.acct.dfs.core.windows.net")
                .map(String::as_str),
            Some("10000")
        );
    }

    #[test]
    fn freshness_respects_safety_margin() {
        let cred = CachedCredential {
            key: ScopeKey::from_parts(ProviderKind::Gcs, "loc", "00"),
            credentials: vec![],
            issued_at: at(0),
            expires_at: at(3600),
        };
        let margin = Duration::from_secs(120);
        assert!(cred.is_fresh(at(3479), margin));
        assert!(!cred.is_fresh(at(3480), margin));
        assert!(!cred.is_expired(at(3599)));
        assert!(cred.is_expired(at(3600)));
    }
}
