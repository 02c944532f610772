//! Minimal-privilege scope computation.
//!
//! [`build_scope`] is pure: it parses and bounds-checks the requested paths,
//! collapses them to the smallest covering prefix set, maps operations to
//! provider-native actions and renders the provider policy document as
//! canonical JSON.

use std::collections::BTreeSet;

use credvend_core::canonical_json::to_canonical_string;
use serde_json::{Value, json};

use crate::error::{VendError, VendResult};
use crate::types::{AccessIntent, Operation, ProviderKind, ProviderScope, StorageLocation, StoragePath};

/// SAS permission letters in the order the service expects them.
pub const SAS_PERMISSION_ORDER: &str = "racwdl";

const GCS_OBJECT_VIEWER: &str = "inRole:roles/storage.objectViewer";
const GCS_OBJECT_CREATOR: &str = "inRole:roles/storage.objectCreator";

const S3_LIST_BUCKET: &str = "s3:ListBucket";
const S3_GET_BUCKET_LOCATION: &str = "s3:GetBucketLocation";

// IAM wildcards and policy variables, CEL string delimiters, URI delimiters.
const RESERVED_CHARS: &[char] = &['*', '?', '#', '$', '{', '}', '[', ']', '\'', '"', '\\'];

/// Provider-native actions granted for one operation, or `None` if the
/// provider has no way to grant it.
#[must_use]
pub const fn native_actions(kind: ProviderKind, operation: Operation) -> Option<&'static [&'static str]> {
    match (kind, operation) {
        (ProviderKind::ObjectStore, Operation::Read) => {
            Some(&["s3:GetObject", "s3:GetObjectVersion", S3_LIST_BUCKET])
        }
        (ProviderKind::ObjectStore, Operation::List) => {
            Some(&[S3_LIST_BUCKET, S3_GET_BUCKET_LOCATION])
        }
        (ProviderKind::ObjectStore, Operation::Write) => Some(&[
            "s3:PutObject",
            "s3:AbortMultipartUpload",
            "s3:ListMultipartUploadParts",
        ]),
        (ProviderKind::ObjectStore, Operation::Delete) => Some(&["s3:DeleteObject"]),

        (ProviderKind::BlobContainer, Operation::Read) => Some(&["r", "l"]),
        (ProviderKind::BlobContainer, Operation::List) => Some(&["l"]),
        (ProviderKind::BlobContainer, Operation::Write) => Some(&["a", "c", "w"]),
        (ProviderKind::BlobContainer, Operation::Delete) => Some(&["d"]),

        (ProviderKind::DistributedFs, Operation::Read | Operation::List) => Some(&["READ", "EXECUTE"]),
        (ProviderKind::DistributedFs, Operation::Write | Operation::Delete) => {
            Some(&["WRITE", "EXECUTE"])
        }

        (ProviderKind::Gcs, Operation::Read | Operation::List) => Some(&[GCS_OBJECT_VIEWER]),
        (ProviderKind::Gcs, Operation::Write) => Some(&[GCS_OBJECT_CREATOR]),
        (ProviderKind::Gcs, Operation::Delete) => None,
    }
}

/// Computes the minimal provider scope for `intent` on `location`.
///
/// # Errors
///
/// - [`VendError::EmptyIntent`] if no operations or no paths are requested
/// - [`VendError::OutOfBoundsPath`] if any path escapes the location root
/// - [`VendError::UnsupportedOperation`] if an operation has no native mapping
/// - [`VendError::Terminal`] if the location root itself is unusable
pub fn build_scope(location: &StorageLocation, intent: &AccessIntent) -> VendResult<ProviderScope> {
    if intent.operations.is_empty() {
        return Err(VendError::empty_intent("no operations requested"));
    }
    if intent.paths.is_empty() {
        return Err(VendError::empty_intent("no paths requested"));
    }

    let kind = location.kind;
    let root = parse_root(location)?;

    let mut keys = BTreeSet::new();
    for raw in &intent.paths {
        keys.insert(resolve_path(kind, &root, raw)?.key);
    }

    let prefixes: Vec<StoragePath> = minimal_prefixes(keys)
        .into_iter()
        .map(|key| StoragePath {
            scheme: root.scheme.clone(),
            authority: root.authority.clone(),
            key,
        })
        .collect();

    let mut actions = BTreeSet::new();
    for &operation in &intent.operations {
        let mapped = native_actions(kind, operation)
            .ok_or(VendError::UnsupportedOperation { provider: kind, operation })?;
        actions.extend(mapped.iter().map(|a| (*a).to_string()));
    }

    let document = match kind {
        ProviderKind::ObjectStore => s3_policy(
            arn_partition(location.options.region.as_deref()),
            &root.authority,
            &prefixes,
            &actions,
        ),
        ProviderKind::BlobContainer => adls_policy(&root.authority, &prefixes, &actions),
        ProviderKind::DistributedFs => hdfs_policy(
            &root.authority,
            location.identity.as_deref(),
            &prefixes,
            &actions,
        ),
        ProviderKind::Gcs => gcs_access_boundary(&root.authority, &prefixes, &actions),
    };

    Ok(ProviderScope {
        kind,
        location_id: location.id.clone(),
        prefixes,
        operations: intent.operations.clone(),
        actions,
        policy: to_canonical_string(&document)?,
    })
}

/// Renders SAS permission letters for a set of ADLS actions.
#[must_use]
pub fn sas_permissions(actions: &BTreeSet<String>) -> String {
    SAS_PERMISSION_ORDER
        .chars()
        .filter(|c| actions.iter().any(|a| a.len() == 1 && a.starts_with(*c)))
        .collect()
}

/// AWS partition for a region.
#[must_use]
pub fn arn_partition(region: Option<&str>) -> &'static str {
    match region {
        Some(r) if r.starts_with("cn-") => "aws-cn",
        Some(r) if r.starts_with("us-gov-") => "aws-us-gov",
        _ => "aws",
    }
}

/// Components of an ADLS authority (`container@account.dfs.core.windows.net`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdlsAuthority<'a> {
    /// Container (filesystem) name.
    pub container: &'a str,
    /// Account endpoint host.
    pub host: &'a str,
    /// Storage account name.
    pub account: &'a str,
}

impl<'a> AdlsAuthority<'a> {
    /// Splits an ADLS authority; `None` if it lacks a container or account.
    #[must_use]
    pub fn parse(authority: &'a str) -> Option<Self> {
        let (container, host) = authority.split_once('@')?;
        let account = host.split('.').next().unwrap_or_default();
        if container.is_empty() || account.is_empty() {
            return None;
        }
        Some(Self {
            container,
            host,
            account,
        })
    }
}

fn parse_root(location: &StorageLocation) -> VendResult<StoragePath> {
    let kind = location.kind;
    let invalid = |reason: &str| {
        VendError::terminal(
            kind,
            format!("location {} has unusable root {}: {reason}", location.id, location.root),
        )
    };

    let root = parse_path(&location.root).map_err(invalid)?;
    if !kind.accepts_scheme(&root.scheme) {
        return Err(invalid("scheme not accepted for provider"));
    }
    if kind == ProviderKind::BlobContainer && AdlsAuthority::parse(&root.authority).is_none() {
        return Err(invalid("authority must be container@account host"));
    }
    Ok(root)
}

fn resolve_path(kind: ProviderKind, root: &StoragePath, raw: &str) -> VendResult<StoragePath> {
    let path = parse_path(raw).map_err(|reason| VendError::out_of_bounds(raw, reason))?;
    if !kind.accepts_scheme(&path.scheme) {
        return Err(VendError::out_of_bounds(
            raw,
            format!("scheme '{}' is not accepted for {kind}", path.scheme),
        ));
    }
    if path.authority != root.authority {
        return Err(VendError::out_of_bounds(
            raw,
            "authority differs from the location root",
        ));
    }
    // Both keys end in '/', so a string prefix is a segment-boundary prefix.
    if !path.key.starts_with(&root.key) {
        return Err(VendError::out_of_bounds(raw, "path is not beneath the location root"));
    }
    Ok(path)
}

/// Parses `scheme://authority/key` into a directory path.
///
/// Duplicate slashes collapse and the key gains a trailing slash.
fn parse_path(raw: &str) -> Result<StoragePath, &'static str> {
    let (scheme, rest) = raw.split_once("://").ok_or("missing scheme")?;
    if scheme.is_empty() {
        return Err("missing scheme");
    }
    if rest
        .chars()
        .any(|c| c.is_control() || RESERVED_CHARS.contains(&c))
    {
        return Err("contains a wildcard or reserved character");
    }

    let scheme = scheme.to_ascii_lowercase();
    let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
    if authority.is_empty() && scheme != "hdfs" {
        return Err("missing bucket or container");
    }

    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" => {}
            "." | ".." => return Err("relative path segments are not allowed"),
            s => segments.push(s),
        }
    }
    let key = if segments.is_empty() {
        String::new()
    } else {
        format!("{}/", segments.join("/"))
    };

    Ok(StoragePath {
        scheme,
        authority: authority.to_string(),
        key,
    })
}

/// Drops every key that has an ancestor in the set.
///
/// In sorted order all keys sharing a prefix directly follow it, so checking
/// the last kept key suffices.
fn minimal_prefixes(keys: BTreeSet<String>) -> Vec<String> {
    let mut kept: Vec<String> = Vec::new();
    for key in keys {
        if kept.last().is_some_and(|k| key.starts_with(k.as_str())) {
            continue;
        }
        kept.push(key);
    }
    kept
}

fn s3_policy(
    partition: &str,
    bucket: &str,
    prefixes: &[StoragePath],
    actions: &BTreeSet<String>,
) -> Value {
    let object_actions: Vec<&String> = actions
        .iter()
        .filter(|a| a.as_str() != S3_LIST_BUCKET && a.as_str() != S3_GET_BUCKET_LOCATION)
        .collect();
    let bucket_arn = format!("arn:{partition}:s3:::{bucket}");

    let mut statements = Vec::new();
    if !object_actions.is_empty() {
        let resources: Vec<String> = prefixes
            .iter()
            .map(|p| format!("{bucket_arn}/{}*", p.key))
            .collect();
        statements.push(json!({
            "Sid": "ObjectAccess",
            "Effect": "Allow",
            "Action": object_actions,
            "Resource": resources,
        }));
    }
    if actions.contains(S3_LIST_BUCKET) {
        let list_prefixes: Vec<String> = prefixes.iter().map(|p| format!("{}*", p.key)).collect();
        statements.push(json!({
            "Sid": "ListBucket",
            "Effect": "Allow",
            "Action": [S3_LIST_BUCKET],
            "Resource": [bucket_arn],
            "Condition": {"StringLike": {"s3:prefix": list_prefixes}},
        }));
    }
    if actions.contains(S3_GET_BUCKET_LOCATION) {
        statements.push(json!({
            "Sid": "BucketLocation",
            "Effect": "Allow",
            "Action": [S3_GET_BUCKET_LOCATION],
            "Resource": [bucket_arn],
        }));
    }

    json!({"Version": "2012-10-17", "Statement": statements})
}

fn adls_policy(authority: &str, prefixes: &[StoragePath], actions: &BTreeSet<String>) -> Value {
    let parts = AdlsAuthority::parse(authority);
    let keys: Vec<&str> = prefixes.iter().map(|p| p.key.as_str()).collect();
    json!({
        "account": parts.map(|p| p.account),
        "container": parts.map(|p| p.container),
        "prefixes": keys,
        "permissions": sas_permissions(actions),
    })
}

fn hdfs_policy(
    namenode: &str,
    user: Option<&str>,
    prefixes: &[StoragePath],
    actions: &BTreeSet<String>,
) -> Value {
    let paths: Vec<String> = prefixes.iter().map(|p| format!("/{}", p.key)).collect();
    json!({
        "namenode": namenode,
        "user": user,
        "paths": paths,
        "actions": actions,
    })
}

fn gcs_access_boundary(bucket: &str, prefixes: &[StoragePath], actions: &BTreeSet<String>) -> Value {
    let whole_bucket = prefixes.iter().any(|p| p.key.is_empty());
    let rules: Vec<Value> = actions
        .iter()
        .map(|role| {
            let mut rule = json!({
                "availablePermissions": [role],
                "availableResource": format!("//storage.googleapis.com/projects/_/buckets/{bucket}"),
            });
            if !whole_bucket {
                let listable = role == GCS_OBJECT_VIEWER;
                let expression = prefixes
                    .iter()
                    .map(|p| gcs_condition(bucket, &p.key, listable))
                    .collect::<Vec<_>>()
                    .join(" || ");
                rule["availabilityCondition"] = json!({ "expression": expression });
            }
            rule
        })
        .collect();

    json!({"accessBoundary": {"accessBoundaryRules": rules}})
}

fn gcs_condition(bucket: &str, key: &str, listable: bool) -> String {
    let object = format!("resource.name.startsWith('projects/_/buckets/{bucket}/objects/{key}')");
    if listable {
        format!(
            "{object} || api.getAttribute('storage.googleapis.com/objectListPrefix', '').startsWith('{key}')"
        )
    } else {
        object
    }
}
