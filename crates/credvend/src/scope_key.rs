//! Cache keys derived from normalized scope inputs.

use std::collections::BTreeSet;
use std::fmt;

use credvend_core::canonical_json::sha256_fingerprint;
use serde::Serialize;

use crate::error::VendResult;
use crate::types::{Operation, PrincipalContext, ProviderKind, ProviderScope, StorageLocation};

/// Deterministic fingerprint of everything that shapes a vended credential.
///
/// Two equal keys always describe the same policy. The location id is kept in
/// clear so the cache can drop every key of a location at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    /// Provider kind (selects the cache shard).
    pub kind: ProviderKind,
    /// Location the key belongs to.
    pub location_id: String,
    digest: String,
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
    kind: ProviderKind,
    location_id: &'a str,
    location_fingerprint: &'a str,
    prefixes: Vec<String>,
    operations: &'a BTreeSet<Operation>,
    principal: &'a str,
}

impl ScopeKey {
    /// Computes the key for `principal` accessing `scope` on `location`.
    ///
    /// `scope` must come from the policy builder so prefixes are already
    /// sorted and deduplicated.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the inputs cannot be serialized.
    pub fn compute(
        principal: &PrincipalContext,
        location: &StorageLocation,
        scope: &ProviderScope,
    ) -> VendResult<Self> {
        let location_fingerprint = location.fingerprint()?;
        let mut prefixes = scope.prefix_uris();
        prefixes.sort();
        prefixes.dedup();

        let material = KeyMaterial {
            kind: scope.kind,
            location_id: &location.id,
            location_fingerprint: &location_fingerprint,
            prefixes,
            operations: &scope.operations,
            principal: &principal.principal,
        };

        Ok(Self {
            kind: scope.kind,
            location_id: location.id.clone(),
            digest: sha256_fingerprint(&material)?,
        })
    }

    /// Builds a key from raw parts.
    #[must_use]
    pub fn from_parts(kind: ProviderKind, location_id: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            kind,
            location_id: location_id.into(),
            digest: digest.into(),
        }
    }

    /// Hex SHA-256 digest.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.digest.get(..16).unwrap_or(&self.digest);
        write!(f, "{}:{}:{short}", self.kind, self.location_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::build_scope;
    use crate::types::AccessIntent;

    fn location() -> StorageLocation {
        StorageLocation::new("loc-1", ProviderKind::ObjectStore, "s3://b/")
            .with_identity("arn:aws:iam::123456789012:role/vend")
    }

    fn key_for(principal: &str, intent: &AccessIntent) -> ScopeKey {
        let loc = location();
        let scope = build_scope(&loc, intent).unwrap_or_else(|e| panic!("scope: {e}"));
        let principal = PrincipalContext::new(principal, Operation::ALL);
        ScopeKey::compute(&principal, &loc, &scope).unwrap_or_else(|e| panic!("key: {e}"))
    }

    #[test]
    fn reordering_and_duplicates_do_not_change_key() {
        let a = AccessIntent::new(
            [Operation::Read, Operation::List],
            ["s3://b/ns/t1/", "s3://b/ns/t2/"],
        );
        let b = AccessIntent::new(
            [Operation::List, Operation::Read, Operation::List],
            ["s3://b/ns/t2", "s3://b//ns/t1/", "s3://b/ns/t2/"],
        );
        assert_eq!(key_for("alice", &a), key_for("alice", &b));
    }

    #[test]
    fn different_inputs_give_different_keys() {
        let base = AccessIntent::new([Operation::Read], ["s3://b/ns/t1/"]);
        let corpus = [
            key_for("alice", &base),
            key_for("bob", &base),
            key_for("alice", &AccessIntent::new([Operation::Write], ["s3://b/ns/t1/"])),
            key_for("alice", &AccessIntent::new([Operation::Read], ["s3://b/ns/t2/"])),
            key_for(
                "alice",
                &AccessIntent::new([Operation::Read, Operation::Write], ["s3://b/ns/t1/"]),
            ),
        ];
        for (i, a) in corpus.iter().enumerate() {
            for b in corpus.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn location_reconfiguration_changes_key() {
        let intent = AccessIntent::new([Operation::Read], ["s3://b/ns/t1/"]);
        let principal = PrincipalContext::new("alice", [Operation::Read]);
        let before = location();
        let after = location().with_region("eu-west-1");
        let scope = build_scope(&before, &intent).unwrap_or_else(|e| panic!("scope: {e}"));
        let k1 = ScopeKey::compute(&principal, &before, &scope).unwrap_or_else(|e| panic!("{e}"));
        let k2 = ScopeKey::compute(&principal, &after, &scope).unwrap_or_else(|e| panic!("{e}"));
        assert_ne!(k1, k2);
        assert_eq!(k1.location_id, k2.location_id);
    }

    #[test]
    fn display_is_short() {
        let key = ScopeKey::from_parts(ProviderKind::Gcs, "loc", "0123456789abcdef0123");
        assert_eq!(key.to_string(), "gcs:loc:0123456789abcdef");
    }
}
