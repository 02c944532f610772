//! Property tests for scope construction and cache keys.

use std::collections::BTreeSet;

use credvend::policy::build_scope;
use credvend::{Operation, ProviderKind, ScopeKey, StorageLocation};
use credvend_test_utils::{adls_location, intent, principal, s3_location};
use proptest::prelude::*;

const PATHS: &[&str] = &[
    "s3://b/ns1/",
    "s3://b/ns1/t1/",
    "s3://b/ns1/t1/data/",
    "s3://b/ns1/t2/",
    "s3://b/ns2/t1/",
    "s3://b/ns2/t1/metadata/",
];

fn ops_from(mask: u8) -> Vec<Operation> {
    Operation::ALL
        .iter()
        .enumerate()
        .filter(|(i, _)| mask & (1 << i) != 0)
        .map(|(_, op)| *op)
        .collect()
}

fn paths_from(mask: u8) -> Vec<&'static str> {
    PATHS
        .iter()
        .enumerate()
        .filter(|(i, _)| mask & (1 << i) != 0)
        .map(|(_, p)| *p)
        .collect()
}

fn covered(child: &str, parents: &[String]) -> bool {
    parents.iter().any(|parent| child.starts_with(parent.as_str()))
}

fn check_monotonic(location: &StorageLocation, small: (u8, u8), large: (u8, u8)) -> Result<(), TestCaseError> {
    let small_scope = build_scope(location, &intent(&ops_from(small.0), &paths_from(small.1)))
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    let large_scope = build_scope(location, &intent(&ops_from(large.0), &paths_from(large.1)))
        .map_err(|e| TestCaseError::fail(e.to_string()))?;

    prop_assert!(small_scope.operations.is_subset(&large_scope.operations));
    prop_assert!(small_scope.actions.is_subset(&large_scope.actions));
    let large_prefixes = large_scope.prefix_uris();
    for prefix in small_scope.prefix_uris() {
        prop_assert!(covered(&prefix, &large_prefixes), "{prefix} not within {large_prefixes:?}");
    }
    Ok(())
}

proptest! {
    #[test]
    fn narrower_intents_never_gain_privilege(
        large_ops in 1u8..16,
        large_paths in 1u8..64,
        op_keep in any::<u8>(),
        path_keep in any::<u8>(),
    ) {
        let small_ops = large_ops & op_keep;
        let small_paths = large_paths & path_keep;
        prop_assume!(small_ops != 0 && small_paths != 0);
        check_monotonic(&s3_location(), (small_ops, small_paths), (large_ops, large_paths))?;
    }

    #[test]
    fn scope_key_ignores_order_and_duplicates(
        ops_mask in 1u8..16,
        paths_mask in 1u8..64,
        seed in any::<u64>(),
    ) {
        let location = s3_location();
        let ops = ops_from(ops_mask);
        let paths = paths_from(paths_mask);
        let who = principal(&Operation::ALL);

        let mut shuffled_paths = paths.clone();
        shuffled_paths.extend(paths.iter().copied());
        let rotate_by = usize::try_from(seed % shuffled_paths.len() as u64).unwrap_or(0);
        shuffled_paths.rotate_left(rotate_by);
        let mut shuffled_ops = ops.clone();
        shuffled_ops.reverse();
        shuffled_ops.extend(ops.iter().copied());

        let key = |ops: &[Operation], paths: &[&str]| {
            let scope = build_scope(&location, &intent(ops, paths)).expect("scope");
            ScopeKey::compute(&who, &location, &scope).expect("key")
        };
        prop_assert_eq!(key(&ops[..], &paths[..]), key(&shuffled_ops[..], &shuffled_paths[..]));
    }
}

#[test]
fn distinct_inputs_yield_distinct_keys() {
    let location = s3_location();
    let mut seen = BTreeSet::new();
    let mut count = 0;
    for who in ["alice", "bob"] {
        let principal = credvend::PrincipalContext::new(who, Operation::ALL);
        for ops_mask in 1u8..16 {
            for paths_mask in [0b1u8, 0b10, 0b1000, 0b1010, 0b10000] {
                let scope = build_scope(&location, &intent(&ops_from(ops_mask), &paths_from(paths_mask)))
                    .expect("scope");
                let key = ScopeKey::compute(&principal, &location, &scope).expect("key");
                seen.insert(key.digest().to_string());
                count += 1;
            }
        }
    }
    assert_eq!(seen.len(), count);
}

#[test]
fn adls_scope_is_monotonic_for_operations() {
    let location = adls_location();
    let path = "abfss://lake@acct.dfs.core.windows.net/warehouse/t/";
    let read = build_scope(&location, &intent(&[Operation::Read], &[path])).expect("read");
    let all = build_scope(&location, &intent(&Operation::ALL, &[path])).expect("all");
    assert!(read.actions.is_subset(&all.actions));
    assert_eq!(read.kind, ProviderKind::BlobContainer);
}

#[test]
fn principal_fixture_is_usable_with_every_operation() {
    let who = principal(&Operation::ALL);
    assert!(who.missing(&Operation::ALL.into_iter().collect()).is_empty());
}
