//! Location invalidation.

use std::sync::Arc;

use credvend::{
    CredentialVendor, ManualClock, Operation, ProviderKind, ProviderRegistry, VendingConfig,
};
use credvend_test_utils::{ScriptedProvider, gcs_location, intent, principal, s3_location, t0};

struct Fixture {
    vendor: CredentialVendor,
    s3: Arc<ScriptedProvider>,
    gcs: Arc<ScriptedProvider>,
}

fn fixture() -> Fixture {
    let s3 = ScriptedProvider::new(ProviderKind::ObjectStore);
    let gcs = ScriptedProvider::new(ProviderKind::Gcs);
    let registry = ProviderRegistry::new()
        .with_provider(s3.clone())
        .with_provider(gcs.clone());
    let vendor = CredentialVendor::with_clock(
        registry,
        VendingConfig::default(),
        Arc::new(ManualClock::new(t0())),
    )
    .expect("vendor");
    Fixture { vendor, s3, gcs }
}

#[tokio::test]
async fn invalidate_removes_only_that_location() {
    let Fixture { vendor, s3, gcs } = fixture();
    let reader = principal(&[Operation::Read]);

    for path in ["s3://b/t1/", "s3://b/t2/"] {
        vendor
            .vend(&reader, &s3_location(), &intent(&[Operation::Read], &[path]))
            .await
            .expect("s3 vend");
    }
    let gcs_read = intent(&[Operation::Read], &["gs://lake/warehouse/t/"]);
    let cached_gcs = vendor
        .vend(&reader, &gcs_location(), &gcs_read)
        .await
        .expect("gcs vend");
    assert_eq!(vendor.cache().len(), 3);

    assert_eq!(vendor.invalidate(&s3_location()), 2);
    assert_eq!(vendor.cache().len_for(ProviderKind::ObjectStore), 0);

    let again = vendor
        .vend(&reader, &gcs_location(), &gcs_read)
        .await
        .expect("gcs hit");
    assert!(Arc::ptr_eq(&cached_gcs, &again));
    assert_eq!(gcs.calls(), 1);

    vendor
        .vend(&reader, &s3_location(), &intent(&[Operation::Read], &["s3://b/t1/"]))
        .await
        .expect("s3 reissue");
    assert_eq!(s3.calls(), 3);
}

#[tokio::test]
async fn reconfigured_location_gets_a_new_key() {
    let Fixture { vendor, s3, .. } = fixture();
    let reader = principal(&[Operation::Read]);
    let read = intent(&[Operation::Read], &["s3://b/t/"]);

    let before = vendor
        .vend(&reader, &s3_location(), &read)
        .await
        .expect("before");
    let moved = s3_location().with_identity("arn:aws:iam::123456789012:role/other");
    let after = vendor.vend(&reader, &moved, &read).await.expect("after");

    assert_ne!(before.key, after.key);
    assert_eq!(s3.calls(), 2);
}

#[tokio::test]
async fn invalidating_an_unknown_location_is_a_noop() {
    let Fixture { vendor, .. } = fixture();
    assert_eq!(vendor.invalidate(&s3_location()), 0);
    assert!(vendor.cache().is_empty());
}
