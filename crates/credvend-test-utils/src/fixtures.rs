//! Pre-built test fixtures for common vending scenarios.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use credvend::{
    AccessIntent, CredentialProvider, CredentialVendor, ManualClock, Operation, PrincipalContext,
    ProviderKind, ProviderRegistry, StorageLocation, VendingConfig,
};

/// Role assumed for S3 fixtures.
pub const TEST_ROLE_ARN: &str = "arn:aws:iam::123456789012:role/credvend-test";

/// Principal used by [`principal`].
pub const TEST_PRINCIPAL: &str = "alice@example.com";

/// Fixed start time for manual clocks.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .expect("valid timestamp")
}

/// S3 location rooted at `s3://b/`.
pub fn s3_location() -> StorageLocation {
    StorageLocation::new("loc-s3", ProviderKind::ObjectStore, "s3://b/")
        .with_identity(TEST_ROLE_ARN)
        .with_region("us-east-1")
}

/// ADLS location rooted at `abfss://lake@acct.dfs.core.windows.net/warehouse/`.
pub fn adls_location() -> StorageLocation {
    StorageLocation::new(
        "loc-adls",
        ProviderKind::BlobContainer,
        "abfss://lake@acct.dfs.core.windows.net/warehouse/",
    )
}

/// HDFS location rooted at `hdfs://nn1:8020/warehouse/`.
pub fn hdfs_location() -> StorageLocation {
    StorageLocation::new(
        "loc-hdfs",
        ProviderKind::DistributedFs,
        "hdfs://nn1:8020/warehouse/",
    )
    .with_identity("etl")
}

/// GCS location rooted at `gs://lake/warehouse/`.
pub fn gcs_location() -> StorageLocation {
    StorageLocation::new("loc-gcs", ProviderKind::Gcs, "gs://lake/warehouse/")
}

/// [`TEST_PRINCIPAL`] permitted to perform `ops`.
pub fn principal(ops: &[Operation]) -> PrincipalContext {
    PrincipalContext::new(TEST_PRINCIPAL, ops.iter().copied())
}

/// Intent for `ops` on `paths`.
pub fn intent(ops: &[Operation], paths: &[&str]) -> AccessIntent {
    AccessIntent::new(
        ops.iter().copied().collect::<BTreeSet<_>>(),
        paths.iter().copied(),
    )
}

/// Vendor over a single provider with a manual clock starting at [`t0`].
pub fn vendor_with(
    provider: Arc<dyn CredentialProvider>,
    config: VendingConfig,
) -> (CredentialVendor, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let registry = ProviderRegistry::new().with_provider(provider);
    let vendor = CredentialVendor::with_clock(registry, config, clock.clone())
        .expect("valid vending config");
    (vendor, clock)
}
