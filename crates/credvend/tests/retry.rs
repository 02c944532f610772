//! Retry, timeout and failure classification through the coordinator.

use std::time::Duration;

use credvend::{ErrorClass, Operation, ProviderKind, RetryPolicy, VendError, VendingConfig};
use credvend_test_utils::{
    ScriptedProvider, Step, assert_error_class, intent, principal, s3_location, vendor_with,
};

fn fast_retries(max_attempts: u32) -> VendingConfig {
    VendingConfig {
        retry: RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5)),
        ..VendingConfig::default()
    }
}

#[tokio::test]
async fn retryable_failures_are_retried_then_surfaced() {
    let provider = ScriptedProvider::new(ProviderKind::ObjectStore);
    provider.script([
        Step::Retryable("throttled".into()),
        Step::Retryable("throttled".into()),
        Step::Retryable("still throttled".into()),
    ]);
    let (vendor, _clock) = vendor_with(provider.clone(), fast_retries(3));
    let reader = principal(&[Operation::Read]);
    let read = intent(&[Operation::Read], &["s3://b/t/"]);

    let err = assert_error_class(
        vendor.vend(&reader, &s3_location(), &read).await,
        ErrorClass::Retryable,
    );
    assert_eq!(
        err,
        VendError::Retryable {
            provider: ProviderKind::ObjectStore,
            attempts: 3,
            message: "still throttled".into(),
        }
    );
    assert_eq!(provider.calls(), 3);
    assert!(vendor.cache().is_empty());

    vendor
        .vend(&reader, &s3_location(), &read)
        .await
        .expect("script exhausted, provider recovers");
    assert_eq!(provider.calls(), 4);
}

#[tokio::test]
async fn transient_failure_then_success() {
    let provider = ScriptedProvider::new(ProviderKind::ObjectStore);
    provider.script([Step::Retryable("503".into())]);
    let (vendor, _clock) = vendor_with(provider.clone(), fast_retries(3));

    vendor
        .vend(
            &principal(&[Operation::Read]),
            &s3_location(),
            &intent(&[Operation::Read], &["s3://b/t/"]),
        )
        .await
        .expect("second attempt succeeds");
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn terminal_failures_are_not_retried() {
    let provider = ScriptedProvider::new(ProviderKind::ObjectStore);
    provider.script([Step::Terminal("AccessDenied: not authorized to assume role".into())]);
    let (vendor, _clock) = vendor_with(provider.clone(), fast_retries(5));

    let err = assert_error_class(
        vendor
            .vend(
                &principal(&[Operation::Read]),
                &s3_location(),
                &intent(&[Operation::Read], &["s3://b/t/"]),
            )
            .await,
        ErrorClass::Terminal,
    );
    assert!(matches!(err, VendError::Terminal { .. }));
    assert!(!err.is_retryable());
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn timed_out_flight_clears_its_slot() {
    let provider = ScriptedProvider::new(ProviderKind::ObjectStore);
    provider.script([Step::Hang]);
    let config = VendingConfig {
        provider_timeout: Duration::from_millis(50),
        retry: RetryPolicy::no_retry(),
        ..VendingConfig::default()
    };
    let (vendor, _clock) = vendor_with(provider.clone(), config);
    let reader = principal(&[Operation::Read]);
    let read = intent(&[Operation::Read], &["s3://b/t/"]);

    let err = assert_error_class(
        vendor.vend(&reader, &s3_location(), &read).await,
        ErrorClass::Retryable,
    );
    assert_eq!(
        err,
        VendError::Timeout {
            provider: ProviderKind::ObjectStore,
            attempts: 1,
            timeout: Duration::from_millis(50),
        }
    );
    assert_eq!(vendor.cache().inflight_len(), 0);

    vendor
        .vend(&reader, &s3_location(), &read)
        .await
        .expect("next vend starts a new flight");
    assert_eq!(provider.calls(), 2);
}
