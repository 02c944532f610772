//! Metrics for credential vending.
//!
//! Recording goes through the `metrics` facade; installing an exporter is left
//! to the host process.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_histogram, histogram};

use crate::types::ProviderKind;

/// Vend requests by provider and outcome.
pub const VEND_TOTAL: &str = "credvend_vend_total";

/// Provider calls by provider and outcome.
pub const PROVIDER_CALL_TOTAL: &str = "credvend_provider_call_total";

/// Provider call latency histogram.
pub const PROVIDER_CALL_DURATION: &str = "credvend_provider_call_duration_seconds";

/// Cache evictions by provider and reason.
pub const CACHE_EVICTIONS_TOTAL: &str = "credvend_cache_evictions_total";

static METRICS_REGISTERED: OnceLock<()> = OnceLock::new();

/// Registers metric descriptions.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn register_metrics() {
    METRICS_REGISTERED.get_or_init(|| {
        describe_counter!(VEND_TOTAL, "Total number of credential vend requests");
        describe_counter!(
            PROVIDER_CALL_TOTAL,
            "Total number of calls to external identity providers"
        );
        describe_histogram!(
            PROVIDER_CALL_DURATION,
            "Duration of identity provider calls in seconds"
        );
        describe_counter!(
            CACHE_EVICTIONS_TOTAL,
            "Total number of credential cache evictions"
        );
    });
}

/// Records the outcome of one vend request.
///
/// Outcomes are `hit`, `issued`, `joined` or an error class.
pub fn record_vend(provider: ProviderKind, outcome: &'static str) {
    register_metrics();
    let labels = [
        ("provider", provider.as_str().to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!(VEND_TOTAL, &labels).increment(1);
}

/// Records one provider attempt.
pub fn record_provider_call(provider: ProviderKind, outcome: &'static str, duration_secs: f64) {
    register_metrics();
    let labels = [
        ("provider", provider.as_str().to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!(PROVIDER_CALL_TOTAL, &labels).increment(1);
    histogram!(PROVIDER_CALL_DURATION, "provider" => provider.as_str()).record(duration_secs);
}

/// Records cache evictions.
///
/// Reasons are `expired`, `capacity`, `invalidated` or `cleared`.
pub fn record_cache_evictions(provider: ProviderKind, reason: &'static str, count: usize) {
    if count == 0 {
        return;
    }
    register_metrics();
    let labels = [
        ("provider", provider.as_str().to_string()),
        ("reason", reason.to_string()),
    ];
    counter!(CACHE_EVICTIONS_TOTAL, &labels).increment(u64::try_from(count).unwrap_or(u64::MAX));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_exporter_is_a_noop() {
        register_metrics();
        register_metrics();
        record_vend(ProviderKind::ObjectStore, "hit");
        record_provider_call(ProviderKind::Gcs, "success", 0.25);
        record_cache_evictions(ProviderKind::BlobContainer, "expired", 3);
        record_cache_evictions(ProviderKind::BlobContainer, "expired", 0);
    }
}
