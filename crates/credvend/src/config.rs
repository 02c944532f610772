//! Vending configuration.
//!
//! Built from defaults, deserialized with serde, or loaded from `CREDVEND_*`
//! environment variables.

use std::num::NonZeroUsize;
use std::time::Duration;

use credvend_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::types::ProviderKind;

/// Per-provider limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderLimits {
    /// Longest session requested from the provider.
    #[serde(with = "duration_secs", rename = "max_session_secs")]
    pub max_session_duration: Duration,
    /// Entries are treated as absent this long before they expire.
    #[serde(with = "duration_secs", rename = "safety_margin_secs")]
    pub safety_margin: Duration,
    /// LRU capacity of this provider's cache shard.
    pub cache_capacity: usize,
    /// Concurrent provider calls allowed.
    pub max_concurrent_calls: usize,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            max_session_duration: Duration::from_secs(default_max_session_secs()),
            safety_margin: Duration::from_secs(default_safety_margin_secs()),
            cache_capacity: default_cache_capacity(),
            max_concurrent_calls: default_max_concurrent_calls(),
        }
    }
}

impl ProviderLimits {
    /// Cache capacity as a non-zero value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the capacity is zero.
    pub fn capacity(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.cache_capacity)
            .ok_or_else(|| Error::InvalidInput("cache_capacity must be greater than zero".into()))
    }

    fn validate(&self, kind: ProviderKind) -> Result<()> {
        self.capacity()
            .map_err(|e| Error::InvalidInput(format!("{kind}: {e}")))?;
        if self.max_concurrent_calls == 0 {
            return Err(Error::InvalidInput(format!(
                "{kind}: max_concurrent_calls must be greater than zero"
            )));
        }
        if self.max_session_duration.is_zero() {
            return Err(Error::InvalidInput(format!(
                "{kind}: max_session_secs must be greater than zero"
            )));
        }
        if self.safety_margin >= self.max_session_duration {
            return Err(Error::InvalidInput(format!(
                "{kind}: safety_margin_secs ({}) must be smaller than max_session_secs ({})",
                self.safety_margin.as_secs(),
                self.max_session_duration.as_secs()
            )));
        }
        Ok(())
    }
}

/// Configuration for [`crate::CredentialVendor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VendingConfig {
    /// Limits for S3 locations.
    pub object_store: ProviderLimits,
    /// Limits for ADLS locations.
    pub blob_container: ProviderLimits,
    /// Limits for HDFS locations.
    pub distributed_fs: ProviderLimits,
    /// Limits for GCS locations.
    pub gcs: ProviderLimits,
    /// Timeout for one provider attempt.
    #[serde(with = "duration_millis", rename = "provider_timeout_ms")]
    pub provider_timeout: Duration,
    /// Retry policy for retryable provider failures.
    pub retry: RetryPolicy,
}

impl Default for VendingConfig {
    fn default() -> Self {
        Self {
            object_store: ProviderLimits::default(),
            blob_container: ProviderLimits::default(),
            distributed_fs: ProviderLimits::default(),
            gcs: ProviderLimits::default(),
            provider_timeout: Duration::from_millis(default_provider_timeout_ms()),
            retry: RetryPolicy::default(),
        }
    }
}

impl VendingConfig {
    /// Limits for one provider kind.
    #[must_use]
    pub const fn limits(&self, kind: ProviderKind) -> &ProviderLimits {
        match kind {
            ProviderKind::ObjectStore => &self.object_store,
            ProviderKind::BlobContainer => &self.blob_container,
            ProviderKind::DistributedFs => &self.distributed_fs,
            ProviderKind::Gcs => &self.gcs,
        }
    }

    /// Mutable limits for one provider kind.
    pub fn limits_mut(&mut self, kind: ProviderKind) -> &mut ProviderLimits {
        match kind {
            ProviderKind::ObjectStore => &mut self.object_store,
            ProviderKind::BlobContainer => &mut self.blob_container,
            ProviderKind::DistributedFs => &mut self.distributed_fs,
            ProviderKind::Gcs => &mut self.gcs,
        }
    }

    /// Loads configuration from process environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CREDVEND_PROVIDER_TIMEOUT_MS`
    /// - `CREDVEND_RETRY_MAX_ATTEMPTS`, `CREDVEND_RETRY_BASE_DELAY_MS`,
    ///   `CREDVEND_RETRY_MAX_DELAY_MS`
    /// - Per provider (`S3`, `ADLS`, `HDFS`, `GCS`):
    ///   `CREDVEND_<P>_MAX_SESSION_SECS`, `CREDVEND_<P>_SAFETY_MARGIN_SECS`,
    ///   `CREDVEND_<P>_CACHE_CAPACITY`, `CREDVEND_<P>_MAX_CONCURRENT_CALLS`
    ///
    /// # Errors
    ///
    /// Returns an error if a variable fails to parse or the result is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup` instead of the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable fails to parse or the result is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };
        let mut config = Self::default();

        if let Some(ms) = env.u64("CREDVEND_PROVIDER_TIMEOUT_MS")? {
            config.provider_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = env.u32("CREDVEND_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = env.u64("CREDVEND_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env.u64("CREDVEND_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }

        for kind in ProviderKind::ALL {
            let prefix = env_prefix(kind);
            let limits = config.limits_mut(kind);
            if let Some(secs) = env.u64(&format!("CREDVEND_{prefix}_MAX_SESSION_SECS"))? {
                limits.max_session_duration = Duration::from_secs(secs);
            }
            if let Some(secs) = env.u64(&format!("CREDVEND_{prefix}_SAFETY_MARGIN_SECS"))? {
                limits.safety_margin = Duration::from_secs(secs);
            }
            if let Some(n) = env.usize(&format!("CREDVEND_{prefix}_CACHE_CAPACITY"))? {
                limits.cache_capacity = n;
            }
            if let Some(n) = env.usize(&format!("CREDVEND_{prefix}_MAX_CONCURRENT_CALLS"))? {
                limits.max_concurrent_calls = n;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates every limit.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        for kind in ProviderKind::ALL {
            self.limits(kind).validate(kind)?;
        }
        if self.provider_timeout.is_zero() {
            return Err(Error::InvalidInput(
                "provider_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

const fn env_prefix(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::ObjectStore => "S3",
        ProviderKind::BlobContainer => "ADLS",
        ProviderKind::DistributedFs => "HDFS",
        ProviderKind::Gcs => "GCS",
    }
}

const fn default_max_session_secs() -> u64 {
    3600
}

const fn default_safety_margin_secs() -> u64 {
    120
}

const fn default_cache_capacity() -> usize {
    10_000
}

const fn default_max_concurrent_calls() -> usize {
    16
}

const fn default_provider_timeout_ms() -> u64 {
    10_000
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u32(&self, name: &str) -> Result<Option<u32>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u32>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u32: {e}")))
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
    }

    fn usize(&self, name: &str) -> Result<Option<usize>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<usize>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a usize: {e}")))
    }
}

/// Serde helpers for `Duration` fields stored as whole seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Serde helpers for `Duration` fields stored as milliseconds.
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let config = VendingConfig::default();
        config.validate()?;
        assert_eq!(config.gcs.max_session_duration, Duration::from_secs(3600));
        assert_eq!(config.object_store.safety_margin, Duration::from_secs(120));
        assert_eq!(config.retry.max_attempts, 3);
        Ok(())
    }

    #[test]
    fn env_overrides_per_provider() -> Result<()> {
        let config = VendingConfig::from_lookup(lookup(&[
            ("CREDVEND_S3_MAX_SESSION_SECS", "7200"),
            ("CREDVEND_ADLS_CACHE_CAPACITY", " 42 "),
            ("CREDVEND_HDFS_MAX_CONCURRENT_CALLS", "2"),
            ("CREDVEND_GCS_SAFETY_MARGIN_SECS", "30"),
            ("CREDVEND_PROVIDER_TIMEOUT_MS", "1500"),
            ("CREDVEND_RETRY_MAX_ATTEMPTS", "5"),
            ("CREDVEND_RETRY_BASE_DELAY_MS", ""),
        ]))?;
        assert_eq!(config.object_store.max_session_duration, Duration::from_secs(7200));
        assert_eq!(config.blob_container.cache_capacity, 42);
        assert_eq!(config.distributed_fs.max_concurrent_calls, 2);
        assert_eq!(config.gcs.safety_margin, Duration::from_secs(30));
        assert_eq!(config.provider_timeout, Duration::from_millis(1500));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, RetryPolicy::default().base_delay);
        Ok(())
    }

    #[test]
    fn env_parse_errors_name_the_variable() {
        let err = VendingConfig::from_lookup(lookup(&[("CREDVEND_S3_CACHE_CAPACITY", "lots")]))
            .expect_err("non-numeric capacity");
        assert!(err.to_string().contains("CREDVEND_S3_CACHE_CAPACITY must be a usize"));
    }

    #[test]
    fn validation_rejects_bad_limits() {
        let err = VendingConfig::from_lookup(lookup(&[("CREDVEND_GCS_CACHE_CAPACITY", "0")]))
            .expect_err("zero capacity");
        assert!(err.to_string().contains("gcs"));

        let err = VendingConfig::from_lookup(lookup(&[
            ("CREDVEND_S3_MAX_SESSION_SECS", "900"),
            ("CREDVEND_S3_SAFETY_MARGIN_SECS", "900"),
        ]))
        .expect_err("margin must be below session");
        assert!(err.to_string().contains("safety_margin_secs"));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: VendingConfig = serde_json::from_str(
            r#"{"object_store": {"max_session_secs": 1800}, "provider_timeout_ms": 250, "retry": {"max_attempts": 2}}"#,
        )
        .unwrap_or_else(|e| panic!("deserialize: {e}"));
        assert_eq!(config.object_store.max_session_duration, Duration::from_secs(1800));
        assert_eq!(config.object_store.cache_capacity, 10_000);
        assert_eq!(config.provider_timeout, Duration::from_millis(250));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay, Duration::from_millis(100));
    }
}
