//! The vending coordinator: the single entry point for credential requests.
//!
//! A vend checks the principal's grants, builds the scope, looks up the cache
//! and, on a miss, runs one shared provider flight per [`ScopeKey`]. The flight
//! holds a permit from the provider's semaphore for each attempt, applies the
//! configured timeout, and retries retryable failures with backoff.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use credvend_core::observability::vend_span;
use tokio::sync::Semaphore;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::cache::{CacheOutcome, CredentialCache};
use crate::clock::{Clock, SystemClock};
use crate::config::VendingConfig;
use crate::credentials::{
    CredentialProvider, IssueRequest, ProviderError, ProviderRegistry, effective_session_duration,
    session_name_for,
};
use crate::error::{VendError, VendResult};
use crate::metrics;
use crate::policy::build_scope;
use crate::retry::RetryPolicy;
use crate::scope_key::ScopeKey;
use crate::types::{AccessIntent, CachedCredential, PrincipalContext, ProviderKind, StorageLocation};

/// Vends scoped, short-lived storage credentials.
pub struct CredentialVendor {
    registry: ProviderRegistry,
    cache: Arc<CredentialCache>,
    config: VendingConfig,
    permits: [Arc<Semaphore>; 4],
    clock: Arc<dyn Clock>,
    shut_down: AtomicBool,
}

impl fmt::Debug for CredentialVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVendor")
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .field("config", &self.config)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CredentialVendor {
    /// Creates a vendor using the system clock.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `config` fails validation.
    pub fn new(registry: ProviderRegistry, config: VendingConfig) -> credvend_core::Result<Self> {
        Self::with_clock(registry, config, Arc::new(SystemClock))
    }

    /// Creates a vendor that takes "now" from `clock`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `config` fails validation.
    pub fn with_clock(
        registry: ProviderRegistry,
        config: VendingConfig,
        clock: Arc<dyn Clock>,
    ) -> credvend_core::Result<Self> {
        config.validate()?;
        metrics::register_metrics();
        let cache = Arc::new(CredentialCache::new(&config, Arc::clone(&clock))?);
        let permits = ProviderKind::ALL
            .map(|kind| Arc::new(Semaphore::new(config.limits(kind).max_concurrent_calls)));
        Ok(Self {
            registry,
            cache,
            config,
            permits,
            clock,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Returns credentials for `principal` to perform `intent` on `location`.
    ///
    /// Concurrent calls that resolve to the same scope share one provider
    /// call and receive the same `Arc`.
    ///
    /// # Errors
    ///
    /// - `AccessDenied` if the principal lacks a requested operation
    /// - `OutOfBoundsPath`, `UnsupportedOperation`, `EmptyIntent` for invalid intents
    /// - `ProviderNotConfigured` if no adapter serves the location's kind
    /// - `Retryable`, `Timeout` or `Terminal` for provider failures
    /// - `Internal` after [`CredentialVendor::shutdown`]
    pub async fn vend(
        &self,
        principal: &PrincipalContext,
        location: &StorageLocation,
        intent: &AccessIntent,
    ) -> VendResult<Arc<CachedCredential>> {
        let kind = location.kind;
        let span = vend_span(kind.as_str(), &location.id, &principal.principal);
        let result = self.vend_inner(principal, location, intent).instrument(span).await;
        match &result {
            Ok((_, outcome)) => metrics::record_vend(kind, outcome.as_str()),
            Err(err) => metrics::record_vend(kind, err.class().as_str()),
        }
        result.map(|(credential, _)| credential)
    }

    async fn vend_inner(
        &self,
        principal: &PrincipalContext,
        location: &StorageLocation,
        intent: &AccessIntent,
    ) -> VendResult<(Arc<CachedCredential>, CacheOutcome)> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(VendError::internal("credential vendor is shut down"));
        }

        let missing = principal.missing(&intent.operations);
        if !missing.is_empty() {
            let missing = missing
                .iter()
                .map(|op| op.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            debug!(missing = %missing, "principal lacks requested operations");
            return Err(VendError::access_denied(format!(
                "principal {} is not permitted to {missing} on location {}",
                principal.principal, location.id
            )));
        }

        let scope = build_scope(location, intent)?;
        let key = ScopeKey::compute(principal, location, &scope)?;
        let provider = self
            .registry
            .get(location.kind)
            .cloned()
            .ok_or(VendError::ProviderNotConfigured {
                provider: location.kind,
            })?;

        let limits = self.config.limits(location.kind);
        let request = IssueRequest {
            scope,
            location: location.clone(),
            session_duration: effective_session_duration(
                location.kind,
                limits.max_session_duration,
                location.session_ceiling,
            )?,
            session_name: session_name_for(&principal.principal),
            now: self.clock.now(),
        };
        let flight = ProviderFlight {
            provider,
            request,
            key: key.clone(),
            permits: Arc::clone(&self.permits[location.kind.index()]),
            clock: Arc::clone(&self.clock),
            timeout: self.config.provider_timeout,
            retry: self.config.retry,
        };

        let (credential, outcome) = self
            .cache
            .get_or_issue(key, move || flight.run().instrument(Span::current()))
            .await?;
        debug!(key = %credential.key, outcome = outcome.as_str(), expires_at = %credential.expires_at, "vend complete");
        Ok((credential, outcome))
    }

    /// Drops every cached credential and in-flight call for `location`.
    ///
    /// Call when the location's configuration changes. Returns the number of
    /// cached entries removed.
    pub fn invalidate(&self, location: &StorageLocation) -> usize {
        let removed = self.cache.invalidate(location);
        info!(location = %location.id, provider = %location.kind, removed, "invalidated vended credentials");
        removed
    }

    /// Removes cached entries inside their safety margin.
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    /// Clears the cache and refuses further vends.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for permits in &self.permits {
            permits.close();
        }
        let removed = self.cache.clear();
        info!(removed, "credential vendor shut down");
    }

    /// Returns true once [`CredentialVendor::shutdown`] has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// The credential cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<CredentialCache> {
        &self.cache
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &VendingConfig {
        &self.config
    }
}

enum AttemptFailure {
    Timeout,
    Retryable(String),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out"),
            Self::Retryable(message) => f.write_str(message),
        }
    }
}

/// One provider call with retries, owned by the flight task.
struct ProviderFlight {
    provider: Arc<dyn CredentialProvider>,
    request: IssueRequest,
    key: ScopeKey,
    permits: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ProviderFlight {
    async fn run(self) -> VendResult<Arc<CachedCredential>> {
        let kind = self.provider.kind();
        let mut request = self.request;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| VendError::internal("credential vendor is shut down"))?;
            request.now = self.clock.now();
            let started = Instant::now();
            let outcome = tokio::time::timeout(self.timeout, self.provider.issue(&request)).await;
            drop(permit);
            let elapsed = started.elapsed().as_secs_f64();

            let failure = match outcome {
                Ok(Ok(issued)) => {
                    metrics::record_provider_call(kind, "success", elapsed);
                    debug!(attempt, expires_at = %issued.expires_at, "provider issued credential");
                    return Ok(Arc::new(CachedCredential {
                        key: self.key,
                        credentials: issued.credentials,
                        issued_at: request.now,
                        expires_at: issued.expires_at,
                    }));
                }
                Ok(Err(ProviderError::Terminal { message })) => {
                    metrics::record_provider_call(kind, "terminal", elapsed);
                    error!(
                        alert = true,
                        provider = %kind,
                        location = %request.location.id,
                        attempt,
                        error = %message,
                        "provider rejected credential request; storage configuration needs attention"
                    );
                    return Err(VendError::terminal(kind, message));
                }
                Ok(Err(ProviderError::Retryable { message })) => {
                    metrics::record_provider_call(kind, "retryable", elapsed);
                    AttemptFailure::Retryable(message)
                }
                Err(_) => {
                    metrics::record_provider_call(kind, "timeout", elapsed);
                    AttemptFailure::Timeout
                }
            };

            if !self.retry.should_retry(attempt) {
                warn!(attempt, error = %failure, "provider call failed; retries exhausted");
                return Err(match failure {
                    AttemptFailure::Timeout => VendError::Timeout {
                        provider: kind,
                        attempts: attempt,
                        timeout: self.timeout,
                    },
                    AttemptFailure::Retryable(message) => VendError::Retryable {
                        provider: kind,
                        attempts: attempt,
                        message,
                    },
                });
            }

            let delay = self.retry.delay_with_jitter(attempt);
            warn!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %failure,
                "provider call failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
