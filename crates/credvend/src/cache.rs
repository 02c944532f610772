//! Credential cache with per-entry expiry, LRU bounds and singleflight.
//!
//! Each provider kind has its own LRU shard. An entry is visible only while
//! `now < expires_at - safety_margin` for its shard. Concurrent misses for the
//! same [`ScopeKey`] share a single provider call that runs as a detached task,
//! so dropping one waiter never cancels the call the others are waiting on.
//!
//! A flight only caches its result while it still owns its `inflight` slot;
//! invalidation and clearing take the slot away, so late results are dropped
//! without any per-location bookkeeping.
//!
//! Lock order: `inflight` before a shard.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lru::LruCache;
use tracing::debug;

use crate::clock::Clock;
use crate::config::VendingConfig;
use crate::error::{VendError, VendResult};
use crate::metrics;
use crate::scope_key::ScopeKey;
use crate::types::{CachedCredential, ProviderKind, StorageLocation};

type FlightResult = VendResult<Arc<CachedCredential>>;
type FlightFuture = Shared<BoxFuture<'static, FlightResult>>;

/// How a credential was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from the cache.
    Hit,
    /// This caller started the provider call.
    Issued,
    /// This caller joined a provider call already in flight.
    Joined,
}

impl CacheOutcome {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Issued => "issued",
            Self::Joined => "joined",
        }
    }
}

struct Shard {
    kind: ProviderKind,
    safety_margin: Duration,
    entries: Mutex<LruCache<ScopeKey, Arc<CachedCredential>>>,
}

impl Shard {
    fn new(kind: ProviderKind, capacity: NonZeroUsize, safety_margin: Duration) -> Self {
        Self {
            kind,
            safety_margin,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn remove_where<F>(&self, reason: &'static str, mut predicate: F) -> usize
    where
        F: FnMut(&ScopeKey, &CachedCredential) -> bool,
    {
        let mut entries = lock(&self.entries);
        let doomed: Vec<ScopeKey> = entries
            .iter()
            .filter(|(key, value)| predicate(key, value))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        drop(entries);
        metrics::record_cache_evictions(self.kind, reason, doomed.len());
        doomed.len()
    }
}

struct Flight {
    id: u64,
    future: FlightFuture,
}

/// Removes a flight's slot when its task finishes, panics or is cancelled.
struct FlightSlot {
    cache: Arc<CredentialCache>,
    key: ScopeKey,
    id: u64,
}

impl FlightSlot {
    /// Releases the slot, caching a successful result if the flight still
    /// owns it.
    fn finish(self, result: &FlightResult) {
        let mut inflight = lock(&self.cache.inflight);
        if !inflight.get(&self.key).is_some_and(|flight| flight.id == self.id) {
            drop(inflight);
            debug!(key = %self.key, "discarding result of a detached flight");
            return;
        }
        inflight.remove(&self.key);
        if let Ok(credential) = result {
            self.cache.put(self.key.clone(), Arc::clone(credential));
        }
    }
}

impl Drop for FlightSlot {
    fn drop(&mut self) {
        let mut inflight = lock(&self.cache.inflight);
        if inflight.get(&self.key).is_some_and(|flight| flight.id == self.id) {
            inflight.remove(&self.key);
        }
    }
}

/// Sharded credential cache.
pub struct CredentialCache {
    shards: [Shard; 4],
    inflight: Mutex<HashMap<ScopeKey, Flight>>,
    next_flight_id: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCache")
            .field("entries", &self.len())
            .field("inflight", &self.inflight_len())
            .finish_non_exhaustive()
    }
}

impl CredentialCache {
    /// Creates an empty cache sized by `config`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if any shard capacity is zero.
    pub fn new(config: &VendingConfig, clock: Arc<dyn Clock>) -> credvend_core::Result<Self> {
        let shard = |kind: ProviderKind| -> credvend_core::Result<Shard> {
            let limits = config.limits(kind);
            Ok(Shard::new(kind, limits.capacity()?, limits.safety_margin))
        };
        let [s3, adls, hdfs, gcs] = ProviderKind::ALL;
        Ok(Self {
            shards: [shard(s3)?, shard(adls)?, shard(hdfs)?, shard(gcs)?],
            inflight: Mutex::new(HashMap::new()),
            next_flight_id: AtomicU64::new(0),
            clock,
        })
    }

    fn shard(&self, kind: ProviderKind) -> &Shard {
        &self.shards[kind.index()]
    }

    /// Returns the entry for `key` if it is outside its safety margin.
    ///
    /// Entries found inside the margin are dropped.
    #[must_use]
    pub fn get(&self, key: &ScopeKey) -> Option<Arc<CachedCredential>> {
        let now = self.clock.now();
        let shard = self.shard(key.kind);
        let mut entries = lock(&shard.entries);
        match entries.get(key) {
            Some(entry) if entry.is_fresh(now, shard.safety_margin) => return Some(Arc::clone(entry)),
            Some(_) => {}
            None => return None,
        }
        entries.pop(key);
        drop(entries);
        metrics::record_cache_evictions(key.kind, "expired", 1);
        None
    }

    /// Stores `value` under `key`.
    ///
    /// Returns false without storing if the credential is already inside the
    /// safety margin.
    pub fn put(&self, key: ScopeKey, value: Arc<CachedCredential>) -> bool {
        let now = self.clock.now();
        let shard = self.shard(key.kind);
        if !value.is_fresh(now, shard.safety_margin) {
            debug!(key = %key, expires_at = %value.expires_at, "not caching credential inside safety margin");
            return false;
        }
        let displaced = lock(&shard.entries).push(key.clone(), value);
        if displaced.is_some_and(|(evicted, _)| evicted != key) {
            metrics::record_cache_evictions(key.kind, "capacity", 1);
        }
        true
    }

    /// Returns the cached credential for `key`, or runs `work` once for all
    /// concurrent callers asking for the same key.
    ///
    /// `work` runs on a spawned task; a successful result is cached (unless
    /// the key's location was invalidated meanwhile) before the flight slot is
    /// released. Failures are shared with every waiter and never cached.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `work`, or an internal error if the
    /// flight task was aborted.
    pub async fn get_or_issue<F, Fut>(
        self: &Arc<Self>,
        key: ScopeKey,
        work: F,
    ) -> VendResult<(Arc<CachedCredential>, CacheOutcome)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlightResult> + Send + 'static,
    {
        if let Some(hit) = self.get(&key) {
            return Ok((hit, CacheOutcome::Hit));
        }

        let (flight, outcome) = {
            let mut inflight = lock(&self.inflight);
            if let Some(existing) = inflight.get(&key) {
                (existing.future.clone(), CacheOutcome::Joined)
            } else if let Some(hit) = self.get(&key) {
                return Ok((hit, CacheOutcome::Hit));
            } else {
                let id = self.next_flight_id.fetch_add(1, Ordering::Relaxed);
                let slot = FlightSlot {
                    cache: Arc::clone(self),
                    key: key.clone(),
                    id,
                };
                let task = work();
                let handle = tokio::spawn(async move {
                    let result = task.await;
                    slot.finish(&result);
                    result
                });
                let future = async move {
                    handle.await.unwrap_or_else(|e| {
                        Err(VendError::internal(format!("credential flight aborted: {e}")))
                    })
                }
                .boxed()
                .shared();
                inflight.insert(
                    key.clone(),
                    Flight {
                        id,
                        future: future.clone(),
                    },
                );
                (future, CacheOutcome::Issued)
            }
        };

        flight.await.map(|credential| (credential, outcome))
    }

    /// Drops every entry issued for `location` and detaches its in-flight
    /// calls. Returns the number of cache entries removed.
    pub fn invalidate(&self, location: &StorageLocation) -> usize {
        let mut inflight = lock(&self.inflight);
        let before = inflight.len();
        inflight.retain(|key, _| key.location_id != location.id);
        let detached = before - inflight.len();
        let removed: usize = self
            .shards
            .iter()
            .map(|shard| shard.remove_where("invalidated", |key, _| key.location_id == location.id))
            .sum();
        drop(inflight);

        debug!(location = %location.id, removed, detached, "invalidated location");
        removed
    }

    /// Removes entries that are inside their safety margin. Returns the count.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        self.shards
            .iter()
            .map(|shard| {
                let margin = shard.safety_margin;
                shard.remove_where("expired", |_, value| !value.is_fresh(now, margin))
            })
            .sum()
    }

    /// Drops all entries and in-flight calls. Returns the number of entries
    /// removed.
    pub fn clear(&self) -> usize {
        let mut inflight = lock(&self.inflight);
        inflight.clear();
        self.shards
            .iter()
            .map(|shard| shard.remove_where("cleared", |_, _| true))
            .sum()
    }

    /// Number of cached entries across all shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| lock(&shard.entries).len()).sum()
    }

    /// Returns true if no entries are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cached entries for one provider kind.
    #[must_use]
    pub fn len_for(&self, kind: ProviderKind) -> usize {
        lock(&self.shard(kind).entries).len()
    }

    /// Number of provider calls currently in flight.
    #[must_use]
    pub fn inflight_len(&self) -> usize {
        lock(&self.inflight).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
