//! A scripted credential provider.
//!
//! Each call pops the next [`Step`] from the script; once the script is empty
//! every call succeeds. Successful calls return one credential per scope
//! prefix expiring `ttl` after the request time.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use credvend::credentials::{CredentialProvider, IssueRequest, IssuedCredential, ProviderError};
use credvend::{ProviderKind, StorageCredential};

/// Config key carrying the scripted token.
pub const SCRIPTED_TOKEN_KEY: &str = "scripted.token";

/// Outcome of one scripted call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Issue a credential.
    Succeed,
    /// Fail with a retryable error.
    Retryable(String),
    /// Fail with a terminal error.
    Terminal(String),
    /// Never complete (exercises timeouts).
    Hang,
}

/// Provider that counts invocations and follows a script.
#[derive(Debug)]
pub struct ScriptedProvider {
    kind: ProviderKind,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    latency: Mutex<Duration>,
    ttl: Mutex<Duration>,
    script: Mutex<VecDeque<Step>>,
    last_request: Mutex<Option<IssueRequest>>,
}

impl ScriptedProvider {
    /// Creates a provider for `kind` that always succeeds with a one hour TTL.
    pub fn new(kind: ProviderKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            latency: Mutex::new(Duration::ZERO),
            ttl: Mutex::new(Duration::from_secs(3600)),
            script: Mutex::new(VecDeque::new()),
            last_request: Mutex::new(None),
        })
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Sets the lifetime of issued credentials.
    pub fn set_ttl(&self, ttl: Duration) {
        *self.ttl.lock().unwrap() = ttl;
    }

    /// Appends steps to the script.
    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.script.lock().unwrap().extend(steps);
    }

    /// Number of `issue` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of `issue` calls that were running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// The most recent request.
    pub fn last_request(&self) -> Option<IssueRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

/// Counts one running `issue` call until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(provider: &'a ScriptedProvider) -> Self {
        let running = provider.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        provider.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        Self(&provider.in_flight)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CredentialProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn issue(&self, request: &IssueRequest) -> Result<IssuedCredential, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let _running = InFlight::enter(self);
        *self.last_request.lock().unwrap() = Some(request.clone());

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Succeed);
        match step {
            Step::Succeed => {}
            Step::Retryable(message) => return Err(ProviderError::retryable(message)),
            Step::Terminal(message) => return Err(ProviderError::terminal(message)),
            Step::Hang => std::future::pending::<()>().await,
        }

        let ttl = *self.ttl.lock().unwrap();
        let expires_at = request.now + chrono::Duration::from_std(ttl).expect("ttl in range");
        let credentials = request
            .scope
            .prefix_uris()
            .into_iter()
            .map(|prefix| StorageCredential {
                prefix,
                config: HashMap::from([
                    (SCRIPTED_TOKEN_KEY.to_string(), format!("token-{call}")),
                    (
                        "scripted.expires-at-ms".to_string(),
                        expires_at.timestamp_millis().to_string(),
                    ),
                ]),
            })
            .collect();

        Ok(IssuedCredential {
            credentials,
            expires_at,
        })
    }
}
