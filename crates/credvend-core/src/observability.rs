//! Observability infrastructure for credvend.
//!
//! Structured logging with consistent spans. Vended secrets never reach a log
//! line: anything secret is wrapped in [`Redacted`] before it is formatted.

use std::fmt;
use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt as tfmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::invalid_input(format!(
                "unknown log format '{other}' (expected 'json' or 'pretty')"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops. A global subscriber installed earlier by the
/// host is kept.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `credvend=debug`)
///
/// # Example
///
/// ```rust
/// use credvend_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let installed = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(tfmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(tfmt::layer().pretty())
                .try_init(),
        };
        if let Err(error) = installed {
            tracing::debug!(%error, "keeping the existing global subscriber");
        }
    });
}

/// Creates the standard span for one vend request.
///
/// The principal is recorded by identity only; permitted operations and
/// credentials stay out of the span.
///
/// # Example
///
/// ```rust
/// use credvend_core::observability::vend_span;
///
/// let span = vend_span("s3", "loc-warehouse", "alice");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn vend_span(provider: &str, location: &str, principal: &str) -> Span {
    tracing::info_span!(
        "vend",
        provider = provider,
        location = location,
        principal = principal,
    )
}

/// Wraps a value so that neither `Debug` nor `Display` reveal it.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Redacted<T>(pub T);

impl<T> Redacted<T> {
    /// Returns the wrapped value.
    #[must_use]
    pub fn expose(&self) -> &T {
        &self.0
    }

    /// Unwraps into the inner value.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<T> for Redacted<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_succeeds() {
        // Should not panic (uses Once internally)
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json); // Second call should be no-op
    }

    #[test]
    fn test_vend_span_creates_span() {
        let span = vend_span("s3", "loc-1", "alice");
        let _guard = span.enter();
        tracing::info!("vend message in span");
    }

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().ok(), Some(LogFormat::Json));
        assert_eq!(" pretty ".parse::<LogFormat>().ok(), Some(LogFormat::Pretty));
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn redacted_hides_value() {
        let secret = Redacted::from("AKIA-secret".to_string());
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(format!("{secret}"), "[REDACTED]");
        assert_eq!(secret.expose(), "AKIA-secret");
    }
}
