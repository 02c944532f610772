//! Vending error taxonomy.
//!
//! Every failure falls into one [`ErrorClass`] so callers can tell "fix your
//! request" apart from "try again" and "an administrator must fix the storage
//! configuration".

use std::time::Duration;

use credvend_core::CanonicalJsonError;
use thiserror::Error;

use crate::types::{Operation, ProviderKind};

/// Result type alias for vending operations.
pub type VendResult<T> = Result<T, VendError>;

/// Coarse classification of a [`VendError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The request itself is malformed; never retried.
    Request,
    /// The principal is not allowed to perform the request; never retried.
    Denied,
    /// Transient provider failure; the caller may try again.
    Retryable,
    /// Provider configuration is broken; needs an administrator.
    Terminal,
    /// Bug or invariant violation inside this crate.
    Internal,
}

impl ErrorClass {
    /// Lowercase label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Denied => "denied",
            Self::Retryable => "retryable",
            Self::Terminal => "terminal",
            Self::Internal => "internal",
        }
    }
}

/// Errors returned by [`crate::CredentialVendor::vend`].
///
/// Cloneable so a single provider failure can be broadcast to every waiter of
/// a shared flight.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VendError {
    /// A requested path is outside the location root or malformed.
    #[error("Path out of bounds: {path}: {message}")]
    OutOfBoundsPath {
        /// Offending path as supplied.
        path: String,
        /// Why it was rejected.
        message: String,
    },

    /// The provider has no native action for the operation.
    #[error("Unsupported operation: {operation} is not supported by {provider}")]
    UnsupportedOperation {
        /// Provider kind.
        provider: ProviderKind,
        /// Unmapped operation.
        operation: Operation,
    },

    /// The intent names no operations or no paths.
    #[error("Empty intent: {message}")]
    EmptyIntent {
        /// Which part is empty.
        message: String,
    },

    /// The principal is not permitted to perform the requested operations.
    #[error("Access denied: {message}")]
    AccessDenied {
        /// Human-readable error message.
        message: String,
    },

    /// Transient provider failures persisted through every retry.
    #[error("Provider {provider} unavailable after {attempts} attempt(s): {message}")]
    Retryable {
        /// Provider kind.
        provider: ProviderKind,
        /// Attempts made.
        attempts: u32,
        /// Last provider error.
        message: String,
    },

    /// The last provider attempt timed out.
    #[error("Provider {provider} timed out after {attempts} attempt(s) ({timeout:?} each)")]
    Timeout {
        /// Provider kind.
        provider: ProviderKind,
        /// Attempts made.
        attempts: u32,
        /// Per-attempt timeout.
        timeout: Duration,
    },

    /// The provider rejected the request in a way retries cannot fix.
    #[error("Provider {provider} rejected the request: {message}")]
    Terminal {
        /// Provider kind.
        provider: ProviderKind,
        /// Provider error.
        message: String,
    },

    /// No adapter is registered for the location's provider kind.
    #[error("No credential provider configured for {provider}")]
    ProviderNotConfigured {
        /// Provider kind.
        provider: ProviderKind,
    },

    /// Unexpected failure.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

impl VendError {
    /// Creates an out-of-bounds path error.
    #[must_use]
    pub fn out_of_bounds(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OutOfBoundsPath {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an empty-intent error.
    #[must_use]
    pub fn empty_intent(message: impl Into<String>) -> Self {
        Self::EmptyIntent {
            message: message.into(),
        }
    }

    /// Creates an access-denied error.
    #[must_use]
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied {
            message: message.into(),
        }
    }

    /// Creates a terminal provider error.
    #[must_use]
    pub fn terminal(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::Terminal {
            provider,
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the error class.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::OutOfBoundsPath { .. }
            | Self::UnsupportedOperation { .. }
            | Self::EmptyIntent { .. } => ErrorClass::Request,
            Self::AccessDenied { .. } => ErrorClass::Denied,
            Self::Retryable { .. } | Self::Timeout { .. } => ErrorClass::Retryable,
            Self::Terminal { .. } | Self::ProviderNotConfigured { .. } => ErrorClass::Terminal,
            Self::Internal { .. } => ErrorClass::Internal,
        }
    }

    /// Returns a stable error type string.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::OutOfBoundsPath { .. } => "OutOfBoundsPath",
            Self::UnsupportedOperation { .. } => "UnsupportedOperation",
            Self::EmptyIntent { .. } => "EmptyIntent",
            Self::AccessDenied { .. } => "AccessDenied",
            Self::Retryable { .. } => "Retryable",
            Self::Timeout { .. } => "Timeout",
            Self::Terminal { .. } => "Terminal",
            Self::ProviderNotConfigured { .. } => "ProviderNotConfigured",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Returns true if the caller may retry the same request later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Retryable)
    }
}

impl From<CanonicalJsonError> for VendError {
    fn from(err: CanonicalJsonError) -> Self {
        Self::internal(format!("canonical serialization failed: {err}"))
    }
}

impl From<credvend_core::Error> for VendError {
    fn from(err: credvend_core::Error) -> Self {
        Self::internal(err.to_string())
    }
}
