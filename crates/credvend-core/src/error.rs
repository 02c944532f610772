//! Error types and result aliases shared across credvend crates.
//!
//! Vending failures have their own taxonomy in `credvend::error`; this type
//! covers configuration parsing and the shared primitives in this crate.

/// The result type used by shared credvend primitives.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by configuration loading and shared primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input was provided (bad environment value, invalid config).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates an invalid input error.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

impl From<crate::canonical_json::CanonicalJsonError> for Error {
    fn from(err: crate::canonical_json::CanonicalJsonError) -> Self {
        Self::serialization(err.to_string())
    }
}
