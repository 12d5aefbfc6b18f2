//! Error types and result aliases shared across umbra components.
//!
//! The split between [`Error::Transient`] and [`Error::Permanent`] drives
//! retry decisions everywhere: transient failures are retried locally with
//! bounded backoff by whichever component hit them, permanent failures are
//! recorded and never retried.

use std::fmt;

/// The result type used throughout umbra.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in umbra operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A backend operation failed in a way that is expected to succeed on
    /// retry (timeouts, connection resets, overload shedding).
    #[error("transient backend error: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A backend operation failed in a way that retrying cannot fix
    /// (malformed request, permission denied, unsupported operation).
    #[error("permanent backend error: {message}")]
    Permanent {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The requested record was not found.
    #[error("not found: {resource_type} for namespace {namespace}")]
    NotFound {
        /// The type of record that was not found.
        resource_type: &'static str,
        /// The namespace that was looked up.
        namespace: String,
    },

    /// An invalid namespace was provided.
    #[error("invalid namespace: {message}")]
    InvalidNamespace {
        /// Description of what made the namespace invalid.
        message: String,
    },

    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A caller-supplied parameter was out of range or malformed.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of what made the input invalid.
        message: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An optimistic-concurrency write observed a different version than
    /// the caller expected.
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        /// The version the caller expected.
        expected: u64,
        /// The version actually stored.
        actual: u64,
    },

    /// The config store could not be reached at all.
    ///
    /// At orchestrator startup this is fatal: the system must never proceed
    /// with an assumed or default migration phase.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Description of the outage.
        message: String,
    },

    /// An internal error that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a transient backend error with the given message.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a transient backend error with a source cause.
    #[must_use]
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a permanent backend error with the given message.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a permanent backend error with a source cause.
    #[must_use]
    pub fn permanent_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Permanent {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a not-found error for a record type in a namespace.
    #[must_use]
    pub fn not_found(resource_type: &'static str, namespace: impl fmt::Display) -> Self {
        Self::NotFound {
            resource_type,
            namespace: namespace.to_string(),
        }
    }

    /// Creates an invalid-input error.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
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

    /// Returns true if retrying the failed operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Unavailable { .. })
    }
}
