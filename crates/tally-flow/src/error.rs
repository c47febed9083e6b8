//! Error types for the coordination domain.
//!
//! A duplicate delivery is deliberately absent from this enum: fencing is a
//! normal outcome and is reported through
//! [`Outcome::Duplicate`](crate::task::Outcome::Duplicate).

use tally_core::TenantId;

use crate::bulk::BulkError;

/// The result type used throughout tally-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in coordination operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The run document does not exist.
    #[error("run not found: {run_key}")]
    RunNotFound {
        /// The run key that was looked up.
        run_key: String,
    },

    /// The tenant is not part of the run.
    #[error("tenant {tenant} is not part of run {run_key}")]
    UnknownTenant {
        /// The run key.
        run_key: String,
        /// The tenant that was not found.
        tenant: TenantId,
    },

    /// Optimistic-concurrency retries were exhausted.
    #[error("transaction conflict on {key} after {attempts} attempts")]
    TransactionConflict {
        /// The document key.
        key: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Enqueueing a task failed.
    #[error("dispatch error: {message}")]
    Dispatch {
        /// Description of the failure.
        message: String,
    },

    /// The bulk data engine reported a failure.
    #[error(transparent)]
    Bulk(#[from] BulkError),

    /// A configuration value was missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A delivered request was malformed or inconsistent with the run.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Description of what was wrong.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from tally-core.
    #[error("core error: {0}")]
    Core(#[from] tally_core::error::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new dispatch error.
    #[must_use]
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch {
            message: message.into(),
        }
    }

    /// Creates a new invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Returns true if redelivering the same task may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransactionConflict { .. } | Self::Dispatch { .. } | Self::Storage { .. } => {
                true
            }
            Self::Bulk(e) => e.is_retryable(),
            Self::Core(e) => matches!(e, tally_core::Error::Storage { .. }),
            _ => false,
        }
    }
}
