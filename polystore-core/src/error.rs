/// Structured error types for the data-access layer.
///
/// Uses `thiserror` for better API surface and error composition.
/// Repository callers see this taxonomy and never a raw driver error;
/// absence of data is not an error (lookups return `Option`, deletes
/// return affected counts).
use std::time::Duration;

use thiserror::Error;

/// Boxed driver/source error carried as a cause.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for data-access operations
pub type DalResult<T> = std::result::Result<T, DataAccessError>;

/// Error taxonomy of the data-access layer.
///
/// The retry policy treats `Connection` and `TransientConflict` as
/// retryable, `Timeout` as retryable only for idempotent operations,
/// and everything else as fatal.
#[derive(Error, Debug)]
pub enum DataAccessError {
    /// Invalid or missing descriptor/configuration fields. Never retried.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// Could not establish, or lost, a connection to the backend.
    #[error("connection error: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A single command exceeded its time budget.
    #[error("operation '{operation}' timed out after {limit:?}")]
    Timeout { operation: String, limit: Duration },

    /// Deadlock, serialization conflict, or resource exhaustion.
    #[error("transient conflict: {reason}")]
    TransientConflict {
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Caller-supplied filter, field list, or entity is malformed.
    #[error("validation error: {reason}")]
    Validation { reason: String },

    /// Unclassified backend failure, carrying the driver error as cause.
    #[error("data access failure in '{operation}': {reason}")]
    Backend {
        operation: String,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl DataAccessError {
    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a connection error without a source
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a connection error carrying the driver error
    pub fn connection_with(reason: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Connection {
            reason: reason.into(),
            source: Some(source.into()),
        }
    }

    /// Create a timeout error for a named operation
    pub fn timeout(operation: impl Into<String>, limit: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            limit,
        }
    }

    /// Create a transient-conflict error
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientConflict {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a transient-conflict error carrying the driver error
    pub fn transient_with(reason: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::TransientConflict {
            reason: reason.into(),
            source: Some(source.into()),
        }
    }

    /// Create a validation error
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Create a backend error wrapping a driver error
    pub fn backend(operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self::Backend {
            operation: operation.into(),
            reason: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a backend error from a bare message
    pub fn backend_msg(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            reason: reason.into(),
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_operation_and_reason() {
        let err = DataAccessError::backend_msg("get_by_id", "boom");
        assert_eq!(err.to_string(), "data access failure in 'get_by_id': boom");

        let err = DataAccessError::timeout("count", Duration::from_secs(30));
        assert!(err.to_string().contains("count"));
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn source_chain_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = DataAccessError::connection_with("lost connection", io);

        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("reset by peer"));
    }
}
