/// Structured error types for poolbench-core.
///
/// The binary (poolbench-cli) wraps these in `anyhow`; the harness itself
/// needs the variants to decide whether a failure is counted against a single
/// work item or aborts the whole phase.

use std::time::Duration;
use thiserror::Error;

/// Main error type for benchmark operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BenchError {
    /// Backend unreachable, credentials rejected, or the socket died mid-statement
    #[error("Connection error: {0}")]
    Connection(String),

    /// No pooled handle became available before the acquire timeout
    #[error("Pool exhausted: no connection available after {waited:?}")]
    PoolExhausted { waited: Duration },

    /// Acquire attempted after the pool was shut down
    #[error("Pool is closed")]
    PoolClosed,

    /// Unique-key collision on username or email
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// The id does not (or no longer) exist
    #[error("Entity {id} not found")]
    NotFound { id: i64 },

    /// Any other statement-level failure reported by the store
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration rejected before any connection was opened
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A worker task panicked or was cancelled
    #[error("Worker failure: {0}")]
    Worker(String),
}

/// Result type alias for poolbench-core operations
pub type Result<T> = std::result::Result<T, BenchError>;

impl BenchError {
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection(reason.into())
    }

    pub fn constraint(reason: impl Into<String>) -> Self {
        Self::ConstraintViolation(reason.into())
    }

    pub fn database(reason: impl Into<String>) -> Self {
        Self::Database(reason.into())
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// Errors after which no further work in the phase can proceed.
    ///
    /// Everything else is a per-item failure: counted, logged, and the
    /// worker moves on to the next item. `InvalidConfig` is rejected before
    /// any phase starts and never reaches a worker.
    pub fn is_phase_fatal(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::PoolClosed | Self::Worker(_))
    }

    /// Whether the connection that produced this error must not be reused.
    pub fn breaks_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BenchError::NotFound { id: 42 };
        assert_eq!(err.to_string(), "Entity 42 not found");

        let err = BenchError::PoolExhausted {
            waited: Duration::from_secs(1),
        };
        assert!(err.to_string().contains("Pool exhausted"));
        assert!(err.to_string().contains("1s"));
    }

    #[test]
    fn test_phase_fatal_classification() {
        assert!(BenchError::connection("refused").is_phase_fatal());
        assert!(BenchError::PoolClosed.is_phase_fatal());
        assert!(BenchError::Worker("panicked".into()).is_phase_fatal());

        assert!(!BenchError::PoolExhausted {
            waited: Duration::from_millis(10)
        }
        .is_phase_fatal());
        assert!(!BenchError::constraint("users_email_key").is_phase_fatal());
        assert!(!BenchError::NotFound { id: 1 }.is_phase_fatal());
        assert!(!BenchError::database("syntax").is_phase_fatal());
        assert!(!BenchError::invalid_config("max_size").is_phase_fatal());
    }

    #[test]
    fn test_only_connection_errors_break_handles() {
        assert!(BenchError::connection("reset by peer").breaks_connection());
        assert!(!BenchError::NotFound { id: 7 }.breaks_connection());
        assert!(!BenchError::constraint("dup").breaks_connection());
    }
}
