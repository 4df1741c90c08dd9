//! Error types returned by the breaker.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors from calling through the breaker.
///
/// `Open`, `Capacity` and `PoolUnavailable` are returned synchronously by
/// [`CircuitBreaker::call`](crate::CircuitBreaker::call) and never count as
/// breaker failures. The remaining variants surface from result retrieval on a
/// [`CallHandle`](crate::CallHandle), after the breaker has recorded them.
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    #[error("Circuit is open")]
    Open,

    #[error("Execution pool saturated: {in_flight} in flight, capacity {capacity}")]
    Capacity { in_flight: usize, capacity: usize },

    #[error("Execution pool could not be started: {0}")]
    PoolUnavailable(#[source] std::io::Error),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("No result within {0:?}")]
    TimedOut(Duration),

    #[error("Operation failed: {0}")]
    Operation(#[source] E),

    #[error("Operation panicked: {0}")]
    Panicked(String),
}

impl<E> BreakerError<E> {
    /// Whether the call was refused before reaching the execution pool.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Open | Self::Capacity { .. } | Self::PoolUnavailable(_)
        )
    }

    /// The error returned by the operation itself, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(err) => Some(err),
            _ => None,
        }
    }

    /// Short label used in log events.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Capacity { .. } => "capacity",
            Self::PoolUnavailable(_) => "pool_unavailable",
            Self::Cancelled => "cancelled",
            Self::TimedOut(_) => "timed_out",
            Self::Operation(_) => "operation",
            Self::Panicked(_) => "panicked",
        }
    }
}

/// Errors from constructing a breaker.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_rejections_are_distinguished() {
        let open: BreakerError<io::Error> = BreakerError::Open;
        let full: BreakerError<io::Error> = BreakerError::Capacity {
            in_flight: 4,
            capacity: 4,
        };
        let cancelled: BreakerError<io::Error> = BreakerError::Cancelled;

        assert!(open.is_rejection());
        assert!(full.is_rejection());
        assert!(!cancelled.is_rejection());
        assert_eq!(
            full.to_string(),
            "Execution pool saturated: 4 in flight, capacity 4"
        );
    }

    #[test]
    fn test_operation_error_is_transparent() {
        let err: BreakerError<io::Error> =
            BreakerError::Operation(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(err.kind(), "operation");

        let inner = err.into_operation().unwrap();
        assert_eq!(inner.kind(), io::ErrorKind::ConnectionReset);
    }
}
