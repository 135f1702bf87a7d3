//! Error types for the resilience layer
//!
//! Every error this layer can produce is returned to the caller, never
//! swallowed. The enum is generic over the protected operation's own error
//! type so that inner failures propagate unchanged.

use std::time::Duration;
use thiserror::Error;

use crate::circuit_breaker::CircuitState;

/// Result alias for guarded operations.
pub type GuardResult<T, E> = std::result::Result<T, ResilienceError<E>>;

/// Errors produced by the resilience layer.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The protected call exceeded its deadline. Classified as a failure
    /// for circuit breaker purposes.
    #[error("operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        /// Name of the protected operation
        operation: String,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// Fail-fast rejection while the circuit is open or a half-open trial
    /// is already in flight. The underlying operation was never invoked and
    /// no new failure is recorded.
    #[error("circuit '{name}' is {state}, failing fast")]
    CircuitOpen {
        /// Name of the circuit breaker
        name: String,
        /// Breaker state at rejection time
        state: CircuitState,
    },

    /// Concurrency and queue capacity exhausted. The underlying operation
    /// was never invoked; this is a resource-exhaustion signal, not a
    /// circuit failure.
    #[error("bulkhead '{name}' rejected the call, capacity exhausted")]
    BulkheadRejected {
        /// Name of the bulkhead
        name: String,
    },

    /// The operation's own error, propagated unchanged. Classified as a
    /// failure for circuit breaker purposes.
    #[error("{0}")]
    Inner(E),
}

impl<E> ResilienceError<E> {
    /// Whether this error was produced by the resilience layer itself,
    /// without the protected operation ever running.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::BulkheadRejected { .. }
        )
    }

    /// Unwrap the operation's own error, if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let err: ResilienceError<std::io::Error> = ResilienceError::Timeout {
            operation: "llm".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert!(err.to_string().contains("timed out"));

        let err: ResilienceError<std::io::Error> = ResilienceError::CircuitOpen {
            name: "llm".to_string(),
            state: CircuitState::Open,
        };
        assert!(err.to_string().contains("failing fast"));
        assert!(err.is_rejection());

        let err: ResilienceError<std::io::Error> = ResilienceError::BulkheadRejected {
            name: "vector-search".to_string(),
        };
        assert!(err.is_rejection());
    }

    #[test]
    fn into_inner_unwraps_operation_error() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "downstream unreachable");
        let err = ResilienceError::Inner(inner);
        assert!(!err.is_rejection());
        assert!(err.into_inner().is_some());

        let err: ResilienceError<std::io::Error> = ResilienceError::BulkheadRejected {
            name: "db".to_string(),
        };
        assert!(err.into_inner().is_none());
    }
}
