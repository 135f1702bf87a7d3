//! Deadline enforcement for protected calls
//!
//! [`TimeoutGuard`] races an operation against a deadline. It holds no
//! state; the manager applies it to the protected function inside the
//! bulkhead slot, and the circuit breaker classifies the resulting
//! [`ResilienceError::Timeout`] as a failure.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::ResilienceError;

/// Stateless execution wrapper racing a future against a deadline.
pub struct TimeoutGuard;

impl TimeoutGuard {
    /// Run `fut` with a deadline of `timeout`.
    ///
    /// If the deadline elapses first, the losing future is dropped, which
    /// propagates cancellation through tokio, and a
    /// [`ResilienceError::Timeout`] naming `operation` is returned at
    /// approximately the deadline rather than at the operation's own
    /// completion time.
    pub async fn run<T, E, F>(
        operation: &str,
        timeout: Duration,
        fut: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ResilienceError::Inner(e)),
            Err(_) => {
                warn!(operation, ?timeout, "operation exceeded its deadline");
                Err(ResilienceError::Timeout {
                    operation: operation.to_string(),
                    timeout,
                })
            }
        }
    }
}
