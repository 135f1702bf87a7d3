//! Composition of breaker, bulkhead and timeout for one service
//!
//! A [`ResilienceManager`] owns at most one circuit breaker and one
//! bulkhead for a logical downstream service and applies them in a fixed
//! order: breaker admission outermost (an open circuit fails fast without
//! consuming a bulkhead slot), bulkhead admission next, and the call
//! timeout applied to the protected function itself inside the slot.
//! Layers disabled by configuration are skipped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::ResilienceConfig;
use crate::error::ResilienceError;
use crate::events::ResilienceListener;
use crate::timeout::TimeoutGuard;

/// Combined snapshot of a manager's breaker and bulkhead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceStats {
    /// Service name
    pub name: String,
    /// Breaker state (`Closed` when the breaker is disabled)
    pub state: CircuitState,
    /// Failures inside the current rolling window
    pub failures: u32,
    /// Lifetime successful calls
    pub successes: u64,
    /// Lifetime breaker fail-fast rejections
    pub rejections: u64,
    /// Calls currently executing
    pub active_count: usize,
    /// Callers currently queued for a slot
    pub queue_len: usize,
    /// Time of the last breaker state change, if a breaker is enabled
    pub last_state_change: Option<DateTime<Utc>>,
}

/// Execution guard for one named downstream service.
pub struct ResilienceManager {
    name: String,
    config: ResilienceConfig,
    circuit_breaker: Option<CircuitBreaker>,
    bulkhead: Option<Bulkhead>,
}

impl ResilienceManager {
    /// Create a manager from the service's resolved configuration.
    pub fn new(name: impl Into<String>, config: ResilienceConfig) -> Self {
        Self::with_listeners(name, config, Vec::new())
    }

    /// Create a manager whose breaker and bulkhead report to `listeners`.
    pub fn with_listeners(
        name: impl Into<String>,
        config: ResilienceConfig,
        listeners: Vec<Arc<dyn ResilienceListener>>,
    ) -> Self {
        let name = name.into();
        let circuit_breaker = config
            .circuit_breaker_enabled
            .then(|| CircuitBreaker::with_listeners(&name, &config, listeners.clone()));
        let bulkhead = config
            .bulkhead_enabled
            .then(|| Bulkhead::with_listeners(&name, &config, listeners));
        Self {
            name,
            config,
            circuit_breaker,
            bulkhead,
        }
    }

    /// Service name this manager guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration this manager was built from.
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// The owned breaker, if enabled.
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    /// The owned bulkhead, if enabled.
    pub fn bulkhead(&self) -> Option<&Bulkhead> {
        self.bulkhead.as_ref()
    }

    /// Execute `f` under the full guard stack.
    ///
    /// `operation` names the call in timeout errors and logs. Outcomes are
    /// recorded into the breaker: success and the operation's own errors
    /// (and timeouts) count; layer rejections do not. With both layers
    /// disabled the function runs unguarded.
    pub async fn execute<T, E, F, Fut>(&self, operation: &str, f: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if self.circuit_breaker.is_none() && self.bulkhead.is_none() {
            return f().await.map_err(ResilienceError::Inner);
        }

        // Breaker admission first: an open circuit must not consume a
        // bulkhead slot. The admission is held across the call so that a
        // cancelled caller releases a half-open trial gate on drop.
        let admission = match &self.circuit_breaker {
            Some(breaker) => Some(breaker.try_acquire().await?),
            None => None,
        };

        let slot = match &self.bulkhead {
            Some(bulkhead) => match bulkhead.acquire().await {
                Some(slot) => Some(slot),
                None => {
                    // The call never ran; dropping the admission frees a
                    // half-open trial gate without touching the breaker's
                    // failure accounting.
                    drop(admission);
                    return Err(ResilienceError::BulkheadRejected {
                        name: self.name.clone(),
                    });
                }
            },
            None => None,
        };

        let result = TimeoutGuard::run(operation, self.config.call_timeout, f()).await;
        drop(slot);

        if let Some(breaker) = &self.circuit_breaker {
            match &result {
                Ok(_) => breaker.record_success().await,
                Err(e) => breaker.record_failure(&e.to_string()).await,
            }
        }
        drop(admission);
        result
    }

    /// Combined statistics of both layers.
    pub async fn stats(&self) -> ResilienceStats {
        let breaker = match &self.circuit_breaker {
            Some(b) => Some(b.stats().await),
            None => None,
        };
        let bulkhead = self.bulkhead.as_ref().map(|b| b.stats());
        ResilienceStats {
            name: self.name.clone(),
            state: breaker
                .as_ref()
                .map(|s| s.state)
                .unwrap_or(CircuitState::Closed),
            failures: breaker.as_ref().map(|s| s.failure_count).unwrap_or(0),
            successes: breaker.as_ref().map(|s| s.success_count).unwrap_or(0),
            rejections: breaker.as_ref().map(|s| s.rejection_count).unwrap_or(0),
            active_count: bulkhead.as_ref().map(|s| s.active_count).unwrap_or(0),
            queue_len: bulkhead.as_ref().map(|s| s.queue_len).unwrap_or(0),
            last_state_change: breaker.map(|s| s.last_state_change),
        }
    }

    /// Force-close the breaker and clear bulkhead counters.
    /// Administrative operation, not part of normal failure handling.
    pub async fn reset(&self) {
        if let Some(breaker) = &self.circuit_breaker {
            breaker.reset().await;
        }
        if let Some(bulkhead) = &self.bulkhead {
            bulkhead.reset();
        }
    }
}

impl fmt::Debug for ResilienceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceManager")
            .field("name", &self.name)
            .field("circuit_breaker", &self.circuit_breaker.is_some())
            .field("bulkhead", &self.bulkhead.is_some())
            .finish()
    }
}
