//! State-change and outcome events for external observers
//!
//! The resilience layer emits events so an external logger or metrics
//! exporter can follow state transitions and call outcomes. Events are
//! observability signals only; correctness never depends on anyone
//! listening. Listeners are supplied at construction time, typically via
//! [`crate::registry::ResilienceRegistry::with_listener`].

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::circuit_breaker::CircuitState;

/// A single event emitted by a breaker or bulkhead.
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceEvent {
    /// Name of the service the emitting component protects
    pub service: String,
    /// What happened
    pub kind: ResilienceEventKind,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}

impl ResilienceEvent {
    pub(crate) fn now(service: &str, kind: ResilienceEventKind) -> Self {
        Self {
            service: service.to_string(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Event kinds covering circuit breaker transitions and call outcomes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResilienceEventKind {
    /// The breaker changed state
    StateChange {
        from: CircuitState,
        to: CircuitState,
    },
    /// The breaker opened (follows a `StateChange`)
    Opened,
    /// The breaker moved to half-open (follows a `StateChange`)
    HalfOpened,
    /// The breaker closed (follows a `StateChange`)
    Closed,
    /// A protected call succeeded
    Success,
    /// A protected call failed or timed out
    Failure { error: String },
    /// The breaker rejected a call without invoking it
    Rejected,
    /// The bulkhead rejected a call without invoking it
    BulkheadRejected,
}

/// Observer interface for resilience events.
///
/// Implementations must be cheap or hand off to their own channel/task;
/// events are delivered inline from the calling task after internal locks
/// are released.
#[async_trait::async_trait]
pub trait ResilienceListener: Send + Sync {
    /// Called for every emitted event.
    async fn on_event(&self, event: &ResilienceEvent);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Listener that records every event it sees, for assertions.
    #[derive(Default)]
    pub struct CollectingListener {
        events: Mutex<Vec<ResilienceEvent>>,
    }

    impl CollectingListener {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub async fn kinds(&self) -> Vec<ResilienceEventKind> {
            self.events.lock().await.iter().map(|e| e.kind.clone()).collect()
        }
    }

    #[async_trait::async_trait]
    impl ResilienceListener for CollectingListener {
        async fn on_event(&self, event: &ResilienceEvent) {
            self.events.lock().await.push(event.clone());
        }
    }
}
