//! Bulkhead concurrency isolation
//!
//! A named bulkhead caps how many protected calls for one service execute
//! at once, with a bounded FIFO admission queue behind the cap. Saturation
//! of one operation class (say, webhook deliveries) then cannot exhaust the
//! resources another class (LLM calls) depends on. Beyond cap plus queue,
//! callers are rejected immediately rather than piling up.
//!
//! Slots are modeled with a fair [`tokio::sync::Semaphore`], so queued
//! waiters are admitted in arrival order and a caller that gives up while
//! queued (its future is dropped) leaves neither a queue entry nor a slot
//! behind.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use crate::config::{ResilienceConfig, ServiceTier};
use crate::error::ResilienceError;
use crate::events::{ResilienceEvent, ResilienceEventKind, ResilienceListener};

/// Point-in-time snapshot of a bulkhead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadStats {
    /// Importance tier this bulkhead was configured for
    pub tier: ServiceTier,
    /// Calls currently executing
    pub active_count: usize,
    /// Callers currently waiting for a slot
    pub queue_len: usize,
    /// Lifetime immediate rejections
    pub rejection_count: u64,
}

/// Concurrency limiter with a bounded FIFO admission queue.
pub struct Bulkhead {
    name: String,
    tier: ServiceTier,
    max_concurrent: usize,
    max_queue_size: usize,
    slots: Semaphore,
    queue_len: AtomicUsize,
    rejection_count: AtomicU64,
    listeners: Vec<Arc<dyn ResilienceListener>>,
}

/// RAII admission slot; dropping it frees the slot and admits the next
/// queued waiter.
#[derive(Debug)]
pub struct BulkheadSlot<'a> {
    _permit: SemaphorePermit<'a>,
}

/// Decrements the queue length when the waiting caller either gets a slot
/// or gives up (future dropped).
struct QueueGuard<'a>(&'a AtomicUsize);

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Bulkhead {
    /// Create a bulkhead from the service's resolved configuration.
    pub fn new(name: impl Into<String>, config: &ResilienceConfig) -> Self {
        Self::with_listeners(name, config, Vec::new())
    }

    /// Create a bulkhead with event listeners attached.
    pub fn with_listeners(
        name: impl Into<String>,
        config: &ResilienceConfig,
        listeners: Vec<Arc<dyn ResilienceListener>>,
    ) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            name: name.into(),
            tier: config.tier,
            max_concurrent,
            max_queue_size: config.max_queue_size,
            slots: Semaphore::new(max_concurrent),
            queue_len: AtomicUsize::new(0),
            rejection_count: AtomicU64::new(0),
            listeners,
        }
    }

    /// Service name this bulkhead isolates.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured tier.
    pub fn tier(&self) -> ServiceTier {
        self.tier
    }

    /// Acquire an execution slot.
    ///
    /// Admits immediately when a slot is free; otherwise queues FIFO up to
    /// the configured bound and suspends the caller until a slot frees.
    /// Returns `None` when both the slots and the queue are full; the
    /// rejection is recorded, nothing blocks.
    pub async fn acquire(&self) -> Option<BulkheadSlot<'_>> {
        if let Ok(permit) = self.slots.try_acquire() {
            return Some(BulkheadSlot { _permit: permit });
        }

        // Saturated: claim a queue position or reject. The CAS bound keeps
        // queue length from ever exceeding the configured maximum.
        let mut waiting = self.queue_len.load(Ordering::Acquire);
        loop {
            if waiting >= self.max_queue_size {
                self.reject().await;
                return None;
            }
            match self.queue_len.compare_exchange(
                waiting,
                waiting + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => waiting = actual,
            }
        }

        let _queued = QueueGuard(&self.queue_len);
        debug!(bulkhead = %self.name, "at capacity, queueing caller");
        match self.slots.acquire().await {
            Ok(permit) => Some(BulkheadSlot { _permit: permit }),
            // The semaphore is never closed; treat it as a rejection rather
            // than panicking if that ever changes.
            Err(_) => {
                self.reject().await;
                None
            }
        }
    }

    /// Execute `f` inside an admission slot. Standalone entry point for
    /// callers not going through a [`crate::manager::ResilienceManager`].
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let slot = self.acquire().await.ok_or_else(|| {
            ResilienceError::BulkheadRejected {
                name: self.name.clone(),
            }
        })?;
        let result = f().await.map_err(ResilienceError::Inner);
        drop(slot);
        result
    }

    /// Snapshot of the bulkhead's occupancy and counters.
    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            tier: self.tier,
            active_count: self.max_concurrent - self.slots.available_permits().min(self.max_concurrent),
            queue_len: self.queue_len.load(Ordering::Acquire),
            rejection_count: self.rejection_count.load(Ordering::Relaxed),
        }
    }

    /// Zero the lifetime counters. Queued waiters are caller-owned futures
    /// and drain naturally; administrative reset does not evict them.
    pub fn reset(&self) {
        self.rejection_count.store(0, Ordering::Relaxed);
    }

    async fn reject(&self) {
        self.rejection_count.fetch_add(1, Ordering::Relaxed);
        warn!(
            bulkhead = %self.name,
            max_concurrent = self.max_concurrent,
            max_queue = self.max_queue_size,
            "capacity exhausted, rejecting call"
        );
        if !self.listeners.is_empty() {
            let event = ResilienceEvent::now(&self.name, ResilienceEventKind::BulkheadRejected);
            for listener in &self.listeners {
                listener.on_event(&event).await;
            }
        }
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("tier", &self.tier)
            .field("max_concurrent", &self.max_concurrent)
            .field("max_queue_size", &self.max_queue_size)
            .finish_non_exhaustive()
    }
}
