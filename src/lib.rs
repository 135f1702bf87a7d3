//! Resilience primitives for unreliable async downstream services
//!
//! This crate protects callers from cascading failures when invoking
//! unreliable downstream operations such as LLM calls, vector search,
//! database queries or webhook deliveries. Three mechanisms compose into a
//! single execution guard:
//!
//! - a per-call timeout ([`TimeoutGuard`]),
//! - a failure-triggered circuit breaker ([`CircuitBreaker`]),
//! - a concurrency-limiting bulkhead with a bounded FIFO queue
//!   ([`Bulkhead`]).
//!
//! A [`ResilienceManager`] composes them per logical service; a
//! [`ResilienceRegistry`] maps service names to managers so call sites
//! share breaker and bulkhead state.
//!
//! # Example
//!
//! ```no_run
//! use resilience_guard::{ResilienceConfig, ResilienceRegistry};
//!
//! # async fn call_llm() -> Result<String, std::io::Error> { Ok(String::new()) }
//! # async fn demo() {
//! let registry = ResilienceRegistry::new();
//! let llm = registry
//!     .get_or_create("llm", ResilienceConfig::critical())
//!     .await;
//!
//! match llm.execute("completion", || call_llm()).await {
//!     Ok(answer) => println!("{answer}"),
//!     Err(err) => eprintln!("guarded call failed: {err}"),
//! }
//! # }
//! ```
//!
//! Retries, fallbacks and distributed circuit state are deliberately out of
//! scope; they belong to wrappers outside this layer. Each process tracks
//! its own circuit state.

pub mod bulkhead;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod registry;
pub mod timeout;

pub use bulkhead::{Bulkhead, BulkheadSlot, BulkheadStats};
pub use circuit_breaker::{CircuitAdmission, CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use config::{ResilienceConfig, ServiceTier};
pub use error::{GuardResult, ResilienceError};
pub use events::{ResilienceEvent, ResilienceEventKind, ResilienceListener};
pub use manager::{ResilienceManager, ResilienceStats};
pub use registry::{HealthReport, ResilienceRegistry};
pub use timeout::TimeoutGuard;
