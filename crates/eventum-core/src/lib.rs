//! # Eventum Core
//!
//! Shared substrate for the Eventum event-processing engine: error types,
//! validated configuration, identifier newtypes, and the idle backoff
//! policy.

pub mod backoff;
pub mod config;
pub mod error;
pub mod id;

// Re-exports for convenience
pub use backoff::BackoffPolicy;
pub use config::{BackoffConfig, EngineConfig, MAX_QUEUE_SIZE, MIN_QUEUE_SIZE};
pub use error::{Error, Result};
pub use id::{DispatcherName, ProcessorId, SUBSCRIPTIONS_DISPATCHER};

/// The current version of Eventum
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
