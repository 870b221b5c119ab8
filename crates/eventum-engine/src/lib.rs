//! # Eventum Engine
//!
//! An actor-like in-process event-processing engine: many independent
//! message processors multiplexed onto a small fixed pool of worker
//! threads via pinned dispatcher queues.
//!
//! Processors own a private bounded message queue and a handler stack.
//! Worker threads claim ready processors from their assigned
//! dispatchers, dispatch exactly one message under the processor's task
//! lock, and return the processor to its queue.
//!
//! ```no_run
//! use eventum_core::config::EngineConfig;
//! use eventum_engine::{handler_fn, Engine, Handled, ProcessorSpec};
//! use std::time::Duration;
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! engine.start()?;
//!
//! let printer = engine.register(ProcessorSpec::new(
//!     "",
//!     handler_fn(|msg, _ctx| {
//!         let Some(line) = msg.downcast_ref::<String>() else {
//!             return Handled::Unhandled;
//!         };
//!         println!("{line}");
//!         Handled::Done
//!     }),
//! ))?;
//!
//! printer.post("hello".to_string());
//! engine.stop(printer.id(), Duration::from_secs(1));
//! engine.shutdown();
//! # Ok::<(), eventum_core::error::Error>(())
//! ```

mod dispatcher;
pub mod engine;
pub mod handler;
pub mod processor;
mod registrar;
mod worker;

pub use engine::{DispatcherStats, Engine, EngineStats, StopOutcome};
pub use handler::{handler_fn, Handled, Handler, Message, ProcessorContext};
pub use processor::{PostResult, Processor, ProcessorSpec, RejectReason};
