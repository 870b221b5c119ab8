//! Concurrent processor registry.
//!
//! The registrar is the publication boundary for processors: insertion
//! makes a processor reachable by id, removal makes it logically dead.
//! It is sharded internally (dashmap) and never held across handler
//! execution.

use crate::handler::Message;
use crate::processor::{PostResult, Processor};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use eventum_core::error::{Error, Result};
use eventum_core::id::ProcessorId;
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct Registrar {
    processors: DashMap<ProcessorId, Arc<Processor>>,
}

impl Registrar {
    pub(crate) fn new() -> Self {
        Self {
            processors: DashMap::new(),
        }
    }

    pub(crate) fn register(&self, processor: Arc<Processor>) -> Result<()> {
        match self.processors.entry(processor.id().clone()) {
            Entry::Occupied(_) => Err(Error::duplicate_id(processor.id().as_str())),
            Entry::Vacant(entry) => {
                entry.insert(processor);
                Ok(())
            }
        }
    }

    /// Remove a processor by id. Idempotent; returns whether this call
    /// removed the entry.
    pub(crate) fn unregister(&self, id: &ProcessorId) -> bool {
        self.processors.remove(id).is_some()
    }

    pub(crate) fn get(&self, id: &ProcessorId) -> Option<Arc<Processor>> {
        self.processors.get(id).map(|entry| entry.value().clone())
    }

    /// Whether `processor` is the instance currently registered under its
    /// id. Distinguishes a live registration from a same-id successor, so
    /// a retired incarnation is never re-queued as a ghost.
    pub(crate) fn same_instance(&self, processor: &Arc<Processor>) -> bool {
        self.processors
            .get(processor.id())
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), processor))
    }

    /// Remove the registration only if `processor` is still the instance
    /// registered under its id. Keeps a stop() from tearing down a
    /// same-id successor registered after a concurrent stop won.
    pub(crate) fn unregister_instance(&self, processor: &Arc<Processor>) -> bool {
        self.processors
            .remove_if(processor.id(), |_, current| Arc::ptr_eq(current, processor))
            .is_some()
    }

    /// Route a message to the processor registered under `id`
    pub(crate) fn post_by_id(&self, id: &ProcessorId, msg: Message) -> PostResult {
        match self.get(id) {
            Some(processor) => processor.post_message(msg),
            None => PostResult::UnknownId,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.processors.len()
    }
}
