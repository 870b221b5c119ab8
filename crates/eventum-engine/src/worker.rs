//! Worker loop.
//!
//! Each worker owns a fixed, configured list of dispatchers and cycles
//! over them round-robin, claiming one processor at a time and
//! dispatching exactly one message per claim. When a full pass over the
//! assigned dispatchers yields nothing, the worker parks on a
//! `work_available` condvar for a geometrically growing delay.

use crate::dispatcher::{Claim, Dispatcher};
use crate::engine::EngineShared;
use crate::processor::{Processor, RunOutcome};
use eventum_core::backoff::BackoffPolicy;
use eventum_core::id::ProcessorId;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static ACTIVE_PROCESSOR: RefCell<Option<ProcessorId>> = const { RefCell::new(None) };
}

/// Id of the processor currently dispatching on this thread, if any.
/// Lets the engine detect a handler calling `stop` on its own processor.
pub(crate) fn active_processor_id() -> Option<ProcessorId> {
    ACTIVE_PROCESSOR.with(|cell| cell.borrow().clone())
}

struct ActiveGuard;

impl ActiveGuard {
    fn enter(id: &ProcessorId) -> Self {
        ACTIVE_PROCESSOR.with(|cell| *cell.borrow_mut() = Some(id.clone()));
        Self
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE_PROCESSOR.with(|cell| *cell.borrow_mut() = None);
    }
}

/// Bookkeeping for a worker's idle strategy: counts fruitless claim
/// attempts and grows the park delay geometrically once a full pass
/// over the assigned dispatchers produces no message.
struct IdleBackoff {
    policy: BackoffPolicy,
    pass_len: usize,
    fruitless: usize,
    delay: std::time::Duration,
}

impl IdleBackoff {
    fn new(policy: BackoffPolicy, pass_len: usize) -> Self {
        Self {
            policy,
            pass_len,
            fruitless: 0,
            delay: policy.initial(),
        }
    }

    /// A message was dispatched; back to the hot path.
    fn on_dispatched(&mut self) {
        self.fruitless = 0;
        self.delay = self.policy.initial();
    }

    /// A claim produced no message (lock busy, queue empty, or claimed
    /// processor idle). Once every assigned dispatcher has come up
    /// empty, returns how long to park before the next pass.
    fn on_fruitless(&mut self) -> Option<std::time::Duration> {
        self.fruitless += 1;
        if self.fruitless < self.pass_len {
            return None;
        }
        self.fruitless = 0;
        let park = self.delay;
        self.delay = self.policy.next(self.delay);
        Some(park)
    }
}

pub(crate) struct Worker {
    index: usize,
    assigned: Vec<Arc<Dispatcher>>,
    shared: Arc<EngineShared>,
}

impl Worker {
    pub(crate) fn new(index: usize, assigned: Vec<Arc<Dispatcher>>, shared: Arc<EngineShared>) -> Self {
        Self {
            index,
            assigned,
            shared,
        }
    }

    pub(crate) fn run(self) {
        let policy = BackoffPolicy::from_config(&self.shared.config().backoff);
        let mut idle = IdleBackoff::new(policy, self.assigned.len());
        let mut rr_index = 0usize;

        tracing::debug!(
            worker = self.index,
            dispatchers = self.assigned.len(),
            "worker started"
        );

        while self.shared.keep_going() {
            let dispatcher = &self.assigned[rr_index];
            rr_index = (rr_index + 1) % self.assigned.len();

            let dispatched = match dispatcher.try_claim() {
                Claim::Claimed(processor) => {
                    self.dispatch(dispatcher, &processor) == RunOutcome::Processed
                }
                Claim::Busy | Claim::Empty => false,
            };

            if dispatched {
                idle.on_dispatched();
            } else if let Some(park) = idle.on_fruitless() {
                // A full pass produced no message: park until work
                // arrives, the delay lapses, or shutdown wakes us.
                self.assigned[rr_index].wait_for_work(park);
            }
        }

        tracing::debug!(worker = self.index, "worker exited");
    }

    /// One dispatch cycle: run a single message, then return the
    /// processor to its queue unless it has retired or its registration
    /// is gone or replaced.
    fn dispatch(&self, dispatcher: &Dispatcher, processor: &Arc<Processor>) -> RunOutcome {
        let outcome = {
            let _guard = ActiveGuard::enter(processor.id());
            processor.run_once()
        };

        if outcome == RunOutcome::Processed {
            dispatcher.record_dispatched();
        }

        let requeue =
            self.shared.registrar().same_instance(processor) && processor.should_requeue();
        dispatcher.finish_dispatch(processor, requeue);

        if !requeue {
            tracing::debug!(
                processor_id = %processor.id(),
                dispatcher = %dispatcher.name(),
                "processor left dispatch rotation"
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_micros(10), 2.0, Duration::from_micros(40))
    }

    #[test]
    fn test_idle_backoff_parks_only_after_full_pass() {
        let mut idle = IdleBackoff::new(policy(), 3);
        assert_eq!(idle.on_fruitless(), None);
        assert_eq!(idle.on_fruitless(), None);
        assert_eq!(idle.on_fruitless(), Some(Duration::from_micros(10)));
        // The pass counter restarts after a park.
        assert_eq!(idle.on_fruitless(), None);
    }

    #[test]
    fn test_idle_backoff_grows_geometrically_and_caps() {
        let mut idle = IdleBackoff::new(policy(), 1);
        assert_eq!(idle.on_fruitless(), Some(Duration::from_micros(10)));
        assert_eq!(idle.on_fruitless(), Some(Duration::from_micros(20)));
        assert_eq!(idle.on_fruitless(), Some(Duration::from_micros(40)));
        assert_eq!(idle.on_fruitless(), Some(Duration::from_micros(40)));
    }

    #[test]
    fn test_idle_backoff_resets_on_dispatch() {
        let mut idle = IdleBackoff::new(policy(), 1);
        idle.on_fruitless();
        idle.on_fruitless();
        idle.on_dispatched();
        assert_eq!(idle.on_fruitless(), Some(Duration::from_micros(10)));
    }

    #[test]
    fn test_idle_backoff_partial_pass_resets_on_dispatch() {
        let mut idle = IdleBackoff::new(policy(), 2);
        assert_eq!(idle.on_fruitless(), None);
        idle.on_dispatched();
        // A fresh full pass is required again before parking.
        assert_eq!(idle.on_fruitless(), None);
        assert_eq!(idle.on_fruitless(), Some(Duration::from_micros(10)));
    }

    #[test]
    fn test_active_guard_scopes_processor_id() {
        assert!(active_processor_id().is_none());
        {
            let _guard = ActiveGuard::enter(&ProcessorId::new("w0"));
            assert_eq!(active_processor_id(), Some(ProcessorId::new("w0")));
        }
        assert!(active_processor_id().is_none());
    }
}
