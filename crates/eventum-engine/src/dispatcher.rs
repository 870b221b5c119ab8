//! Dispatcher ready queues.
//!
//! A dispatcher is a named FIFO of processors currently eligible for
//! dispatch, guarded by one non-fair mutex and two condition variables:
//! `work_available` (a processor was inserted) and `processor_returned`
//! (a worker finished a dispatch cycle). Locks are held only to
//! enqueue, dequeue, and signal, never across handler execution.

use crate::processor::Processor;
use eventum_core::id::DispatcherName;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of a non-blocking claim attempt
pub(crate) enum Claim {
    /// Another thread holds the dispatcher lock
    Busy,
    /// The ready queue is empty
    Empty,
    /// A processor was claimed; the caller owns its dispatch cycle
    Claimed(Arc<Processor>),
}

/// Result of stop()'s removal step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemovalStatus {
    /// The processor was removed from the ready queue
    Removed,
    /// The processor is neither queued nor being dispatched
    AlreadyGone,
    /// The deadline passed while the processor was still in flight
    TimedOut,
}

#[derive(Debug)]
pub(crate) struct Dispatcher {
    name: DispatcherName,
    ready: Mutex<VecDeque<Arc<Processor>>>,
    work_available: Condvar,
    processor_returned: Condvar,
    messages_dispatched: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn new(name: DispatcherName) -> Self {
        Self {
            name,
            ready: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            processor_returned: Condvar::new(),
            messages_dispatched: AtomicU64::new(0),
        }
    }

    pub(crate) fn name(&self) -> &DispatcherName {
        &self.name
    }

    /// Append a processor to the ready queue and wake one waiter
    pub(crate) fn enqueue(&self, processor: Arc<Processor>) {
        let mut ready = self.ready.lock();
        ready.push_back(processor);
        self.work_available.notify_one();
    }

    /// Non-blocking claim of the processor at the head of the queue.
    ///
    /// The claimed processor is marked in-flight before the lock is
    /// released, so observers never see it outside the queue without the
    /// flag set.
    pub(crate) fn try_claim(&self) -> Claim {
        let Some(mut ready) = self.ready.try_lock() else {
            return Claim::Busy;
        };
        match ready.pop_front() {
            Some(processor) => {
                processor.set_in_flight(true);
                Claim::Claimed(processor)
            }
            None => Claim::Empty,
        }
    }

    /// Close out a dispatch cycle: optionally return the processor to the
    /// back of the queue, clear its in-flight flag, and signal
    /// `processor_returned` so stop() observers can progress.
    pub(crate) fn finish_dispatch(&self, processor: &Arc<Processor>, requeue: bool) {
        let mut ready = self.ready.lock();
        if requeue {
            ready.push_back(processor.clone());
            self.work_available.notify_one();
        }
        processor.set_in_flight(false);
        self.processor_returned.notify_all();
    }

    /// Park until a processor is inserted or `timeout` elapses.
    ///
    /// Idle processors remain queued, so an emptiness check here would
    /// defeat the park entirely; the wait is unconditional and bounded,
    /// and spurious wakeups are fine because callers re-poll.
    pub(crate) fn wait_for_work(&self, timeout: Duration) {
        let mut ready = self.ready.lock();
        self.work_available.wait_for(&mut ready, timeout);
    }

    /// Wake every thread parked on `work_available`; used at shutdown so
    /// workers observe the stop flag promptly
    pub(crate) fn wake_all(&self) {
        let _ready = self.ready.lock();
        self.work_available.notify_all();
    }

    /// Remove a queued processor, by identity. Used by the defensive
    /// multi-dispatcher scan in stop().
    pub(crate) fn try_remove(&self, processor: &Arc<Processor>) -> bool {
        let mut ready = self.ready.lock();
        match ready.iter().position(|q| Arc::ptr_eq(q, processor)) {
            Some(pos) => {
                ready.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Remove the processor from the ready queue, waiting on
    /// `processor_returned` while it is out being dispatched.
    pub(crate) fn remove_or_wait(
        &self,
        processor: &Arc<Processor>,
        deadline: Instant,
    ) -> RemovalStatus {
        let mut ready = self.ready.lock();
        loop {
            if let Some(pos) = ready.iter().position(|q| Arc::ptr_eq(q, processor)) {
                ready.remove(pos);
                return RemovalStatus::Removed;
            }
            if !processor.is_in_flight() {
                return RemovalStatus::AlreadyGone;
            }
            if self
                .processor_returned
                .wait_until(&mut ready, deadline)
                .timed_out()
            {
                return RemovalStatus::TimedOut;
            }
        }
    }

    /// Current ready-queue depth
    pub(crate) fn ready_len(&self) -> usize {
        self.ready.lock().len()
    }

    /// Count one message dispatched through this queue
    pub(crate) fn record_dispatched(&self) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Total messages dispatched through this queue since startup
    pub(crate) fn messages_dispatched(&self) -> u64 {
        self.messages_dispatched.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn hold_lock_for_test(&self) -> parking_lot::MutexGuard<'_, VecDeque<Arc<Processor>>> {
        self.ready.lock()
    }
}
