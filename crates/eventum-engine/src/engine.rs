//! The engine: owns the dispatchers, the registrar, and the worker
//! threads, and implements the processor lifecycle
//! (register / post / stop / shutdown).

use crate::dispatcher::{Dispatcher, RemovalStatus};
use crate::handler::Message;
use crate::processor::{PostResult, Processor, ProcessorSpec};
use crate::registrar::Registrar;
use crate::worker::{self, Worker};
use eventum_core::config::{EngineConfig, MAX_QUEUE_SIZE, MIN_QUEUE_SIZE};
use eventum_core::error::{Error, Result};
use eventum_core::id::{DispatcherName, ProcessorId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Cadence of queue-size polling during stop()'s drain phase
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Bound on stop()'s wait for an in-flight dispatch to return
const REMOVAL_TIMEOUT: Duration = Duration::from_secs(5);

const STATE_CREATED: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_SHUTDOWN: u8 = 2;

/// State shared between the engine handle and its worker threads.
///
/// The dispatcher map is immutable after construction and ordered by
/// name, so any multi-dispatcher traversal acquires locks in one
/// deterministic lexicographic order.
#[derive(Debug)]
pub(crate) struct EngineShared {
    config: EngineConfig,
    dispatchers: BTreeMap<DispatcherName, Arc<Dispatcher>>,
    registrar: Registrar,
    keep_going: AtomicBool,
}

impl EngineShared {
    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    pub(crate) fn keep_going(&self) -> bool {
        self.keep_going.load(Ordering::Acquire)
    }
}

/// What `stop` accomplished.
///
/// Stop never raises: a drain timeout is reported here and in the log,
/// and losing a race against a concurrent stop of the same id simply
/// reports `unregistered: false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// The message queue was empty when the drain phase ended
    pub drained: bool,
    /// Messages still queued when the drain phase ended; dropped
    pub remaining: usize,
    /// Whether this call removed the registration (false if the id was
    /// already gone or a concurrent stop got there first)
    pub unregistered: bool,
}

/// Point-in-time engine introspection snapshot
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub running: bool,
    pub worker_count: usize,
    pub processor_count: usize,
    /// Per-dispatcher counters, in name order
    pub dispatchers: Vec<DispatcherStats>,
}

/// Per-dispatcher counters
#[derive(Debug, Clone)]
pub struct DispatcherStats {
    pub name: DispatcherName,
    /// Processors currently in the ready queue
    pub ready: usize,
    /// Messages dispatched through this queue since startup
    pub messages_dispatched: u64,
}

/// The event-processing engine.
///
/// Created with a validated configuration, started once, shut down once.
/// All operations take `&self`; the engine is shared across threads
/// behind an `Arc`.
#[derive(Debug)]
pub struct Engine {
    shared: Arc<EngineShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    state: AtomicU8,
}

impl Engine {
    /// Build an engine from a configuration. The configuration is
    /// validated; no threads are spawned until [`Engine::start`].
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let dispatchers = config
            .valid_dispatcher_names()
            .into_iter()
            .map(|name| (name.clone(), Arc::new(Dispatcher::new(name))))
            .collect();

        Ok(Self {
            shared: Arc::new(EngineShared {
                config,
                dispatchers,
                registrar: Registrar::new(),
                keep_going: AtomicBool::new(true),
            }),
            workers: Mutex::new(Vec::new()),
            state: AtomicU8::new(STATE_CREATED),
        })
    }

    /// Spawn the worker threads, one per entry in the configured thread
    /// assignment. Fails with `AlreadyStarted` on a second call.
    pub fn start(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(
                STATE_CREATED,
                STATE_STARTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::AlreadyStarted);
        }

        let mut handles = self.workers.lock();
        for (index, assignment) in self
            .shared
            .config
            .thread_dispatcher_assignment
            .iter()
            .enumerate()
        {
            let assigned = assignment
                .iter()
                .map(|name| {
                    let name = DispatcherName::new(name.clone());
                    self.shared.dispatchers.get(&name).cloned().ok_or_else(|| {
                        Error::internal(format!("dispatcher {name} missing at startup"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let thread_worker = Worker::new(index, assigned, self.shared.clone());
            let handle = std::thread::Builder::new()
                .name(format!("eventum-worker-{index}"))
                .spawn(move || thread_worker.run())
                .map_err(|e| Error::internal(format!("failed to spawn worker {index}: {e}")))?;
            handles.push(handle);
        }

        tracing::info!(
            workers = handles.len(),
            dispatchers = self.shared.dispatchers.len(),
            "engine started"
        );
        Ok(())
    }

    /// Construct and register a processor, making it dispatchable.
    ///
    /// The initial handler is installed before the processor becomes
    /// visible to any worker; posts to its id are delivered from the
    /// moment this returns.
    pub fn register(&self, spec: ProcessorSpec) -> Result<Arc<Processor>> {
        if self.state.load(Ordering::Acquire) != STATE_STARTED {
            return Err(Error::NotStarted);
        }

        let dispatcher = self
            .shared
            .dispatchers
            .get(&spec.dispatcher)
            .cloned()
            .ok_or_else(|| Error::unknown_dispatcher(spec.dispatcher.as_str()))?;

        let capacity = match spec.queue_capacity {
            Some(c) if (MIN_QUEUE_SIZE..=MAX_QUEUE_SIZE).contains(&c) => c,
            Some(_) => {
                return Err(Error::config_invalid(
                    "queue_capacity",
                    format!("must be in [{MIN_QUEUE_SIZE}, {MAX_QUEUE_SIZE}]"),
                ))
            }
            None => self.shared.config.default_queue_size,
        };

        let id = spec.id.unwrap_or_else(ProcessorId::generate);
        let processor = Arc::new(Processor::new(id, spec.dispatcher, capacity, spec.handler));
        processor.bind_engine(Arc::downgrade(&self.shared));

        self.shared.registrar.register(processor.clone())?;
        dispatcher.enqueue(processor.clone());

        tracing::info!(
            processor_id = %processor.id(),
            dispatcher = %processor.dispatcher(),
            queue_capacity = processor.queue_capacity(),
            "processor registered"
        );
        Ok(processor)
    }

    /// Post a message to a registered processor by id. O(1): touches only
    /// the target processor's private queue.
    pub fn post<M: Send + 'static>(&self, id: &ProcessorId, msg: M) -> PostResult {
        self.shared.registrar.post_by_id(id, Message::new(msg))
    }

    /// Stop a processor: drain its queue within `timeout`, remove it from
    /// its dispatcher, and unregister it.
    ///
    /// Blocking and idempotent; concurrent stops of the same id are safe,
    /// with exactly one performing the unregistration. Must not be called
    /// from a handler running on the target processor: that would be a
    /// wait on the caller's own dispatch cycle, and is detected and
    /// refused.
    pub fn stop(&self, id: &ProcessorId, timeout: Duration) -> StopOutcome {
        let Some(processor) = self.shared.registrar.get(id) else {
            return StopOutcome {
                drained: true,
                remaining: 0,
                unregistered: false,
            };
        };

        if worker::active_processor_id().as_ref() == Some(id) {
            tracing::error!(
                processor_id = %id,
                "stop() called from the processor's own handler; refusing"
            );
            return StopOutcome {
                drained: false,
                remaining: processor.current_queue_size(),
                unregistered: false,
            };
        }

        processor.mark_stopping();

        // Drain: workers keep dispatching the processor while it still
        // has messages; new posts are rejected from here on.
        let deadline = Instant::now().checked_add(timeout);
        let drained = loop {
            let pending = processor.current_queue_size();
            if pending == 0 {
                break true;
            }
            if !self.shared.registrar.same_instance(&processor) {
                // A concurrent stop finished the teardown.
                return StopOutcome {
                    drained: false,
                    remaining: pending,
                    unregistered: false,
                };
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break false;
            }
            std::thread::sleep(DRAIN_POLL_INTERVAL);
        };

        let remaining = processor.current_queue_size();
        if !drained {
            tracing::error!(
                processor_id = %id,
                remaining,
                "stop drain timed out, dropping undelivered messages"
            );
        }

        self.remove_from_dispatch(&processor);

        let unregistered = self.shared.registrar.unregister_instance(&processor);
        if unregistered {
            tracing::info!(processor_id = %id, "processor unregistered");
        }

        StopOutcome {
            drained,
            remaining,
            unregistered,
        }
    }

    /// Remove the processor from its dispatcher's ready queue, waiting
    /// out an in-flight dispatch on the `processor_returned` condvar.
    fn remove_from_dispatch(&self, processor: &Arc<Processor>) {
        let deadline = Instant::now() + REMOVAL_TIMEOUT;

        match self.shared.dispatchers.get(processor.dispatcher()) {
            Some(dispatcher) => match dispatcher.remove_or_wait(processor, deadline) {
                RemovalStatus::Removed | RemovalStatus::AlreadyGone => return,
                RemovalStatus::TimedOut => {
                    tracing::warn!(
                        processor_id = %processor.id(),
                        dispatcher = %processor.dispatcher(),
                        "processor did not return to its dispatcher within the removal timeout"
                    );
                }
            },
            None => {
                tracing::error!(
                    processor_id = %processor.id(),
                    dispatcher = %processor.dispatcher(),
                    "processor names a dispatcher the engine does not own"
                );
            }
        }

        // Defensive: the processor was not where its name says it should
        // be. The map is ordered by name, so this scan takes dispatcher
        // locks in the same order as any other caller.
        for dispatcher in self.shared.dispatchers.values() {
            if dispatcher.try_remove(processor) {
                tracing::warn!(
                    processor_id = %processor.id(),
                    dispatcher = %dispatcher.name(),
                    "processor removed from an unexpected dispatcher"
                );
                return;
            }
        }

        if processor.is_in_flight() {
            tracing::error!(
                processor_id = %processor.id(),
                "processor still in flight after removal timeout"
            );
        }
    }

    /// Stop the worker threads. Does not drain processor queues; stop
    /// processors first if their remaining messages matter. Idempotent;
    /// any in-flight dispatch completes before its worker exits.
    pub fn shutdown(&self) {
        let prev = self.state.swap(STATE_SHUTDOWN, Ordering::AcqRel);
        self.shared.keep_going.store(false, Ordering::Release);
        for dispatcher in self.shared.dispatchers.values() {
            dispatcher.wake_all();
        }

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }

        if prev == STATE_STARTED {
            tracing::info!("engine shut down");
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_STARTED && self.shared.keep_going()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Point-in-time snapshot of engine state
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            running: self.is_running(),
            worker_count: self.workers.lock().len(),
            processor_count: self.shared.registrar.len(),
            dispatchers: self
                .shared
                .dispatchers
                .iter()
                .map(|(name, dispatcher)| DispatcherStats {
                    name: name.clone(),
                    ready: dispatcher.ready_len(),
                    messages_dispatched: dispatcher.messages_dispatched(),
                })
                .collect(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
