//! Processors: actor-like entities owning a private message queue and a
//! handler stack.
//!
//! A processor's handler stack lives inside its task lock, so handler
//! execution and stack mutation are serialized by construction. The
//! message queue is bounded; posting never blocks and never panics.

use crate::engine::EngineShared;
use crate::handler::{Handler, HandlerStack, Message, ProcessorContext, StackOp};
use eventum_core::id::{DispatcherName, ProcessorId};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::fmt;
use std::sync::{OnceLock, Weak};

/// Outcome of posting a message. A value, never an error: producers are
/// expected to inspect it and decide for themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostResult {
    /// The message was enqueued and will be dispatched
    Accepted,
    /// The processor declined the message
    Rejected(RejectReason),
    /// No processor with that id is registered (by-id posts only)
    UnknownId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The processor has begun stopping and accepts no new messages
    Stopping,
    /// The bounded message queue is at capacity
    QueueFull,
}

impl PostResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PostResult::Accepted)
    }
}

/// What a single dispatch cycle accomplished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    /// One queued message was dispatched
    Processed,
    /// The message queue was empty
    Idle,
}

/// A queued item: either a user message or an in-band handler change.
///
/// Handler-change requests travel through the same queue as user
/// messages, so they take effect in post order.
pub(crate) enum Envelope {
    User(Message),
    Become {
        handler: Box<dyn Handler>,
        stack_previous: bool,
    },
    Unbecome,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Envelope::User(msg) => f.debug_tuple("User").field(msg).finish(),
            Envelope::Become { stack_previous, .. } => f
                .debug_struct("Become")
                .field("stack_previous", stack_previous)
                .finish_non_exhaustive(),
            Envelope::Unbecome => write!(f, "Unbecome"),
        }
    }
}

/// Construction recipe for a processor: dispatcher pinning, optional
/// explicit id and queue capacity, and the initial handler.
pub struct ProcessorSpec {
    pub(crate) id: Option<ProcessorId>,
    pub(crate) dispatcher: DispatcherName,
    pub(crate) queue_capacity: Option<usize>,
    pub(crate) handler: Box<dyn Handler>,
}

impl ProcessorSpec {
    pub fn new(dispatcher: impl Into<DispatcherName>, handler: impl Handler + 'static) -> Self {
        Self {
            id: None,
            dispatcher: dispatcher.into(),
            queue_capacity: None,
            handler: Box::new(handler),
        }
    }

    /// Use an explicit id instead of a generated one
    pub fn with_id(mut self, id: impl Into<ProcessorId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Override the engine-wide default queue capacity for this processor
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }
}

/// An actor-like message processor pinned to one dispatcher.
#[derive(Debug)]
pub struct Processor {
    id: ProcessorId,
    dispatcher: DispatcherName,
    capacity: usize,
    mailbox: Mutex<VecDeque<Envelope>>,
    /// The task lock. Holding it is what serializes handler execution
    /// and handler-stack mutation for this processor.
    stack: Mutex<HandlerStack>,
    stopping: AtomicBool,
    /// True while a worker is between claiming this processor and
    /// returning it; read by stop() to tell "dispatching" from "gone"
    in_flight: AtomicBool,
    engine: OnceLock<Weak<EngineShared>>,
}

impl Processor {
    /// Build a processor with its initial handler installed. The stack is
    /// populated here, before the processor becomes visible to any other
    /// thread.
    pub(crate) fn new(
        id: ProcessorId,
        dispatcher: DispatcherName,
        capacity: usize,
        initial: Box<dyn Handler>,
    ) -> Self {
        Self {
            id,
            dispatcher,
            capacity,
            mailbox: Mutex::new(VecDeque::new()),
            stack: Mutex::new(HandlerStack::new(initial)),
            stopping: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            engine: OnceLock::new(),
        }
    }

    pub fn id(&self) -> &ProcessorId {
        &self.id
    }

    pub fn dispatcher(&self) -> &DispatcherName {
        &self.dispatcher
    }

    pub fn queue_capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the number of queued messages
    pub fn current_queue_size(&self) -> usize {
        self.mailbox.lock().len()
    }

    /// Post a message into this processor's queue. Never blocks; multiple
    /// producers may post concurrently.
    pub fn post<M: Send + 'static>(&self, msg: M) -> PostResult {
        self.post_message(Message::new(msg))
    }

    /// Post an already-wrapped message
    pub fn post_message(&self, msg: Message) -> PostResult {
        self.post_envelope(Envelope::User(msg))
    }

    /// Request a handler swap, delivered through the message queue so it
    /// takes effect in post order. Safe from any thread.
    pub fn request_become(
        &self,
        handler: impl Handler + 'static,
        stack_previous: bool,
    ) -> PostResult {
        self.post_envelope(Envelope::Become {
            handler: Box::new(handler),
            stack_previous,
        })
    }

    /// Request a handler pop, delivered through the message queue
    pub fn request_unbecome(&self) -> PostResult {
        self.post_envelope(Envelope::Unbecome)
    }

    /// Flip the stopping flag. Idempotent; once set, posts are rejected
    /// and the processor leaves its dispatcher once its queue drains.
    pub fn mark_stopping(&self) {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            tracing::debug!(processor_id = %self.id, "processor marked stopping");
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn post_envelope(&self, envelope: Envelope) -> PostResult {
        if self.is_stopping() {
            return PostResult::Rejected(RejectReason::Stopping);
        }
        let mut mailbox = self.mailbox.lock();
        // Re-check under the lock: the worker's retire decision
        // (stopping && empty) runs under this same lock, so a post
        // serialized after it is rejected rather than stranded.
        if self.is_stopping() {
            return PostResult::Rejected(RejectReason::Stopping);
        }
        if mailbox.len() >= self.capacity {
            return PostResult::Rejected(RejectReason::QueueFull);
        }
        mailbox.push_back(envelope);
        PostResult::Accepted
    }

    /// Dispatch at most one queued message through the handler stack.
    ///
    /// Invoked by a worker that has claimed this processor; holds no
    /// dispatcher lock. Panics escaping a handler are caught, logged,
    /// and swallowed.
    pub(crate) fn run_once(&self) -> RunOutcome {
        let mut stack = self.stack.lock();
        let envelope = self.mailbox.lock().pop_front();
        let Some(envelope) = envelope else {
            return RunOutcome::Idle;
        };

        match envelope {
            Envelope::User(msg) => {
                let mut ctx = ProcessorContext::new(self);
                let dispatched =
                    panic::catch_unwind(AssertUnwindSafe(|| stack.dispatch(&msg, &mut ctx)));
                match dispatched {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(
                            processor_id = %self.id,
                            "no handler matched message, discarding"
                        );
                    }
                    Err(payload) => {
                        tracing::error!(
                            processor_id = %self.id,
                            panic = panic_message(payload.as_ref()),
                            "handler panicked, message dropped"
                        );
                        // Stack ops requested before the panic die with it.
                        let _ = ctx.take_ops();
                    }
                }
                for op in ctx.take_ops() {
                    stack.apply(op, &self.id);
                }
            }
            Envelope::Become {
                handler,
                stack_previous,
            } => stack.apply(
                StackOp::Become {
                    handler,
                    stack_previous,
                },
                &self.id,
            ),
            Envelope::Unbecome => stack.apply(StackOp::Unbecome, &self.id),
        }
        RunOutcome::Processed
    }

    /// Whether a worker finishing a dispatch should return this processor
    /// to its dispatcher queue. Stopping processors stay in rotation
    /// until their queue is drained, then retire.
    pub(crate) fn should_requeue(&self) -> bool {
        if !self.is_stopping() {
            return true;
        }
        // Same lock as post_envelope's re-check: once this observes
        // stopping && empty, no later post can slip a message in.
        !self.mailbox.lock().is_empty()
    }

    pub(crate) fn set_in_flight(&self, value: bool) {
        self.in_flight.store(value, Ordering::Release);
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Snapshot of the handler stack depth
    pub fn handler_stack_depth(&self) -> usize {
        self.stack.lock().depth()
    }

    pub(crate) fn bind_engine(&self, engine: Weak<EngineShared>) {
        let _ = self.engine.set(engine);
    }

    pub(crate) fn engine(&self) -> Option<std::sync::Arc<EngineShared>> {
        self.engine.get().and_then(Weak::upgrade)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<opaque panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, Handled};
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;

    fn recording_processor(capacity: usize) -> (Processor, Arc<PlMutex<Vec<String>>>) {
        let log = Arc::new(PlMutex::new(Vec::new()));
        let sink = log.clone();
        let processor = Processor::new(
            ProcessorId::new("p1"),
            DispatcherName::default_dispatcher(),
            capacity,
            Box::new(handler_fn(move |msg, _ctx| {
                if let Some(s) = msg.downcast_ref::<String>() {
                    sink.lock().push(s.clone());
                    Handled::Done
                } else {
                    Handled::Unhandled
                }
            })),
        );
        (processor, log)
    }

    #[test]
    fn test_post_and_run_in_order() {
        let (p, log) = recording_processor(16);
        assert!(p.post("a".to_string()).is_accepted());
        assert!(p.post("b".to_string()).is_accepted());
        assert_eq!(p.current_queue_size(), 2);

        assert_eq!(p.run_once(), RunOutcome::Processed);
        assert_eq!(p.run_once(), RunOutcome::Processed);
        assert_eq!(p.run_once(), RunOutcome::Idle);
        assert_eq!(*log.lock(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_post_rejected_when_stopping() {
        let (p, _log) = recording_processor(16);
        p.mark_stopping();
        assert_eq!(
            p.post("x".to_string()),
            PostResult::Rejected(RejectReason::Stopping)
        );
        assert_eq!(p.current_queue_size(), 0);
    }

    #[test]
    fn test_post_rejected_when_full() {
        let (p, _log) = recording_processor(2);
        assert!(p.post("a".to_string()).is_accepted());
        assert!(p.post("b".to_string()).is_accepted());
        assert_eq!(
            p.post("c".to_string()),
            PostResult::Rejected(RejectReason::QueueFull)
        );
        assert_eq!(p.current_queue_size(), 2);
    }

    #[test]
    fn test_mark_stopping_is_idempotent() {
        let (p, _log) = recording_processor(4);
        p.mark_stopping();
        p.mark_stopping();
        assert!(p.is_stopping());
    }

    #[test]
    fn test_unmatched_message_is_discarded() {
        let (p, log) = recording_processor(16);
        assert!(p.post(42u64).is_accepted());
        assert_eq!(p.run_once(), RunOutcome::Processed);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_become_from_handler_takes_effect_next_message() {
        let log = Arc::new(PlMutex::new(Vec::new()));
        let sink = log.clone();
        let p = Processor::new(
            ProcessorId::new("p2"),
            DispatcherName::default_dispatcher(),
            16,
            Box::new(handler_fn(move |msg, ctx| {
                let Some(s) = msg.downcast_ref::<String>() else {
                    return Handled::Unhandled;
                };
                if s == "swap" {
                    let sink = sink.clone();
                    ctx.become_handler(
                        handler_fn(move |msg: &Message, _ctx: &mut ProcessorContext<'_>| {
                            if let Some(s) = msg.downcast_ref::<String>() {
                                sink.lock().push(format!("new:{s}"));
                                Handled::Done
                            } else {
                                Handled::Unhandled
                            }
                        }),
                        true,
                    );
                }
                Handled::Done
            })),
        );

        assert!(p.post("swap".to_string()).is_accepted());
        assert!(p.post("after".to_string()).is_accepted());
        p.run_once();
        p.run_once();
        assert_eq!(*log.lock(), vec!["new:after".to_string()]);
        assert_eq!(p.handler_stack_depth(), 2);
    }

    #[test]
    fn test_request_become_preserves_post_order() {
        let (p, log) = recording_processor(16);
        assert!(p.post("before".to_string()).is_accepted());
        let sink = log.clone();
        assert!(p
            .request_become(
                handler_fn(move |msg: &Message, _ctx: &mut ProcessorContext<'_>| {
                    if let Some(s) = msg.downcast_ref::<String>() {
                        sink.lock().push(format!("top:{s}"));
                        Handled::Done
                    } else {
                        Handled::Unhandled
                    }
                }),
                true,
            )
            .is_accepted());
        assert!(p.post("after".to_string()).is_accepted());

        for _ in 0..3 {
            p.run_once();
        }
        assert_eq!(
            *log.lock(),
            vec!["before".to_string(), "top:after".to_string()]
        );
    }

    #[test]
    fn test_request_unbecome_pops_requested_handler() {
        let (p, log) = recording_processor(16);
        assert!(p
            .request_become(
                handler_fn(|_msg: &Message, _ctx: &mut ProcessorContext<'_>| Handled::Done),
                true,
            )
            .is_accepted());
        assert!(p.request_unbecome().is_accepted());
        assert!(p.post("x".to_string()).is_accepted());

        for _ in 0..3 {
            p.run_once();
        }
        // Swallow-all handler was pushed then popped again; the original
        // handler saw the message.
        assert_eq!(*log.lock(), vec!["x".to_string()]);
        assert_eq!(p.handler_stack_depth(), 1);
    }

    #[test]
    fn test_handler_panic_is_swallowed() {
        let log = Arc::new(PlMutex::new(Vec::new()));
        let sink = log.clone();
        let p = Processor::new(
            ProcessorId::new("p3"),
            DispatcherName::default_dispatcher(),
            16,
            Box::new(handler_fn(move |msg, _ctx| {
                let Some(s) = msg.downcast_ref::<String>() else {
                    return Handled::Unhandled;
                };
                if s == "boom" {
                    panic!("handler failure");
                }
                sink.lock().push(s.clone());
                Handled::Done
            })),
        );

        assert!(p.post("boom".to_string()).is_accepted());
        assert!(p.post("ok".to_string()).is_accepted());
        assert_eq!(p.run_once(), RunOutcome::Processed);
        assert_eq!(p.run_once(), RunOutcome::Processed);
        assert_eq!(*log.lock(), vec!["ok".to_string()]);
    }

    #[test]
    fn test_should_requeue_follows_stop_and_drain() {
        let (p, _log) = recording_processor(16);
        assert!(p.should_requeue());

        assert!(p.post("pending".to_string()).is_accepted());
        p.mark_stopping();
        // Still draining: stays in rotation.
        assert!(p.should_requeue());

        p.run_once();
        // Stopping and drained: retire.
        assert!(!p.should_requeue());
    }

    #[test]
    fn test_handler_change_rejected_when_stopping() {
        let (p, _log) = recording_processor(16);
        p.mark_stopping();
        assert_eq!(
            p.request_become(
                handler_fn(|_msg: &Message, _ctx: &mut ProcessorContext<'_>| Handled::Done),
                true,
            ),
            PostResult::Rejected(RejectReason::Stopping)
        );
        assert_eq!(p.request_unbecome(), PostResult::Rejected(RejectReason::Stopping));
    }

    #[test]
    fn test_control_envelopes_count_toward_capacity() {
        let (p, _log) = recording_processor(1);
        assert!(p
            .request_become(
                handler_fn(|_msg: &Message, _ctx: &mut ProcessorContext<'_>| Handled::Done),
                false,
            )
            .is_accepted());
        assert_eq!(
            p.post("x".to_string()),
            PostResult::Rejected(RejectReason::QueueFull)
        );
    }
}
