//! Message handlers and the per-processor handler stack.
//!
//! A processor dispatches each message through its handler stack from the
//! top down. A handler either consumes the message or lets it fall
//! through to the next handler below; messages no handler wants are
//! logged and discarded. Handlers swap behavior with
//! [`ProcessorContext::become_handler`] and [`ProcessorContext::unbecome`].

use crate::processor::{PostResult, Processor};
use eventum_core::id::{DispatcherName, ProcessorId};
use std::any::Any;
use std::fmt;

/// An opaque message payload.
///
/// Handlers inspect messages by downcasting to the concrete types they
/// understand.
pub struct Message {
    payload: Box<dyn Any + Send>,
}

impl Message {
    pub fn new<M: Send + 'static>(value: M) -> Self {
        Self {
            payload: Box::new(value),
        }
    }

    /// Borrow the payload as `M` if that is its concrete type
    pub fn downcast_ref<M: 'static>(&self) -> Option<&M> {
        self.payload.downcast_ref::<M>()
    }

    pub fn is<M: 'static>(&self) -> bool {
        self.payload.is::<M>()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message").finish_non_exhaustive()
    }
}

/// Outcome of offering a message to a single handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The handler consumed the message
    Done,
    /// The handler does not want this message; offer it to the next
    /// handler down the stack
    Unhandled,
}

/// A message handler.
///
/// Handlers run to completion on a worker thread, serialized per
/// processor; `&mut self` state needs no further synchronization.
pub trait Handler: Send {
    fn handle(&mut self, msg: &Message, ctx: &mut ProcessorContext<'_>) -> Handled;

    /// Handler name for logging
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<F> Handler for F
where
    F: FnMut(&Message, &mut ProcessorContext<'_>) -> Handled + Send,
{
    fn handle(&mut self, msg: &Message, ctx: &mut ProcessorContext<'_>) -> Handled {
        self(msg, ctx)
    }
}

/// Identity helper for closure handlers; pins down the closure's argument
/// types so plain `|msg, ctx| ...` literals infer correctly
pub fn handler_fn<F>(f: F) -> F
where
    F: FnMut(&Message, &mut ProcessorContext<'_>) -> Handled + Send,
{
    f
}

/// A pending handler-stack mutation, applied under the task lock once the
/// current dispatch returns
pub(crate) enum StackOp {
    Become {
        handler: Box<dyn Handler>,
        stack_previous: bool,
    },
    Unbecome,
}

/// Handler-side view of the processor being dispatched.
///
/// Stack mutations requested here are applied after the handler returns,
/// under the same task-lock hold, so they take effect from the next
/// message onward.
pub struct ProcessorContext<'a> {
    processor: &'a Processor,
    ops: Vec<StackOp>,
}

impl<'a> ProcessorContext<'a> {
    pub(crate) fn new(processor: &'a Processor) -> Self {
        Self {
            processor,
            ops: Vec::new(),
        }
    }

    pub fn processor_id(&self) -> &ProcessorId {
        self.processor.id()
    }

    pub fn dispatcher(&self) -> &DispatcherName {
        self.processor.dispatcher()
    }

    /// Swap behavior: push `handler` on top of the stack when
    /// `stack_previous` is true, otherwise replace the current top
    pub fn become_handler(&mut self, handler: impl Handler + 'static, stack_previous: bool) {
        self.ops.push(StackOp::Become {
            handler: Box::new(handler),
            stack_previous,
        });
    }

    /// Pop the top handler, restoring the previous behavior. On a
    /// single-handler stack this is a warned no-op.
    pub fn unbecome(&mut self) {
        self.ops.push(StackOp::Unbecome);
    }

    /// Post a message back to this processor's own queue. Non-blocking;
    /// subject to the same capacity and stopping checks as any post.
    pub fn post_to_self<M: Send + 'static>(&self, msg: M) -> PostResult {
        self.processor.post(msg)
    }

    /// Post a message to another registered processor by id
    pub fn post_to<M: Send + 'static>(&self, id: &ProcessorId, msg: M) -> PostResult {
        match self.processor.engine() {
            Some(engine) => engine.registrar().post_by_id(id, Message::new(msg)),
            None => PostResult::UnknownId,
        }
    }

    pub(crate) fn take_ops(&mut self) -> Vec<StackOp> {
        std::mem::take(&mut self.ops)
    }
}

/// The ordered handler stack of a processor. Lives inside the task lock;
/// every read and write is serialized with dispatch.
pub(crate) struct HandlerStack {
    handlers: Vec<Box<dyn Handler>>,
}

impl fmt::Debug for HandlerStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerStack")
            .field("depth", &self.handlers.len())
            .finish()
    }
}

impl HandlerStack {
    /// Build a stack with its initial handler installed. Called during
    /// processor construction, before the processor is visible to any
    /// worker thread.
    pub(crate) fn new(initial: Box<dyn Handler>) -> Self {
        Self {
            handlers: vec![initial],
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.handlers.len()
    }

    /// Offer `msg` to handlers from the top of the stack down. Returns
    /// whether any handler consumed it.
    pub(crate) fn dispatch(&mut self, msg: &Message, ctx: &mut ProcessorContext<'_>) -> bool {
        for handler in self.handlers.iter_mut().rev() {
            match handler.handle(msg, ctx) {
                Handled::Done => return true,
                Handled::Unhandled => continue,
            }
        }
        false
    }

    pub(crate) fn apply(&mut self, op: StackOp, id: &ProcessorId) {
        match op {
            StackOp::Become {
                handler,
                stack_previous,
            } => {
                if stack_previous {
                    self.handlers.push(handler);
                } else {
                    *self
                        .handlers
                        .last_mut()
                        .expect("handler stack is never empty") = handler;
                }
            }
            StackOp::Unbecome => {
                if self.handlers.len() > 1 {
                    self.handlers.pop();
                } else {
                    tracing::warn!(processor_id = %id, "unbecome on a single-handler stack ignored");
                }
            }
        }
    }
}
