//! Pending-call queue
//!
//! Any thread may schedule a call to run on the main thread at its next
//! safe point. The queue is bounded: when it is full, enqueueing fails and
//! hands the call back so the caller can retry.

use crossbeam::queue::ArrayQueue;

use crate::error::GuestResult;
use crate::interpreter::Interpreter;

/// Maximum number of calls waiting at once.
pub const PENDING_CALLS_CAPACITY: usize = 32;

/// A call scheduled for the main thread.
pub type PendingFn = Box<dyn FnOnce(&Interpreter) -> GuestResult<()> + Send>;

/// Bounded multi-producer queue of pending calls.
pub struct PendingCalls {
    queue: ArrayQueue<PendingFn>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::with_capacity(PENDING_CALLS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Enqueue a call, returning it back if the queue is full.
    pub fn push(&self, call: PendingFn) -> Result<(), PendingFn> {
        self.queue.push(call)
    }

    pub fn pop(&self) -> Option<PendingFn> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}
