//! Per-thread interpreter state
//!
//! Each thread that touches the interpreter gets its own error indicator and
//! call-frame stack. The registry is what lets a diagnostic thread walk every
//! thread's current stack.

use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::ErrorTriple;

/// State owned by a single thread.
#[derive(Debug, Default)]
pub struct ThreadState {
    /// Thread name when spawned with one
    pub name: Option<String>,
    /// Pending exception
    pub error: Option<ErrorTriple>,
    /// Names of executing functions, outermost first
    pub frames: Vec<String>,
}

/// Snapshot of one thread's call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadStack {
    pub thread: ThreadId,
    pub name: Option<String>,
    pub frames: Vec<String>,
}

/// Registry of thread states.
#[derive(Debug, Default)]
pub struct ThreadStates {
    states: Mutex<FxHashMap<ThreadId, ThreadState>>,
}

impl ThreadStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the calling thread's state, creating it on first use.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut ThreadState) -> R) -> R {
        let current = thread::current();
        let mut states = self.states.lock();
        let state = states.entry(current.id()).or_insert_with(|| ThreadState {
            name: current.name().map(str::to_owned),
            ..ThreadState::default()
        });
        f(state)
    }

    pub fn push_frame(&self, name: &str) {
        self.with_current(|s| s.frames.push(name.to_owned()));
    }

    pub fn pop_frame(&self) {
        self.with_current(|s| {
            s.frames.pop();
        });
    }

    /// Call stacks of every known thread.
    pub fn stacks(&self) -> Vec<ThreadStack> {
        self.states
            .lock()
            .iter()
            .map(|(id, state)| ThreadStack {
                thread: *id,
                name: state.name.clone(),
                frames: state.frames.clone(),
            })
            .collect()
    }

    /// Remove the calling thread's state, returning any unread error.
    pub fn forget_current(&self) -> Option<ErrorTriple> {
        self.states
            .lock()
            .remove(&thread::current().id())
            .and_then(|s| s.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_per_thread() {
        let states = std::sync::Arc::new(ThreadStates::new());
        states.push_frame("main_fn");

        let worker = {
            let states = states.clone();
            thread::Builder::new()
                .name("worker".into())
                .spawn(move || {
                    states.push_frame("worker_fn");
                    states.push_frame("inner");
                })
                .unwrap()
        };
        worker.join().unwrap();

        let stacks = states.stacks();
        assert_eq!(stacks.len(), 2);
        let worker_stack = stacks.iter().find(|s| s.name.as_deref() == Some("worker")).unwrap();
        assert_eq!(worker_stack.frames, vec!["worker_fn", "inner"]);
    }
}
