//! Global execution lock
//!
//! Only one thread runs guest code at a time. The lock is reentrant for its
//! owner, and [`ExecutionLock::allow_threads`] releases it around blocking
//! work so other threads can make progress.

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Single-active-thread execution lock.
#[derive(Debug, Default)]
pub struct ExecutionLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl ExecutionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the calling thread owns the lock.
    pub fn acquire(&self) -> GilGuard<'_> {
        self.lock_with_depth(1);
        GilGuard { lock: self }
    }

    /// True if the calling thread currently owns the lock.
    pub fn held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Owning thread, if any.
    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }

    /// Run `f` with the lock released, restoring the caller's hold afterwards.
    ///
    /// A thread that does not hold the lock just runs `f`.
    pub fn allow_threads<R>(&self, f: impl FnOnce() -> R) -> R {
        let me = thread::current().id();
        let saved = {
            let mut state = self.state.lock();
            if state.owner != Some(me) {
                None
            } else {
                let depth = state.depth;
                state.owner = None;
                state.depth = 0;
                Some(depth)
            }
        };
        if saved.is_some() {
            self.released.notify_all();
        }
        let result = f();
        if let Some(depth) = saved {
            self.lock_with_depth(depth);
        }
        result
    }

    fn lock_with_depth(&self, depth: usize) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            state.depth += depth;
            return;
        }
        while state.owner.is_some() {
            self.released.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth = depth;
    }

    fn release_one(&self) {
        let mut state = self.state.lock();
        if state.owner != Some(thread::current().id()) {
            return;
        }
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_all();
        }
    }
}

/// RAII hold on the execution lock.
#[must_use = "the lock is released when the guard drops"]
pub struct GilGuard<'a> {
    lock: &'a ExecutionLock,
}

impl Drop for GilGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_reentrant_acquire() {
        let lock = ExecutionLock::new();
        let outer = lock.acquire();
        {
            let _inner = lock.acquire();
            assert!(lock.held_by_current_thread());
        }
        assert!(lock.held_by_current_thread());
        drop(outer);
        assert!(!lock.held_by_current_thread());
    }

    #[test]
    fn test_allow_threads_lets_other_thread_in() {
        let lock = Arc::new(ExecutionLock::new());
        let ran = Arc::new(AtomicBool::new(false));
        let _guard = lock.acquire();

        let worker = {
            let lock = lock.clone();
            let ran = ran.clone();
            thread::spawn(move || {
                let _g = lock.acquire();
                ran.store(true, Ordering::SeqCst);
            })
        };

        lock.allow_threads(|| {
            worker.join().unwrap();
        });
        assert!(ran.load(Ordering::SeqCst));
        assert!(lock.held_by_current_thread());
    }

    #[test]
    fn test_allow_threads_without_hold_just_runs() {
        let lock = ExecutionLock::new();
        let value = lock.allow_threads(|| {
            thread::sleep(Duration::from_millis(1));
            7
        });
        assert_eq!(value, 7);
        assert!(lock.owner().is_none());
    }
}
