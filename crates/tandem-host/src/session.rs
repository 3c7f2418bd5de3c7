//! HostSession — per-process Host interpreter state
//!
//! The Host is single threaded: GC roots, call frames and closure calls
//! belong to the thread that created the session. Other threads may hold
//! a session reference but every mutating operation checks the caller.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{HostError, HostResult};
use crate::value::{HostArgs, HostString, HostValue, Vector};

/// Default cap on condition message length.
pub const DEFAULT_WARNING_LENGTH: usize = 1000;

/// Accepted range for the message cap.
pub const WARNING_LENGTH_RANGE: (usize, usize) = (100, 8170);

/// Receipt for a preserved value; pass it back to [`HostSession::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreciousToken(u64);

impl PreciousToken {
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Host interpreter session.
pub struct HostSession {
    main_thread: ThreadId,
    /// Values kept alive regardless of reachability.
    precious: DashMap<u64, HostValue>,
    next_token: AtomicU64,
    /// Deparsed call expressions, outermost first.
    frames: Mutex<Vec<String>>,
    stashed_trace: Mutex<Option<HostValue>>,
    warning_length: AtomicUsize,
    interrupt: AtomicBool,
}

impl HostSession {
    /// Create a session owned by the calling thread.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            main_thread: thread::current().id(),
            precious: DashMap::new(),
            next_token: AtomicU64::new(1),
            frames: Mutex::new(Vec::new()),
            stashed_trace: Mutex::new(None),
            warning_length: AtomicUsize::new(DEFAULT_WARNING_LENGTH),
            interrupt: AtomicBool::new(false),
        })
    }

    // ========================================================================
    // Threading
    // ========================================================================

    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    pub fn ensure_main_thread(&self) -> HostResult<()> {
        if self.is_main_thread() {
            Ok(())
        } else {
            Err(HostError::WrongThread)
        }
    }

    // ========================================================================
    // GC roots
    // ========================================================================

    /// Register `value` as a GC root.
    pub fn preserve(&self, value: HostValue) -> HostResult<PreciousToken> {
        self.ensure_main_thread()?;
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.precious.insert(id, value);
        Ok(PreciousToken(id))
    }

    /// Drop a GC root. Returns `false` if the token was already released.
    pub fn release(&self, token: PreciousToken) -> HostResult<bool> {
        self.ensure_main_thread()?;
        Ok(self.precious.remove(&token.0).is_some())
    }

    /// The rooted value behind `token`.
    pub fn preserved(&self, token: PreciousToken) -> Option<HostValue> {
        self.precious.get(&token.0).map(|v| v.value().clone())
    }

    pub fn is_preserved(&self, token: PreciousToken) -> bool {
        self.precious.contains_key(&token.0)
    }

    pub fn precious_count(&self) -> usize {
        self.precious.len()
    }

    // ========================================================================
    // Call frames and backtraces
    // ========================================================================

    /// Run `f` with `call` pushed as the innermost frame.
    pub fn with_call<R>(&self, call: &str, f: impl FnOnce() -> R) -> R {
        self.frames.lock().push(call.to_owned());
        let result = f();
        self.frames.lock().pop();
        result
    }

    /// Innermost call expression, or `Null` at top level.
    pub fn current_call(&self) -> HostValue {
        match self.frames.lock().last() {
            Some(call) => HostValue::Language(call.clone()),
            None => HostValue::Null,
        }
    }

    pub fn call_depth(&self) -> usize {
        self.frames.lock().len()
    }

    /// Current call stack as a character vector, outermost first.
    pub fn backtrace(&self) -> HostValue {
        let frames = self.frames.lock();
        HostValue::Character(Vector::from(
            frames
                .iter()
                .map(|f| Some(HostString::utf8(f.as_str())))
                .collect::<Vec<_>>(),
        ))
    }

    /// Capture the backtrace now so a later error can report where the
    /// foreign call was entered.
    pub fn stash_backtrace(&self) {
        let trace = self.backtrace();
        *self.stashed_trace.lock() = Some(trace);
    }

    pub fn stashed_backtrace(&self) -> Option<HostValue> {
        self.stashed_trace.lock().clone()
    }

    pub fn clear_stashed_backtrace(&self) {
        self.stashed_trace.lock().take();
    }

    // ========================================================================
    // Options
    // ========================================================================

    pub fn warning_length(&self) -> usize {
        self.warning_length.load(Ordering::Relaxed)
    }

    /// Set the message cap, clamped to [`WARNING_LENGTH_RANGE`].
    pub fn set_warning_length(&self, length: usize) {
        let (lo, hi) = WARNING_LENGTH_RANGE;
        self.warning_length
            .store(length.clamp(lo, hi), Ordering::Relaxed);
    }

    // ========================================================================
    // Interrupts
    // ========================================================================

    /// Flag a user interrupt. Safe from any thread.
    pub fn set_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn interrupt_pending(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Deliver a pending interrupt as [`HostError::Interrupted`].
    pub fn check_interrupt(&self) -> HostResult<()> {
        if self.interrupt.swap(false, Ordering::SeqCst) {
            Err(HostError::Interrupted)
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Function application
    // ========================================================================

    /// Apply a closure value. Runs on the main thread only.
    pub fn apply(&self, function: &HostValue, args: HostArgs) -> HostResult<HostValue> {
        self.ensure_main_thread()?;
        let HostValue::Closure(closure) = function else {
            return Err(HostError::Stop(format!(
                "attempt to apply non-function of type '{}'",
                function.type_name()
            )));
        };
        self.check_interrupt()?;
        let call = format!("{}(...)", closure.name);
        let func = closure.func.clone();
        self.with_call(&call, || func(self, args))
    }
}
