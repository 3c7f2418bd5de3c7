//! Interrupt forwarding
//!
//! A host interrupt raised inside a guest-initiated callback surfaces in the
//! guest as `KeyboardInterrupt`. The guest may catch and swallow that
//! exception, so the bridge also remembers that an interrupt was forwarded;
//! the next [`Bridge::fetch_error`](crate::Bridge::fetch_error) then unwinds
//! straight to the host top level.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct Signals {
    forwarded: AtomicBool,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a host interrupt was handed to the guest.
    pub fn mark_forwarded(&self) {
        self.forwarded.store(true, Ordering::SeqCst);
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarded.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take_forwarded(&self) -> bool {
        self.forwarded.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_flag_taken_once() {
        let signals = Signals::new();
        assert!(!signals.take_forwarded());
        signals.mark_forwarded();
        assert!(signals.is_forwarded());
        assert!(signals.take_forwarded());
        assert!(!signals.is_forwarded());
    }
}
