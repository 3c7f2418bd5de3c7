//! Periodic guest stack logger
//!
//! Enabled with `TANDEM_TRACE_DUMP_MS` (or `trace_dump_interval_ms`). A
//! background thread wakes at the configured interval, takes the execution
//! lock and logs the call stack of every thread the guest knows about.
//! Useful for finding where a hung session is stuck.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tandem_guest::Interpreter;

/// Longest single sleep, bounding how long `stop` waits.
const POLL_STEP: Duration = Duration::from_millis(10);

/// Background stack logger
pub struct TraceDump {
    interp: Weak<Interpreter>,
    interval: Duration,
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl TraceDump {
    /// Spawn the logger thread.
    pub fn start(interp: &Arc<Interpreter>, interval: Duration) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(interp);
        let handle = {
            let shutdown = shutdown.clone();
            let weak = weak.clone();
            thread::Builder::new()
                .name("tandem-trace-dump".to_string())
                .spawn(move || Self::dump_loop(weak, interval, shutdown))?
        };
        tracing::info!(interval_ms = interval.as_millis() as u64, "guest trace dump started");
        Ok(Self {
            interp: weak,
            interval,
            handle: Some(handle),
            shutdown,
        })
    }

    fn dump_loop(interp: Weak<Interpreter>, interval: Duration, shutdown: Arc<AtomicBool>) {
        loop {
            let wake = Instant::now() + interval;
            while Instant::now() < wake {
                if shutdown.load(Ordering::Acquire) {
                    return;
                }
                thread::sleep(POLL_STEP.min(wake.saturating_duration_since(Instant::now())));
            }
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            let Some(interp) = interp.upgrade() else {
                return;
            };
            let _gil = interp.gil().acquire();
            dump_stacks(&interp);
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.shutdown.load(Ordering::Acquire)
    }

    /// Stop and join the logger thread.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return;
        };
        // the logger may be blocked on the execution lock held by this thread
        let joined = match self.interp.upgrade() {
            Some(interp) => interp.gil().allow_threads(|| handle.join()),
            None => handle.join(),
        };
        if joined.is_err() {
            tracing::error!("guest trace dump thread panicked");
        }
    }
}

impl Drop for TraceDump {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Log every known thread's guest call stack, innermost frame last.
pub fn dump_stacks(interp: &Interpreter) {
    for stack in interp.thread_stacks() {
        let name = stack.name.as_deref().unwrap_or("<unnamed>");
        tracing::info!(
            target: "tandem::trace_dump",
            thread = ?stack.thread,
            name,
            depth = stack.frames.len(),
            "guest stack"
        );
        for (level, frame) in stack.frames.iter().enumerate() {
            tracing::info!(target: "tandem::trace_dump", level, frame = %frame, "  at");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_and_stop() {
        let interp = Interpreter::new();
        let mut dump = TraceDump::start(&interp, Duration::from_millis(5)).unwrap();
        assert!(dump.is_running());
        thread::sleep(Duration::from_millis(20));
        dump.stop();
        assert!(!dump.is_running());
    }

    #[test]
    fn test_stop_while_holding_execution_lock() {
        let interp = Interpreter::new();
        let dump = TraceDump::start(&interp, Duration::from_millis(1)).unwrap();
        let _gil = interp.gil().acquire();
        thread::sleep(Duration::from_millis(10));
        drop(dump);
    }

    #[test]
    fn test_exits_when_interpreter_dropped() {
        let interp = Interpreter::new();
        let mut dump = TraceDump::start(&interp, Duration::from_millis(1)).unwrap();
        drop(interp);
        thread::sleep(Duration::from_millis(10));
        dump.stop();
    }
}
