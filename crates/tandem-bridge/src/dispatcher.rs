//! Cross-thread call dispatcher
//!
//! Work that must touch host state is queued on the guest's pending-call
//! queue, which only the main thread drains. The queue is bounded, so a
//! submission can fail transiently; the dispatcher then sleeps (with the
//! execution lock released) and retries, logging a liveness warning at a
//! fixed interval and abandoning the call past a hard ceiling.
//!
//! A call runs at most once. An abandoned call is dropped, releasing
//! whatever it captured.

use std::thread;
use std::time::Instant;

use tandem_guest::{Interpreter, PendingFn};

use crate::config::DispatchConfig;
use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Clone)]
pub struct Dispatcher {
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Queue `call` for the main thread, retrying while the queue is full.
    pub fn submit(&self, interp: &Interpreter, call: PendingFn) -> BridgeResult<()> {
        let start = Instant::now();
        let mut last_warning = start;
        let mut call = call;

        loop {
            match interp.add_pending_call(call) {
                Ok(()) => return Ok(()),
                Err(rejected) => call = rejected,
            }

            let waited = start.elapsed();
            if waited >= self.config.ceiling() {
                let waited_ms = waited.as_millis() as u64;
                tracing::error!(waited_ms, "unable to schedule call on main host thread; dropping it");
                drop(call);
                return Err(BridgeError::DispatcherExhausted { waited_ms });
            }
            if last_warning.elapsed() >= self.config.warn_interval() {
                tracing::warn!(
                    waited_ms = waited.as_millis() as u64,
                    "waiting to schedule call on main host thread"
                );
                last_warning = Instant::now();
            }

            let retry = self.config.retry_interval();
            interp.gil().allow_threads(|| thread::sleep(retry));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_policy() -> DispatchConfig {
        DispatchConfig {
            retry_interval_ms: 5,
            warn_interval_ms: 10,
            ceiling_ms: 40,
        }
    }

    #[test]
    fn test_submit_enqueues_immediately() {
        let interp = Interpreter::new();
        let dispatcher = Dispatcher::new(fast_policy());
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        dispatcher
            .submit(
                &interp,
                Box::new(move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
        assert_eq!(interp.make_pending_calls().unwrap(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_full_queue_abandons_and_drops_payload() {
        let interp = Interpreter::with_pending_capacity(1);
        assert!(interp.add_pending_call(Box::new(|_| Ok(()))).is_ok());

        let dispatcher = Dispatcher::new(fast_policy());
        let dropped = Arc::new(AtomicUsize::new(0));
        let payload = DropCounter(dropped.clone());
        let result = dispatcher.submit(
            &interp,
            Box::new(move |_| {
                let _keep = &payload;
                Ok(())
            }),
        );

        assert!(matches!(result, Err(BridgeError::DispatcherExhausted { .. })));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(interp.pending_call_count(), 1);
    }

    #[test]
    fn test_retry_succeeds_once_main_thread_drains() {
        let interp = Interpreter::with_pending_capacity(1);
        assert!(interp.add_pending_call(Box::new(|_| Ok(()))).is_ok());

        let dispatcher = Dispatcher::new(DispatchConfig {
            retry_interval_ms: 5,
            warn_interval_ms: 1_000,
            ceiling_ms: 10_000,
        });
        let worker = {
            let interp = interp.clone();
            thread::spawn(move || dispatcher.submit(&interp, Box::new(|_| Ok(()))))
        };

        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        let mut drained = 0;
        while drained < 2 && Instant::now() < deadline {
            drained += interp.make_pending_calls().unwrap();
            thread::sleep(std::time::Duration::from_millis(2));
        }
        assert!(worker.join().unwrap().is_ok());
        drained += interp.make_pending_calls().unwrap();
        assert_eq!(drained, 2);
    }
}
