//! Tandem bridge
//!
//! Bidirectional value marshalling between the tandem guest interpreter and
//! the host session embedding it. A [`Bridge`] owns everything the two
//! sides share:
//!
//! - conversion in both directions ([`Bridge::guest_to_host`],
//!   [`Bridge::host_to_guest`]) with zero-copy numeric arrays
//! - translation of guest exceptions into host conditions
//!   ([`Bridge::fetch_error`])
//! - the `tandem_call` guest module through which guest code calls host
//!   closures, from any thread
//! - a dispatcher that moves host-touching work onto the main thread
//! - tabular columns and frames in both directions (see `tabular`)
//! - operations on wrapped guest objects (see `ops`)
//!
//! # Example
//!
//! ```ignore
//! use tandem_bridge::{Bridge, BridgeConfig};
//! use tandem_guest::Interpreter;
//! use tandem_host::{HostSession, HostValue};
//!
//! let bridge = Bridge::new(Interpreter::new(), HostSession::new(), BridgeConfig::default())?;
//! let list = bridge.host_to_guest(&HostValue::strings(&["a", "b"]), true)?;
//! let back = bridge.guest_to_host(list.id(), true)?;
//! ```

pub mod array;
pub mod callback;
pub mod capsule;
pub mod class_tags;
pub mod classify;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handle;
mod marshal;
pub mod ops;
pub mod signals;
pub mod symbols;
pub mod tabular;
pub mod trace_dump;
pub mod translate;

pub use class_tags::{ClassFilter, KeepAll};
pub use config::{BridgeConfig, ConfigError, DispatchConfig};
pub use dispatcher::Dispatcher;
pub use error::{BridgeError, BridgeResult};
pub use handle::{GuestObjectRef, OwnedRef};
pub use ops::AttrType;
pub use tabular::NullableKind;
pub use trace_dump::TraceDump;
pub use translate::{truncate_middle, TRUNCATION_MARKER};

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tandem_guest::{Interpreter, ObjectId};
use tandem_host::{HostError, HostSession};

use crate::signals::Signals;
use crate::symbols::SymbolCache;
use crate::translate::Translator;

/// The bridge between one guest interpreter and one host session.
pub struct Bridge {
    interp: Arc<Interpreter>,
    session: Arc<HostSession>,
    config: BridgeConfig,
    symbols: SymbolCache,
    class_filter: Box<dyn ClassFilter>,
    translator: Translator,
    dispatcher: Dispatcher,
    signals: Signals,
    /// Nesting of guest → host callbacks in progress
    callback_depth: AtomicUsize,
    /// `tandem_call.HostError`
    host_error_type: OnceCell<ObjectId>,
    /// `tandem_call.HostFunction`
    host_function_type: OnceCell<ObjectId>,
    trace_dump: Mutex<Option<TraceDump>>,
    me: Weak<Bridge>,
}

impl Bridge {
    /// Connect `interp` and `session`, keeping class tags unfiltered.
    pub fn new(
        interp: Arc<Interpreter>,
        session: Arc<HostSession>,
        config: BridgeConfig,
    ) -> BridgeResult<Arc<Self>> {
        Self::with_class_filter(interp, session, config, KeepAll)
    }

    /// Connect using the default configuration with environment overrides.
    pub fn from_env(interp: Arc<Interpreter>, session: Arc<HostSession>) -> BridgeResult<Arc<Self>> {
        Self::new(interp, session, BridgeConfig::from_env()?)
    }

    /// Connect `interp` and `session` with a custom class-tag filter.
    ///
    /// Both must share a main thread. Registers the `tandem_call` module and
    /// starts the stack logger when configured.
    pub fn with_class_filter(
        interp: Arc<Interpreter>,
        session: Arc<HostSession>,
        config: BridgeConfig,
        filter: impl ClassFilter + 'static,
    ) -> BridgeResult<Arc<Self>> {
        config.validate()?;
        if interp.main_thread() != session.main_thread() {
            return Err(BridgeError::Host(HostError::WrongThread));
        }
        let trace_interval = config.trace_dump_interval();
        let dispatcher = Dispatcher::new(config.dispatch.clone());

        let bridge = Arc::new_cyclic(|me| Bridge {
            interp,
            session,
            config,
            symbols: SymbolCache::new(),
            class_filter: Box::new(filter),
            translator: Translator::new(),
            dispatcher,
            signals: Signals::new(),
            callback_depth: AtomicUsize::new(0),
            host_error_type: OnceCell::new(),
            host_function_type: OnceCell::new(),
            trace_dump: Mutex::new(None),
            me: me.clone(),
        });

        {
            let _gil = bridge.interp.gil().acquire();
            bridge.install_call_module()?;
        }
        if let Some(interval) = trace_interval {
            match TraceDump::start(&bridge.interp, interval) {
                Ok(dump) => *bridge.trace_dump.lock() = Some(dump),
                Err(e) => tracing::warn!(error = %e, "unable to start guest trace dump"),
            }
        }
        tracing::info!(
            max_callback_depth = bridge.config.max_callback_depth,
            trace_dump = trace_interval.is_some(),
            "bridge connected"
        );
        Ok(bridge)
    }

    pub fn interpreter(&self) -> &Arc<Interpreter> {
        &self.interp
    }

    pub fn session(&self) -> &Arc<HostSession> {
        &self.session
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// True while the periodic stack logger runs.
    pub fn trace_dump_running(&self) -> bool {
        self.trace_dump.lock().as_ref().is_some_and(TraceDump::is_running)
    }

    /// Drain the pending-call queue. Main thread only.
    pub fn run_pending(&self) -> BridgeResult<usize> {
        self.session.ensure_main_thread()?;
        let _gil = self.interp.gil().acquire();
        self.interp
            .make_pending_calls()
            .map_err(|_| self.fetch_error(false))
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some(mut dump) = self.trace_dump.get_mut().take() {
            dump.stop();
        }
        self.symbols.release(&self.interp);
        for id in [self.host_error_type.take(), self.host_function_type.take()]
            .into_iter()
            .flatten()
        {
            self.interp.dec_ref(id);
        }
        tracing::debug!("bridge disconnected");
    }
}
