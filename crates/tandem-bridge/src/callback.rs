//! Guest → Host call protocol
//!
//! The bridge registers a guest module, `tandem_call`, with three entry
//! points:
//!
//! ```text
//! invoke_host_function(capsule, *args, **kwargs)  -> (value, None) | (None, exception)
//! invoke_host_function_on_main_thread(fn, data)   -> None, fn(data) runs later on main
//! make_host_function(capsule, name)               -> callable HostFunction instance
//! ```
//!
//! `invoke_host_function` never raises: a host failure comes back as the
//! second tuple element. `HostFunction.__call__` unpacks the tuple and
//! re-raises. Called off the main thread it hands the whole invocation to
//! the dispatcher and waits for the outcome with the execution lock
//! released.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel;
use tandem_guest::{expect_arg, GuestResult, Interpreter, ObjectId, Raised};
use tandem_host::{HostArgs, HostError};

use crate::capsule::{capsule_convert, host_capsule_value, is_host_capsule};
use crate::error::{BridgeError, BridgeResult};
use crate::handle::{GuestObjectRef, OwnedRef};
use crate::Bridge;

/// Name of the guest module carrying the call protocol.
pub const CALL_MODULE: &str = "tandem_call";

/// Guest exception raised for host failures inside callbacks.
pub const HOST_ERROR_TYPE: &str = "HostError";

/// Guest class wrapping a host function capsule.
pub const HOST_FUNCTION_TYPE: &str = "HostFunction";

/// Attribute of a `HostFunction` holding its capsule.
const CAPSULE_ATTR: &str = "capsule";

// ============================================================================
// Module installation
// ============================================================================

impl Bridge {
    pub(crate) fn install_call_module(self: &Arc<Self>) -> BridgeResult<()> {
        let interp = &*self.interp;
        let b = interp.builtins();
        let module = OwnedRef::new(interp, interp.new_module(CALL_MODULE));

        let host_error = OwnedRef::from_result(
            interp,
            interp.new_type(HOST_ERROR_TYPE, CALL_MODULE, &[b.exception]),
        )
        .map_err(|_| self.fetch_error(false))?;
        let host_function = OwnedRef::from_result(
            interp,
            interp.new_type(HOST_FUNCTION_TYPE, CALL_MODULE, &[]),
        )
        .map_err(|_| self.fetch_error(false))?;

        let bridge = Arc::downgrade(self);
        let call = OwnedRef::new(
            interp,
            interp.new_native_function("__call__", move |interp, args, kwargs| {
                let receiver = expect_arg(interp, args, 0, "__call__")?;
                let Some(bridge) = bridge.upgrade() else {
                    return Err(raise_disconnected(interp));
                };
                bridge.call_host_function(receiver, &args[1..], kwargs)
            }),
        );

        let bridge = Arc::downgrade(self);
        let invoke = OwnedRef::new(
            interp,
            interp.new_native_function("invoke_host_function", move |interp, args, kwargs| {
                match bridge.upgrade() {
                    Some(bridge) => Ok(bridge.invoke_host_function(args, kwargs)),
                    None => Ok(disconnected_outcome(interp)),
                }
            }),
        );

        let bridge = Arc::downgrade(self);
        let on_main = OwnedRef::new(
            interp,
            interp.new_native_function(
                "invoke_host_function_on_main_thread",
                move |interp, args, _kwargs| {
                    let func = expect_arg(interp, args, 0, "invoke_host_function_on_main_thread")?;
                    let data = args.get(1).copied().unwrap_or_else(|| interp.none());
                    let Some(bridge) = bridge.upgrade() else {
                        return Err(raise_disconnected(interp));
                    };
                    bridge
                        .schedule_guest_call(func, data)
                        .map_err(|e| interp.raise(interp.builtins().runtime_error, &e.to_string()))?;
                    let none = interp.none();
                    interp.inc_ref(none);
                    Ok(none)
                },
            ),
        );

        let bridge = Arc::downgrade(self);
        let make = OwnedRef::new(
            interp,
            interp.new_native_function("make_host_function", move |interp, args, _kwargs| {
                let capsule = expect_arg(interp, args, 0, "make_host_function")?;
                let name = match args.get(1) {
                    Some(&n) => interp.str_of(n)?,
                    None => "host_function".to_owned(),
                };
                if !is_host_capsule(interp, capsule) {
                    return Err(interp.raise(
                        interp.builtins().type_error,
                        "make_host_function() expects a host object capsule",
                    ));
                }
                let Some(bridge) = bridge.upgrade() else {
                    return Err(raise_disconnected(interp));
                };
                bridge
                    .new_host_function(capsule, &name)
                    .map(OwnedRef::detach)
                    .map_err(|e| interp.raise(interp.builtins().runtime_error, &e.to_string()))
            }),
        );

        let attrs = [
            (host_function.id(), "__call__", call.id()),
            (module.id(), HOST_ERROR_TYPE, host_error.id()),
            (module.id(), HOST_FUNCTION_TYPE, host_function.id()),
            (module.id(), "invoke_host_function", invoke.id()),
            (module.id(), "invoke_host_function_on_main_thread", on_main.id()),
            (module.id(), "make_host_function", make.id()),
        ];
        for (target, name, value) in attrs {
            interp
                .set_attr(target, name, value)
                .map_err(|_| self.fetch_error(false))?;
        }
        interp.register_module(CALL_MODULE, module.id());

        if let Err(previous) = self.host_error_type.set(host_error.detach()) {
            interp.dec_ref(previous);
        }
        if let Err(previous) = self.host_function_type.set(host_function.detach()) {
            interp.dec_ref(previous);
        }
        Ok(())
    }

    // ========================================================================
    // Host function wrappers
    // ========================================================================

    /// New `HostFunction` wrapping a host closure capsule. Borrows `capsule`.
    pub(crate) fn new_host_function(&self, capsule: ObjectId, name: &str) -> BridgeResult<OwnedRef<'_>> {
        let interp = &*self.interp;
        let Some(&class) = self.host_function_type.get() else {
            return Err(BridgeError::InvalidCapsule(format!(
                "{} module is not installed",
                CALL_MODULE
            )));
        };
        let function = OwnedRef::new(interp, interp.new_instance(class));
        let name = OwnedRef::new(interp, interp.new_str(name));
        interp
            .set_attr(function.id(), CAPSULE_ATTR, capsule)
            .and_then(|_| interp.set_attr(function.id(), "__name__", name.id()))
            .map_err(|_| self.fetch_error(false))?;
        Ok(function)
    }

    /// The capsule inside a `HostFunction` instance, if `obj` is one.
    pub(crate) fn host_function_capsule(&self, obj: ObjectId) -> Option<OwnedRef<'_>> {
        let interp = &*self.interp;
        let class = *self.host_function_type.get()?;
        if !interp.is_kind(obj, class) {
            return None;
        }
        match interp.get_attr(obj, CAPSULE_ATTR) {
            Ok(capsule) => Some(OwnedRef::new(interp, capsule)),
            Err(_) => {
                interp.err_clear();
                None
            }
        }
    }

    /// `HostFunction.__call__`: invoke and re-raise a returned exception.
    fn call_host_function(
        &self,
        receiver: ObjectId,
        args: &[ObjectId],
        kwargs: &[(String, ObjectId)],
    ) -> GuestResult<ObjectId> {
        let interp = &*self.interp;
        let Some(capsule) = self.host_function_capsule(receiver) else {
            return Err(interp.raise(
                interp.builtins().type_error,
                "HostFunction has no host object capsule",
            ));
        };
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(capsule.id());
        full.extend_from_slice(args);

        let outcome = if self.session.is_main_thread() {
            self.invoke_host_function(&full, kwargs)
        } else {
            self.invoke_from_worker(&full, kwargs)?
        };
        unpack_outcome(interp, outcome)
    }

    // ========================================================================
    // invoke_host_function
    // ========================================================================

    /// Run the host closure in `args[0]` and return a new `(value, exception)`
    /// tuple. Never raises.
    pub(crate) fn invoke_host_function(&self, args: &[ObjectId], kwargs: &[(String, ObjectId)]) -> ObjectId {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        match self.try_invoke_host_function(args, kwargs) {
            Ok(value) => {
                let none = interp.none();
                interp.inc_ref(none);
                interp.new_tuple(vec![value, none])
            }
            Err(err) => {
                let exception = self.error_to_guest(err);
                let none = interp.none();
                interp.inc_ref(none);
                interp.new_tuple(vec![none, exception])
            }
        }
    }

    fn try_invoke_host_function(
        &self,
        args: &[ObjectId],
        kwargs: &[(String, ObjectId)],
    ) -> BridgeResult<ObjectId> {
        let interp = &*self.interp;
        let _depth = self.enter_callback()?;

        let Some((&capsule, rest)) = args.split_first() else {
            return Err(BridgeError::InvalidCapsule(
                "invoke_host_function() requires a host function capsule".into(),
            ));
        };
        let convert = capsule_convert(interp, capsule);
        let function = host_capsule_value(interp, capsule)?;

        let positional = rest
            .iter()
            .map(|&a| self.to_host(a, convert))
            .collect::<BridgeResult<Vec<_>>>()?;
        let named = kwargs
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.to_host(*v, convert)?)))
            .collect::<BridgeResult<Vec<_>>>()?;

        self.session.ensure_main_thread()?;
        let result = self.session.apply(&function, HostArgs { positional, named })?;
        Ok(self.to_guest(&result, convert)?.detach())
    }

    fn enter_callback(&self) -> BridgeResult<CallbackDepth<'_>> {
        let depth = self.callback_depth.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = CallbackDepth(&self.callback_depth);
        if depth > self.config.max_callback_depth {
            return Err(BridgeError::Host(HostError::Stop(format!(
                "host callbacks nested deeper than {}",
                self.config.max_callback_depth
            ))));
        }
        Ok(guard)
    }

    /// The guest exception a failed callback raises. Returns a new reference.
    fn error_to_guest(&self, err: BridgeError) -> ObjectId {
        let interp = &*self.interp;
        let b = interp.builtins();

        if matches!(err, BridgeError::Interrupted | BridgeError::Host(HostError::Interrupted)) {
            self.signals.mark_forwarded();
            return new_exception_or_fallback(interp, b.keyboard_interrupt, "");
        }

        // a guest exception that crossed into the host goes back unchanged
        let original = err
            .condition()
            .and_then(|c| c.payload.as_ref())
            .and_then(|p| p.downcast::<GuestObjectRef>());
        if let Some(original) = original {
            if let Ok(exception) = self.unwrap_handle(original) {
                return exception.detach();
            }
        }

        let class = self.host_error_type.get().copied().unwrap_or(b.runtime_error);
        let exception = new_exception_or_fallback(interp, class, &err.to_string());
        if let Some(condition) = err.condition() {
            self.attach_host_value(exception, "call", condition.call.clone());
            self.attach_host_value(exception, "trace", condition.trace.clone());
        }
        exception
    }

    // ========================================================================
    // Worker threads
    // ========================================================================

    /// Run the invocation on the main thread and wait for its outcome tuple.
    fn invoke_from_worker(&self, args: &[ObjectId], kwargs: &[(String, ObjectId)]) -> GuestResult<ObjectId> {
        let interp = &*self.interp;
        let hold = |id: ObjectId| GuestObjectRef::new(&self.interp, OwnedRef::borrowed(interp, id), false);
        let args: Vec<GuestObjectRef> = args.iter().map(|&a| hold(a)).collect();
        let kwargs: Vec<(String, GuestObjectRef)> =
            kwargs.iter().map(|(k, v)| (k.clone(), hold(*v))).collect();

        let (tx, rx) = channel::bounded::<GuestObjectRef>(1);
        let bridge = self.me.clone();
        let submitted = self.dispatcher.submit(
            interp,
            Box::new(move |interp| {
                let Some(bridge) = bridge.upgrade() else {
                    return Ok(());
                };
                let ids: Vec<ObjectId> = args.iter().map(GuestObjectRef::id).collect();
                let kw: Vec<(String, ObjectId)> =
                    kwargs.iter().map(|(k, v)| (k.clone(), v.id())).collect();
                let outcome = bridge.invoke_host_function(&ids, &kw);
                let outcome = GuestObjectRef::new(&bridge.interp, OwnedRef::new(interp, outcome), false);
                if tx.send(outcome).is_err() {
                    tracing::debug!("host call outcome dropped: caller stopped waiting");
                }
                Ok(())
            }),
        );
        if let Err(e) = submitted {
            return Err(interp.raise(interp.builtins().runtime_error, &e.to_string()));
        }

        match interp.gil().allow_threads(|| rx.recv()) {
            Ok(outcome) => Ok(outcome.new_ref(interp).detach()),
            Err(_) => Err(interp.raise(
                interp.builtins().runtime_error,
                "host function call was dropped before it ran",
            )),
        }
    }

    /// Queue `func(data)` (or `func()` when `data` is None) for the main
    /// thread. Borrows both.
    pub fn schedule_guest_call(&self, func: ObjectId, data: ObjectId) -> BridgeResult<()> {
        let interp = &*self.interp;
        let func = GuestObjectRef::new(&self.interp, OwnedRef::borrowed(interp, func), false);
        let data = GuestObjectRef::new(&self.interp, OwnedRef::borrowed(interp, data), false);
        self.dispatcher.submit(
            interp,
            Box::new(move |interp| {
                let args: Vec<ObjectId> = if interp.is_none(data.id()) {
                    Vec::new()
                } else {
                    vec![data.id()]
                };
                let result = interp.call(func.id(), &args, &[])?;
                interp.dec_ref(result);
                Ok(())
            }),
        )
    }
}

/// Decrements the callback depth when the callback returns.
struct CallbackDepth<'a>(&'a AtomicUsize);

impl Drop for CallbackDepth<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Value of an outcome tuple, or its exception raised. Consumes `outcome`.
fn unpack_outcome(interp: &Interpreter, outcome: ObjectId) -> GuestResult<ObjectId> {
    let outcome = OwnedRef::new(interp, outcome);
    match interp.tuple_items(outcome.id()).as_deref() {
        Some(&[_, exception]) if !interp.is_none(exception) => Err(interp.raise_object(exception)),
        Some(&[value, _]) => {
            interp.inc_ref(value);
            Ok(value)
        }
        _ => Err(interp.raise(
            interp.builtins().type_error,
            "host call outcome must be a (value, exception) tuple",
        )),
    }
}

/// New exception instance, degrading to `RuntimeError` and finally to the
/// class object itself when instantiation fails.
fn new_exception_or_fallback(interp: &Interpreter, class: ObjectId, message: &str) -> ObjectId {
    if let Ok(exception) = interp.new_exception(class, message) {
        return exception;
    }
    interp.err_clear();
    let runtime_error = interp.builtins().runtime_error;
    if let Ok(exception) = interp.new_exception(runtime_error, message) {
        return exception;
    }
    interp.err_clear();
    interp.inc_ref(class);
    class
}

fn raise_disconnected(interp: &Interpreter) -> Raised {
    interp.raise(interp.builtins().runtime_error, &BridgeError::Disconnected.to_string())
}

fn disconnected_outcome(interp: &Interpreter) -> ObjectId {
    let exception = new_exception_or_fallback(
        interp,
        interp.builtins().runtime_error,
        &BridgeError::Disconnected.to_string(),
    );
    let none = interp.none();
    interp.inc_ref(none);
    interp.new_tuple(vec![none, exception])
}
