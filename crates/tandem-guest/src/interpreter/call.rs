//! Calling, pending calls and interrupts

use std::sync::atomic::Ordering;

use rustc_hash::FxHashMap;

use super::Interpreter;
use crate::error::{GuestResult, Raised};
use crate::object::{Dict, NativeFn, ObjectData, ObjectId};
use crate::pending::PendingFn;

/// How a callable is dispatched.
enum Target {
    Native(String, NativeFn),
    Bound(ObjectId, ObjectId),
    Construct(ObjectId),
    CallMethod(ObjectId),
    NotCallable,
}

impl Interpreter {
    /// True for functions, bound methods, types and instances whose class
    /// defines `__call__`.
    pub fn is_callable(&self, id: ObjectId) -> bool {
        let direct = self
            .with_object(id, |d| {
                matches!(
                    d,
                    ObjectData::NativeFunction(_) | ObjectData::Method { .. } | ObjectData::Type(_)
                )
            })
            .unwrap_or(false);
        direct || self.type_has_attr(self.type_of(id), "__call__")
    }

    fn resolve_target(&self, callable: ObjectId) -> Target {
        let direct = self.with_object(callable, |d| match d {
            ObjectData::NativeFunction(f) => Some(Target::Native(f.name.clone(), f.func.clone())),
            ObjectData::Method { func, receiver } => Some(Target::Bound(*func, *receiver)),
            ObjectData::Type(_) => Some(Target::Construct(callable)),
            _ => None,
        });
        if let Some(Some(target)) = direct {
            return target;
        }
        if self.type_has_attr(self.type_of(callable), "__call__") {
            Target::CallMethod(callable)
        } else {
            Target::NotCallable
        }
    }

    /// Call `callable` with borrowed positional and keyword arguments.
    /// Returns a new reference.
    ///
    /// On the main thread, pending calls and interrupts are serviced first.
    pub fn call(
        &self,
        callable: ObjectId,
        args: &[ObjectId],
        kwargs: &[(String, ObjectId)],
    ) -> GuestResult<ObjectId> {
        if self.is_main_thread() {
            if self.interrupt.swap(false, Ordering::SeqCst) {
                return Err(self.raise(self.builtins.keyboard_interrupt, ""));
            }
            self.make_pending_calls()?;
        }
        self.calls.fetch_add(1, Ordering::Relaxed);

        match self.resolve_target(callable) {
            Target::Native(name, func) => {
                self.threads.push_frame(&name);
                let result = func(self, args, kwargs);
                self.threads.pop_frame();
                if result.is_err() {
                    self.add_traceback_frame(&name);
                }
                result
            }
            Target::Bound(func, receiver) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(receiver);
                full.extend_from_slice(args);
                self.call(func, &full, kwargs)
            }
            Target::Construct(ty) => self.construct(ty, args, kwargs),
            Target::CallMethod(obj) => {
                let method = self.get_attr(obj, "__call__")?;
                let result = self.call(method, args, kwargs);
                self.dec_ref(method);
                result
            }
            Target::NotCallable => {
                let name = self.type_name(self.type_of(callable));
                Err(self.raise(
                    self.builtins.type_error,
                    &format!("'{}' object is not callable", name),
                ))
            }
        }
    }

    /// Look up `name` on `obj` and call it.
    pub fn call_method(
        &self,
        obj: ObjectId,
        name: &str,
        args: &[ObjectId],
        kwargs: &[(String, ObjectId)],
    ) -> GuestResult<ObjectId> {
        let method = self.get_attr(obj, name)?;
        let result = self.call(method, args, kwargs);
        self.dec_ref(method);
        result
    }

    fn construct(
        &self,
        ty: ObjectId,
        args: &[ObjectId],
        kwargs: &[(String, ObjectId)],
    ) -> GuestResult<ObjectId> {
        let b = &self.builtins;
        if self.is_subtype(ty, b.base_exception) {
            for arg in args {
                self.inc_ref(*arg);
            }
            let args_tuple = self.new_tuple(args.to_vec());
            let exc = self.alloc(ty, ObjectData::Instance(FxHashMap::default()));
            let set = self.set_attr(exc, "args", args_tuple);
            self.dec_ref(args_tuple);
            if let Err(raised) = set {
                self.dec_ref(exc);
                return Err(raised);
            }
            return Ok(exc);
        }

        let first_items = args.first().and_then(|a| {
            self.list_items(*a)
                .or_else(|| self.tuple_items(*a))
        });
        let data = if self.is_subtype(ty, b.list) {
            let items = first_items.unwrap_or_default();
            for item in &items {
                self.inc_ref(*item);
            }
            ObjectData::List(items)
        } else if self.is_subtype(ty, b.tuple) {
            let items = first_items.unwrap_or_default();
            for item in &items {
                self.inc_ref(*item);
            }
            ObjectData::Tuple(items)
        } else if self.is_subtype(ty, b.dict) {
            let entries = args
                .first()
                .and_then(|a| self.dict_entries(*a))
                .unwrap_or_default();
            for (k, v) in &entries {
                self.inc_ref(*k);
                self.inc_ref(*v);
            }
            ObjectData::Dict(Dict { entries })
        } else if self.is_subtype(ty, b.object) && !self.is_builtin_scalar_type(ty) {
            ObjectData::Instance(FxHashMap::default())
        } else {
            let name = self.type_name(ty);
            return Err(self.raise(
                b.type_error,
                &format!("cannot create '{}' instances", name),
            ));
        };

        let obj = self.alloc(ty, data);
        if self.type_has_attr(ty, "__init__") {
            match self.call_method(obj, "__init__", args, kwargs) {
                Ok(none) => self.dec_ref(none),
                Err(raised) => {
                    self.dec_ref(obj);
                    return Err(raised);
                }
            }
        }
        Ok(obj)
    }

    fn is_builtin_scalar_type(&self, ty: ObjectId) -> bool {
        let b = &self.builtins;
        [
            b.none_type, b.int, b.float, b.complex, b.str_, b.bytes, b.bytearray, b.function,
            b.method, b.module, b.capsule, b.traceback, b.ndarray,
        ]
        .iter()
        .any(|builtin| self.is_subtype(ty, *builtin))
    }

    /// Record `frame` on the traceback of the exception currently set.
    fn add_traceback_frame(&self, frame: &str) {
        let Some(mut triple) = self.err_fetch() else {
            return;
        };
        let existing = self.with_object(triple.ptraceback, |d| match d {
            ObjectData::Traceback(frames) => Some(frames.clone()),
            _ => None,
        });
        let mut frames = existing.flatten().unwrap_or_default();
        frames.insert(0, frame.to_owned());
        let tb = self.alloc(self.builtins.traceback, ObjectData::Traceback(frames));
        self.dec_ref(triple.ptraceback);
        triple.ptraceback = tb;
        self.err_restore(Some(triple));
    }

    /// Frame names of a traceback object.
    pub fn traceback_frames(&self, tb: ObjectId) -> Vec<String> {
        self.with_object(tb, |d| match d {
            ObjectData::Traceback(frames) => frames.clone(),
            _ => Vec::new(),
        })
        .unwrap_or_default()
    }

    // ========================================================================
    // Pending calls
    // ========================================================================

    /// Schedule `call` to run on the main thread. Callable from any thread.
    ///
    /// Fails, handing the call back, when the queue is full.
    pub fn add_pending_call(&self, call: PendingFn) -> Result<(), PendingFn> {
        self.pending.push(call)
    }

    /// Number of calls waiting.
    pub fn pending_call_count(&self) -> usize {
        self.pending.len()
    }

    /// Run queued calls. Only the main thread runs them; other threads and
    /// nested invocations return `Ok(0)`.
    ///
    /// Stops at the first failing call, leaving the rest queued.
    pub fn make_pending_calls(&self) -> GuestResult<usize> {
        if !self.is_main_thread() || self.pending.is_empty() {
            return Ok(0);
        }
        if self.pending_busy.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let mut ran = 0;
        let mut outcome = Ok(());
        while let Some(call) = self.pending.pop() {
            ran += 1;
            if let Err(raised) = call(self) {
                outcome = Err(raised);
                break;
            }
        }
        self.pending_busy.store(false, Ordering::SeqCst);
        outcome.map(|_| ran)
    }

    // ========================================================================
    // Interrupts
    // ========================================================================

    /// Request a `KeyboardInterrupt` at the next call on the main thread.
    pub fn set_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn interrupt_pending(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Clear an undelivered interrupt request.
    pub fn clear_interrupt(&self) -> bool {
        self.interrupt.swap(false, Ordering::SeqCst)
    }

    /// Raise `KeyboardInterrupt` on the current thread.
    pub fn raise_interrupt(&self) -> Raised {
        self.raise(self.builtins.keyboard_interrupt, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_native_call_and_traceback() {
        let interp = Interpreter::new();
        let failing = interp.new_native_function("explode", |interp, _args, _kw| {
            Err(interp.raise(interp.builtins().value_error, "boom"))
        });
        let outer = {
            let failing = failing;
            interp.new_native_function("outer", move |interp, _args, _kw| interp.call(failing, &[], &[]))
        };
        assert!(interp.call(outer, &[], &[]).is_err());
        let err = interp.err_fetch().unwrap();
        assert_eq!(interp.traceback_frames(err.ptraceback), vec!["outer", "explode"]);
        interp.release_error(err);
    }

    #[test]
    fn test_exception_construction_sets_args() {
        let interp = Interpreter::new();
        let msg = interp.new_str("bad value");
        let exc = interp.call(interp.builtins().value_error, &[msg], &[]).unwrap();
        assert_eq!(interp.str_of(exc).unwrap(), "bad value");
        assert_eq!(interp.type_of(exc), interp.builtins().value_error);
    }

    #[test]
    fn test_not_callable() {
        let interp = Interpreter::new();
        let n = interp.new_int(4);
        assert!(!interp.is_callable(n));
        assert!(interp.call(n, &[], &[]).is_err());
        interp.err_clear();
    }

    #[test]
    fn test_pending_calls_run_on_main_thread_only() {
        let interp = Interpreter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = hits.clone();
            let interp = interp.clone();
            std::thread::spawn(move || {
                let h = hits.clone();
                assert!(interp
                    .add_pending_call(Box::new(move |_| {
                        h.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }))
                    .is_ok());
                // worker threads never drain the queue
                assert_eq!(interp.make_pending_calls().unwrap(), 0);
            })
            .join()
            .unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(interp.make_pending_calls().unwrap(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interrupt_raised_at_next_call() {
        let interp = Interpreter::new();
        let f = interp.new_native_function("noop", |interp, _a, _k| Ok(interp.none()));
        interp.set_interrupt();
        assert!(interp.call(f, &[], &[]).is_err());
        let err = interp.err_fetch().unwrap();
        assert_eq!(err.ptype, interp.builtins().keyboard_interrupt);
        interp.release_error(err);
        assert!(interp.call(f, &[], &[]).is_ok());
    }
}
