//! Guest object operations
//!
//! The host-facing surface over wrapped guest objects: calls, attribute and
//! item access, protocol queries, container construction and iteration.
//! Every operation takes the execution lock, resolves the wrapper back to
//! its guest object and converts results with the wrapper's own `convert`
//! flag.

use tandem_guest::{CompareOp, ErrorTriple, Interpreter, ObjectId};
use tandem_host::{HostArgs, HostError, HostValue};

use crate::capsule::new_host_capsule;
use crate::error::{BridgeError, BridgeResult};
use crate::handle::{GuestObjectRef, OwnedRef};
use crate::marshal::guest_handle;
use crate::Bridge;

/// Saves the pending guest exception and puts it back on drop, so a lookup
/// that fails and clears its own error leaves the caller's state intact.
pub struct ErrorStateGuard<'a> {
    interp: &'a Interpreter,
    saved: Option<ErrorTriple>,
}

impl<'a> ErrorStateGuard<'a> {
    pub fn new(interp: &'a Interpreter) -> Self {
        Self {
            interp,
            saved: interp.err_fetch(),
        }
    }
}

impl Drop for ErrorStateGuard<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.interp.err_restore(Some(saved));
        }
    }
}

/// Parse a host comparison operator.
pub fn compare_op(op: &str) -> BridgeResult<CompareOp> {
    Ok(match op {
        "<" => CompareOp::Lt,
        "<=" => CompareOp::Le,
        "==" => CompareOp::Eq,
        "!=" => CompareOp::Ne,
        ">" => CompareOp::Gt,
        ">=" => CompareOp::Ge,
        other => {
            return Err(BridgeError::Host(HostError::Stop(format!(
                "Unexpected comparison operation {}",
                other
            ))))
        }
    })
}

/// Coarse host-side shape of an attribute, as reported by
/// [`Bridge::attr_types`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AttrType {
    Unknown = 0,
    Vector = 1,
    Array = 2,
    List = 4,
    Environment = 5,
    Function = 6,
}

impl Bridge {
    /// The guest object behind `value` and its conversion flag.
    fn guest_target(&self, value: &HostValue) -> BridgeResult<(OwnedRef<'_>, bool)> {
        let Some(handle) = guest_handle(value) else {
            return Err(BridgeError::UnsupportedHostValue(format!(
                "{} is not a guest object",
                value.type_name()
            )));
        };
        Ok((self.unwrap_handle(handle)?, handle.convert()))
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call a wrapped guest callable with host arguments.
    pub fn call_guest(&self, callable: &HostValue, args: HostArgs) -> BridgeResult<HostValue> {
        let Some(handle) = guest_handle(callable) else {
            return Err(BridgeError::UnsupportedHostValue(format!(
                "{} is not a guest callable",
                callable.type_name()
            )));
        };
        self.call_guest_object(handle, args)
    }

    /// Call `target`, converting arguments and result with its flag. A
    /// failure reuses the backtrace stashed on entry.
    pub(crate) fn call_guest_object(&self, target: &GuestObjectRef, args: HostArgs) -> BridgeResult<HostValue> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let callee = self.unwrap_handle(target)?;
        let convert = target.convert();

        let positional = args
            .positional
            .iter()
            .map(|a| self.to_guest(a, convert))
            .collect::<BridgeResult<Vec<_>>>()?;
        let named = args
            .named
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.to_guest(v, convert)?)))
            .collect::<BridgeResult<Vec<_>>>()?;
        let ids: Vec<ObjectId> = positional.iter().map(OwnedRef::id).collect();
        let kwargs: Vec<(String, ObjectId)> =
            named.iter().map(|(k, v)| (k.clone(), v.id())).collect();

        self.session.stash_backtrace();
        let result = OwnedRef::from_result(interp, interp.call(callee.id(), &ids, &kwargs))
            .map_err(|_| self.fetch_error(true))?;
        self.to_host(result.id(), convert)
    }

    // ========================================================================
    // Attributes and items
    // ========================================================================

    /// `getattr(obj, name)`. With `silent`, a failed lookup yields `Null`
    /// and leaves the guest error state as it was.
    pub fn get_attr(&self, obj: &HostValue, name: &str, silent: bool) -> BridgeResult<HostValue> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, convert) = self.guest_target(obj)?;

        if silent {
            let _saved = ErrorStateGuard::new(interp);
            return match interp.get_attr(target.id(), name) {
                Ok(value) => {
                    let value = OwnedRef::new(interp, value);
                    self.to_host(value.id(), convert)
                }
                Err(_) => {
                    interp.err_clear();
                    Ok(HostValue::Null)
                }
            };
        }
        let value = OwnedRef::from_result(interp, interp.get_attr(target.id(), name))
            .map_err(|_| self.fetch_error(false))?;
        self.to_host(value.id(), convert)
    }

    /// `obj[key]`. With `silent`, a failed lookup yields `Null`.
    pub fn get_item(&self, obj: &HostValue, key: &HostValue, silent: bool) -> BridgeResult<HostValue> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, convert) = self.guest_target(obj)?;
        let key = self.to_guest(key, true)?;

        if silent {
            let _saved = ErrorStateGuard::new(interp);
            return match interp.get_item(target.id(), key.id()) {
                Ok(value) => {
                    let value = OwnedRef::new(interp, value);
                    self.to_host(value.id(), convert)
                }
                Err(_) => {
                    interp.err_clear();
                    Ok(HostValue::Null)
                }
            };
        }
        let value = OwnedRef::from_result(interp, interp.get_item(target.id(), key.id()))
            .map_err(|_| self.fetch_error(false))?;
        self.to_host(value.id(), convert)
    }

    pub fn set_attr(&self, obj: &HostValue, name: &str, value: &HostValue) -> BridgeResult<()> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, convert) = self.guest_target(obj)?;
        let value = self.to_guest(value, convert)?;
        interp
            .set_attr(target.id(), name, value.id())
            .map_err(|_| self.fetch_error(false))
    }

    pub fn set_item(&self, obj: &HostValue, key: &HostValue, value: &HostValue) -> BridgeResult<()> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, convert) = self.guest_target(obj)?;
        let key = self.to_guest(key, true)?;
        let value = self.to_guest(value, convert)?;
        interp
            .set_item(target.id(), key.id(), value.id())
            .map_err(|_| self.fetch_error(false))
    }

    pub fn has_attr(&self, obj: &HostValue, name: &str) -> BridgeResult<bool> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, _) = self.guest_target(obj)?;
        let _saved = ErrorStateGuard::new(interp);
        Ok(interp.has_attr(target.id(), name))
    }

    /// `delattr(obj, name)`.
    pub fn del_attr(&self, obj: &HostValue, name: &str) -> BridgeResult<()> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, _) = self.guest_target(obj)?;
        interp
            .del_attr(target.id(), name)
            .map_err(|_| self.fetch_error(false))
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// `dir(obj)`, sorted.
    pub fn list_attributes(&self, obj: &HostValue) -> BridgeResult<Vec<String>> {
        let _gil = self.interp.gil().acquire();
        let (target, _) = self.guest_target(obj)?;
        Ok(self.interp.dir(target.id()))
    }

    /// Shape of each named attribute. Without `resolve_properties`,
    /// properties are reported as `Unknown` and their getters never run.
    /// Failed lookups are `Unknown` and leave the guest error state as it
    /// was.
    pub fn attr_types(
        &self,
        obj: &HostValue,
        names: &[&str],
        resolve_properties: bool,
    ) -> BridgeResult<Vec<AttrType>> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, _) = self.guest_target(obj)?;
        let _saved = ErrorStateGuard::new(interp);
        let ty = interp.type_of(target.id());

        Ok(names
            .iter()
            .map(|name| {
                if !resolve_properties && interp.type_attr_is_property(ty, name) {
                    return AttrType::Unknown;
                }
                match interp.get_attr(target.id(), name) {
                    Ok(value) => {
                        let value = OwnedRef::new(interp, value);
                        attr_type(interp, value.id())
                    }
                    Err(_) => {
                        interp.err_clear();
                        AttrType::Unknown
                    }
                }
            })
            .collect())
    }

    /// True if `name` is a bound method of `obj`. A wrapper whose
    /// interpreter is gone has no methods.
    pub fn has_method(&self, obj: &HostValue, name: &str) -> BridgeResult<bool> {
        if self.is_null_xptr(obj) {
            return Ok(false);
        }
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, _) = self.guest_target(obj)?;
        let _saved = ErrorStateGuard::new(interp);
        match interp.get_attr(target.id(), name) {
            Ok(attr) => {
                let attr = OwnedRef::new(interp, attr);
                Ok(interp.type_of(attr.id()) == interp.builtins().method)
            }
            Err(_) => {
                interp.err_clear();
                Ok(false)
            }
        }
    }

    /// Identity token of the wrapped object, stable while it lives.
    pub fn id(&self, obj: &HostValue) -> BridgeResult<Option<String>> {
        if self.is_null_xptr(obj) {
            return Ok(None);
        }
        let _gil = self.interp.gil().acquire();
        let (target, _) = self.guest_target(obj)?;
        Ok(Some(self.interp.object_id(target.id()).to_string()))
    }

    // ========================================================================
    // Dicts
    // ========================================================================

    /// Keys of a dict, or of anything with a `keys()` method, converted
    /// with the wrapper's flag.
    pub fn dict_keys(&self, obj: &HostValue) -> BridgeResult<HostValue> {
        let _gil = self.interp.gil().acquire();
        let (target, convert) = self.guest_target(obj)?;
        let keys = self.keys_of(target.id())?;
        self.to_host(keys.id(), convert)
    }

    /// Keys as strings; keys that are not strings go through `str()`.
    pub fn dict_keys_as_str(&self, obj: &HostValue) -> BridgeResult<Vec<String>> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, _) = self.guest_target(obj)?;
        let keys = self.keys_of(target.id())?;
        let iter = OwnedRef::from_result(interp, interp.get_iter(keys.id()))
            .map_err(|_| self.fetch_error(false))?;

        let mut out = Vec::new();
        loop {
            let key = match interp.iter_next(iter.id()) {
                Ok(Some(key)) => OwnedRef::new(interp, key),
                Ok(None) => break,
                Err(_) => return Err(self.fetch_error(false)),
            };
            out.push(interp.str_of(key.id()).map_err(|_| self.fetch_error(false))?);
        }
        Ok(out)
    }

    /// Entry count of a dict; `len()` of anything else.
    pub fn dict_len(&self, obj: &HostValue) -> BridgeResult<usize> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, _) = self.guest_target(obj)?;
        if let Some(entries) = interp.dict_entries(target.id()) {
            return Ok(entries.len());
        }
        interp.len(target.id()).map_err(|_| self.fetch_error(false))
    }

    fn keys_of(&self, obj: ObjectId) -> BridgeResult<OwnedRef<'_>> {
        let interp = &*self.interp;
        if let Some(entries) = interp.dict_entries(obj) {
            let keys = entries
                .into_iter()
                .map(|(key, _)| {
                    interp.inc_ref(key);
                    key
                })
                .collect();
            return Ok(OwnedRef::new(interp, interp.new_list(keys)));
        }
        OwnedRef::from_result(interp, interp.call_method(obj, "keys", &[], &[]))
            .map_err(|_| self.fetch_error(false))
    }

    // ========================================================================
    // Modules
    // ========================================================================

    /// Import a guest module, wrapped with `convert`.
    pub fn import_module(&self, name: &str, convert: bool) -> BridgeResult<HostValue> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let module = OwnedRef::from_result(interp, interp.import(name))
            .map_err(|_| self.fetch_error(false))?;
        self.wrap_opaque(module.id(), convert, None)
    }

    // ========================================================================
    // Protocols
    // ========================================================================

    /// `len(obj)`, or `default` for objects without a length.
    pub fn len(&self, obj: &HostValue, default: Option<usize>) -> BridgeResult<usize> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, _) = self.guest_target(obj)?;
        match (interp.len(target.id()), default) {
            (Ok(n), _) => Ok(n),
            (Err(_), Some(default)) => {
                interp.err_clear();
                Ok(default)
            }
            (Err(_), None) => Err(self.fetch_error(false)),
        }
    }

    pub fn truthy(&self, obj: &HostValue) -> BridgeResult<bool> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, _) = self.guest_target(obj)?;
        interp.is_true(target.id()).map_err(|_| self.fetch_error(false))
    }

    pub fn str(&self, obj: &HostValue) -> BridgeResult<String> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, _) = self.guest_target(obj)?;
        interp.str_of(target.id()).map_err(|_| self.fetch_error(false))
    }

    pub fn repr(&self, obj: &HostValue) -> BridgeResult<String> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, _) = self.guest_target(obj)?;
        interp.repr_of(target.id()).map_err(|_| self.fetch_error(false))
    }

    /// Rich comparison; `op` is one of `< <= == != > >=`. `other` may be
    /// any host value.
    pub fn compare(&self, obj: &HostValue, other: &HostValue, op: &str) -> BridgeResult<bool> {
        let op = compare_op(op)?;
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, _) = self.guest_target(obj)?;
        let other = self.to_guest(other, true)?;
        interp
            .rich_compare(target.id(), other.id(), op)
            .map_err(|_| self.fetch_error(false))
    }

    // ========================================================================
    // Construction
    // ========================================================================

    /// New guest dict, wrapped. A repeated key keeps the last value.
    pub fn dict_new(&self, keys: &[HostValue], values: &[HostValue], convert: bool) -> BridgeResult<HostValue> {
        if keys.len() != values.len() {
            return Err(BridgeError::Host(HostError::Stop(format!(
                "dict_new(): {} keys but {} values",
                keys.len(),
                values.len()
            ))));
        }
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let dict = OwnedRef::new(interp, interp.new_dict());
        for (key, value) in keys.iter().zip(values) {
            let key = self.to_guest(key, convert)?;
            let value = self.to_guest(value, convert)?;
            interp
                .dict_set_item(dict.id(), key.id(), value.id())
                .map_err(|_| self.fetch_error(false))?;
        }
        self.wrap_opaque(dict.id(), convert, None)
    }

    /// New guest tuple, wrapped.
    pub fn tuple_new(&self, items: &[HostValue], convert: bool) -> BridgeResult<HostValue> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let items = items
            .iter()
            .map(|item| self.to_guest(item, convert))
            .collect::<BridgeResult<Vec<_>>>()?;
        let tuple = OwnedRef::new(
            interp,
            interp.new_tuple(items.into_iter().map(OwnedRef::detach).collect()),
        );
        self.wrap_opaque(tuple.id(), convert, None)
    }

    /// A guest capsule carrying `value`, wrapped without conversion.
    pub fn capsule(&self, value: &HostValue) -> BridgeResult<HostValue> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let capsule = new_host_capsule(interp, &self.session, &self.dispatcher, value.clone())?;
        self.wrap_opaque(capsule.id(), false, None)
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// Apply `f` to every item of a guest iterable, collecting the results.
    pub fn iterate<F>(&self, obj: &HostValue, mut f: F) -> BridgeResult<Vec<HostValue>>
    where
        F: FnMut(HostValue) -> BridgeResult<HostValue>,
    {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, convert) = self.guest_target(obj)?;
        let iter = OwnedRef::from_result(interp, interp.get_iter(target.id()))
            .map_err(|_| self.fetch_error(false))?;

        let mut out = Vec::new();
        loop {
            let item = match interp.iter_next(iter.id()) {
                Ok(Some(item)) => OwnedRef::new(interp, item),
                Ok(None) => break,
                Err(_) => return Err(self.fetch_error(false)),
            };
            out.push(f(self.to_host(item.id(), convert)?)?);
        }
        Ok(out)
    }

    /// Next item of a guest iterator, or `completed` once it is exhausted.
    pub fn iter_next(&self, obj: &HostValue, completed: HostValue) -> BridgeResult<HostValue> {
        let _gil = self.interp.gil().acquire();
        let interp = &*self.interp;
        let (target, convert) = self.guest_target(obj)?;
        match interp.iter_next(target.id()) {
            Ok(Some(item)) => {
                let item = OwnedRef::new(interp, item);
                self.to_host(item.id(), convert)
            }
            Ok(None) => Ok(completed),
            Err(_) => Err(self.fetch_error(false)),
        }
    }

    // ========================================================================
    // Misc
    // ========================================================================

    /// True if `value` wraps a guest object whose interpreter is gone.
    pub fn is_null_xptr(&self, value: &HostValue) -> bool {
        guest_handle(value).is_some_and(GuestObjectRef::is_null_xptr)
    }

    /// Ask the guest to raise `KeyboardInterrupt` at its next call on the
    /// main thread.
    pub fn set_interrupt(&self) {
        self.interp.set_interrupt();
    }
}

fn attr_type(interp: &Interpreter, value: ObjectId) -> AttrType {
    let b = interp.builtins();
    if interp.is_none(value) || interp.is_type(value) {
        AttrType::Unknown
    } else if interp.is_callable(value) {
        AttrType::Function
    } else if [b.list, b.tuple, b.dict].iter().any(|&ty| interp.is_kind(value, ty)) {
        AttrType::List
    } else if interp.is_kind(value, b.ndarray) {
        AttrType::Array
    } else if [b.bool_, b.int, b.float, b.str_, b.generic]
        .iter()
        .any(|&ty| interp.is_kind(value, ty))
    {
        AttrType::Vector
    } else if interp.is_kind(value, b.module) {
        AttrType::Environment
    } else {
        AttrType::List
    }
}
