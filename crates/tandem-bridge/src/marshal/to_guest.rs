//! Host → Guest conversion

use std::sync::Arc;

use tandem_guest::{Interpreter, ObjectId};
use tandem_host::{HostList, HostValue, Vector, NA_LOGICAL};

use crate::capsule::{external_pointer_capsule, new_host_capsule, set_capsule_convert};
use crate::error::{BridgeError, BridgeResult};
use crate::handle::{GuestObjectRef, OwnedRef};
use crate::Bridge;

/// The guest object behind a host value, if it wraps one: an external
/// reference created by the bridge or a closure forwarding to a guest
/// callable.
pub(crate) fn guest_handle(value: &HostValue) -> Option<&GuestObjectRef> {
    match value {
        HostValue::External(r) => r.downcast::<GuestObjectRef>(),
        HostValue::Closure(c) => c.foreign.as_ref()?.downcast::<GuestObjectRef>(),
        _ => None,
    }
}

impl Bridge {
    /// Convert a host value into a new guest reference.
    pub fn host_to_guest(&self, value: &HostValue, convert: bool) -> BridgeResult<OwnedRef<'_>> {
        let _gil = self.interp.gil().acquire();
        self.to_guest(value, convert)
    }

    pub(crate) fn to_guest(&self, value: &HostValue, convert: bool) -> BridgeResult<OwnedRef<'_>> {
        let interp = &*self.interp;

        if let Some(handle) = guest_handle(value) {
            return self.unwrap_handle(handle);
        }
        if value.dim().is_some() {
            return self.array_to_guest(value, convert);
        }

        match value {
            HostValue::Null => Ok(none(interp)),
            HostValue::Logical(v) => self.atomic_to_guest(v, |x| {
                if x == NA_LOGICAL {
                    none(interp)
                } else {
                    OwnedRef::borrowed(interp, interp.new_bool(x != 0))
                }
            }),
            // NA_integer stays an int so integer vectors survive a round trip
            HostValue::Integer(v) => {
                self.atomic_to_guest(v, |x| OwnedRef::new(interp, interp.new_int(i64::from(x))))
            }
            // NA_real stays a float; it is a NaN on the guest side
            HostValue::Double(v) => {
                self.atomic_to_guest(v, |x| OwnedRef::new(interp, interp.new_float(x)))
            }
            HostValue::Complex(v) => {
                self.atomic_to_guest(v, |x| OwnedRef::new(interp, interp.new_complex(x)))
            }
            HostValue::Character(v) => self.atomic_to_guest(v, |s| match s {
                Some(s) => OwnedRef::new(interp, interp.new_str(&s.text)),
                None => none(interp),
            }),
            HostValue::Raw(bytes) => Ok(OwnedRef::new(interp, interp.new_bytearray(bytes))),
            HostValue::List(list) if list.is_data_frame() => self.data_frame_to_guest(list, convert),
            HostValue::List(list) if list.names.is_some() => self.named_list_to_guest(list, convert),
            HostValue::List(list) => {
                let items = list
                    .items
                    .iter()
                    .map(|item| self.to_guest(item, convert))
                    .collect::<BridgeResult<Vec<_>>>()?;
                Ok(new_list(interp, items))
            }
            HostValue::Closure(closure) => {
                let capsule = new_host_capsule(interp, &self.session, &self.dispatcher, value.clone())?;
                set_capsule_convert(interp, capsule.id(), convert)?;
                self.new_host_function(capsule.id(), &closure.name)
            }
            HostValue::ExternalPtr(ptr) => external_pointer_capsule(interp, *ptr),
            HostValue::External(_) | HostValue::Language(_) => {
                new_host_capsule(interp, &self.session, &self.dispatcher, value.clone())
            }
        }
    }

    /// A new reference to a wrapped guest object, checked against this
    /// bridge's interpreter.
    pub(crate) fn unwrap_handle(&self, handle: &GuestObjectRef) -> BridgeResult<OwnedRef<'_>> {
        let owner = handle.interpreter()?;
        if !Arc::ptr_eq(&owner, &self.interp) {
            return Err(BridgeError::UnsupportedHostValue(
                "guest object belongs to another interpreter".into(),
            ));
        }
        Ok(handle.new_ref(&self.interp))
    }

    /// Scalar for length 1, list otherwise.
    fn atomic_to_guest<'a, T: Clone>(
        &'a self,
        vector: &Vector<T>,
        element: impl Fn(T) -> OwnedRef<'a>,
    ) -> BridgeResult<OwnedRef<'a>> {
        let items = vector.as_slice();
        if items.len() == 1 {
            return Ok(element(items[0].clone()));
        }
        let items = items.iter().cloned().map(element).collect();
        Ok(new_list(&self.interp, items))
    }

    /// Dict in list order; a repeated name keeps the last value.
    fn named_list_to_guest(&self, list: &HostList, convert: bool) -> BridgeResult<OwnedRef<'_>> {
        let interp = &*self.interp;
        let dict = OwnedRef::new(interp, interp.new_dict());
        let names = list.names.as_deref().unwrap_or_default();
        for (name, item) in names.iter().zip(&list.items) {
            let value = self.to_guest(item, convert)?;
            interp
                .dict_set_item_str(dict.id(), name, value.id())
                .map_err(|_| self.fetch_error(false))?;
        }
        Ok(dict)
    }
}

fn none(interp: &Interpreter) -> OwnedRef<'_> {
    OwnedRef::borrowed(interp, interp.none())
}

/// New list stealing every item.
fn new_list<'a>(interp: &'a Interpreter, items: Vec<OwnedRef<'a>>) -> OwnedRef<'a> {
    let ids: Vec<ObjectId> = items.into_iter().map(OwnedRef::detach).collect();
    OwnedRef::new(interp, interp.new_list(ids))
}
