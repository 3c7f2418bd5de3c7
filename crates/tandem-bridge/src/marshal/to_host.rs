//! Guest → Host conversion

use std::sync::{Arc, Weak};

use tandem_guest::{ArrayScalar, DType, ObjectId};
use tandem_host::{
    na_complex, na_real, ExternalRef, HostClosure, HostError, HostList, HostString, HostValue,
    Vector, NA_INTEGER, NA_LOGICAL,
};

use super::fits_host_integer;
use crate::array::narrow;
use crate::capsule::host_capsule_value;
use crate::class_tags::{class_tags, ITERATOR_TAG};
use crate::classify::{classify, is_missing_sentinel, scalar_of, Category, Scalar};
use crate::error::{BridgeError, BridgeResult};
use crate::handle::{GuestObjectRef, OwnedRef};
use crate::Bridge;

/// Name given to host closures wrapping anonymous guest callables.
const ANONYMOUS_CALLABLE: &str = "<guest callable>";

impl Bridge {
    /// Convert a borrowed guest object into a host value.
    ///
    /// With `convert` false the object always crosses as an opaque wrapper.
    pub fn guest_to_host(&self, obj: ObjectId, convert: bool) -> BridgeResult<HostValue> {
        let _gil = self.interp.gil().acquire();
        self.to_host(obj, convert)
    }

    pub(crate) fn to_host(&self, obj: ObjectId, convert: bool) -> BridgeResult<HostValue> {
        if !convert {
            return self.wrap_opaque(obj, false, None);
        }
        let interp = &*self.interp;
        let category = classify(interp, &self.symbols, obj).map_err(|_| self.fetch_error(false))?;

        match category {
            Category::Null => Ok(HostValue::Null),
            Category::Scalar(scalar) => Ok(scalar_to_host(scalar)),
            Category::List(items) | Category::Tuple(items) => {
                let items: Vec<_> = items
                    .into_iter()
                    .map(|item| OwnedRef::borrowed(interp, item))
                    .collect();
                self.sequence_to_host(&items)
            }
            Category::Dict => self.dict_to_host(obj),
            Category::Array => self.array_to_host(obj),
            Category::ArrayScalar(scalar) => match narrowed_scalar(&scalar)? {
                Some(value) => Ok(value),
                None => self.wrap_opaque(obj, true, None),
            },
            Category::ListLike => {
                let len = interp.len(obj).map_err(|_| self.fetch_error(false))?;
                let mut items = Vec::with_capacity(len);
                for i in 0..len {
                    let item = OwnedRef::from_result(interp, interp.sequence_item(obj, i))
                        .map_err(|_| self.fetch_error(false))?;
                    items.push(item);
                }
                self.sequence_to_host(&items)
            }
            Category::Mapping => {
                let pairs = OwnedRef::from_result(interp, interp.mapping_items(obj))
                    .map_err(|_| self.fetch_error(false))?;
                self.pairs_to_host(pairs.id())
            }
            Category::Callable => self.callable_to_host(obj, convert),
            Category::Iterator => self.wrap_opaque(obj, convert, Some(ITERATOR_TAG)),
            Category::ByteArray(bytes) => Ok(HostValue::Raw(Arc::from(bytes))),
            Category::MissingSentinel => Ok(HostValue::double(na_real())),
            Category::TabularColumn => self.tabular_column_to_host(obj),
            Category::TabularFrame => self.tabular_frame_to_host(obj),
            Category::HostCapsule => host_capsule_value(interp, obj),
            Category::Opaque => self.wrap_opaque(obj, convert, None),
        }
    }

    /// Wrap `obj` as a host external reference carrying its class tags.
    /// Takes a new reference; `extra` goes in front of the tags.
    pub(crate) fn wrap_opaque(
        &self,
        obj: ObjectId,
        convert: bool,
        extra: Option<&str>,
    ) -> BridgeResult<HostValue> {
        let interp = &*self.interp;
        let tags = class_tags(interp, &self.symbols, &*self.class_filter, obj, extra)
            .map_err(|_| self.fetch_error(false))?;
        let handle = GuestObjectRef::new(&self.interp, OwnedRef::borrowed(interp, obj), convert);
        Ok(HostValue::External(ExternalRef::new(Arc::new(handle), tags)))
    }

    // ========================================================================
    // Containers
    // ========================================================================

    /// A flat vector when every item is a scalar of the same kind, otherwise
    /// an unnamed list of converted items.
    fn sequence_to_host(&self, items: &[OwnedRef<'_>]) -> BridgeResult<HostValue> {
        if let Some(vector) = self.collapse_scalars(items) {
            return Ok(vector);
        }
        let converted = items
            .iter()
            .map(|item| self.to_host(item.id(), true))
            .collect::<BridgeResult<Vec<_>>>()?;
        Ok(HostValue::List(HostList::unnamed(converted)))
    }

    /// Collapse when at least one item is a scalar, every scalar has the
    /// same kind and the rest are missing. Missing items become that kind's
    /// NA.
    fn collapse_scalars(&self, items: &[OwnedRef<'_>]) -> Option<HostValue> {
        let interp = &*self.interp;
        let scalars = items
            .iter()
            .map(|item| match scalar_of(interp, item.id()) {
                Some(scalar) => Some(Some(scalar)),
                None if self.is_missing_element(item.id()) => Some(None),
                None => None,
            })
            .collect::<Option<Vec<Option<Scalar>>>>()?;
        let first = scalars.iter().flatten().next()?.clone();

        let kind = std::mem::discriminant(&first);
        if !scalars.iter().flatten().all(|s| std::mem::discriminant(s) == kind) {
            return None;
        }

        let value = match first {
            Scalar::Bool(_) => HostValue::Logical(fill(&scalars, NA_LOGICAL, |s| match s {
                Scalar::Bool(v) => Some(*v as i32),
                _ => None,
            })),
            Scalar::Int(_) => {
                let fits = scalars.iter().flatten().all(|s| match s {
                    Scalar::Int(v) => fits_host_integer(*v),
                    _ => false,
                });
                if fits {
                    HostValue::Integer(fill(&scalars, NA_INTEGER, |s| match s {
                        Scalar::Int(v) => Some(*v as i32),
                        _ => None,
                    }))
                } else {
                    HostValue::Double(fill(&scalars, na_real(), |s| match s {
                        Scalar::Int(v) => Some(*v as f64),
                        _ => None,
                    }))
                }
            }
            Scalar::Float(_) => HostValue::Double(fill(&scalars, na_real(), |s| match s {
                Scalar::Float(v) => Some(*v),
                _ => None,
            })),
            Scalar::Complex(_) => HostValue::Complex(fill(&scalars, na_complex(), |s| match s {
                Scalar::Complex(v) => Some(*v),
                _ => None,
            })),
            Scalar::Str(..) => HostValue::Character(fill(&scalars, None, |s| match s {
                Scalar::Str(text, encoding) => Some(Some(HostString {
                    text: text.clone(),
                    encoding: *encoding,
                })),
                _ => None,
            })),
        };
        Some(value)
    }

    /// Guest null or the tabular missing sentinel.
    fn is_missing_element(&self, obj: ObjectId) -> bool {
        self.interp.is_none(obj) || is_missing_sentinel(&self.interp, &self.symbols, obj)
    }

    /// Named list in insertion order. Duplicate names are kept.
    fn dict_to_host(&self, dict: ObjectId) -> BridgeResult<HostValue> {
        let interp = &*self.interp;
        let entries: Vec<_> = interp
            .dict_entries(dict)
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (OwnedRef::borrowed(interp, k), OwnedRef::borrowed(interp, v)))
            .collect();

        let mut named = Vec::with_capacity(entries.len());
        for (key, value) in &entries {
            let name = self.key_name(key.id())?;
            named.push((name, self.to_host(value.id(), true)?));
        }
        Ok(HostValue::List(HostList::named(named)))
    }

    /// Named list from a list of `(key, value)` tuples.
    fn pairs_to_host(&self, pairs: ObjectId) -> BridgeResult<HostValue> {
        let interp = &*self.interp;
        let pairs: Vec<_> = interp
            .list_items(pairs)
            .unwrap_or_default()
            .into_iter()
            .map(|p| OwnedRef::borrowed(interp, p))
            .collect();

        let mut named = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            let (key, value) = match interp.tuple_items(pair.id()).as_deref() {
                Some(&[k, v]) => (k, v),
                _ => {
                    return Err(BridgeError::UnsupportedHostValue(
                        "mapping items() must yield (key, value) pairs".into(),
                    ))
                }
            };
            named.push((self.key_name(key)?, self.to_host(value, true)?));
        }
        Ok(HostValue::List(HostList::named(named)))
    }

    /// A mapping key as a host name: strings as-is, anything else through
    /// the guest's `str`.
    pub(crate) fn key_name(&self, key: ObjectId) -> BridgeResult<String> {
        let interp = &*self.interp;
        match interp.as_str(key) {
            Some(s) => Ok(s),
            None => interp.str_of(key).map_err(|_| self.fetch_error(false)),
        }
    }

    // ========================================================================
    // Callables
    // ========================================================================

    /// Host closure forwarding to the guest callable, tagged with its classes.
    fn callable_to_host(&self, obj: ObjectId, convert: bool) -> BridgeResult<HostValue> {
        let interp = &*self.interp;
        // a host closure that crossed earlier comes back as itself
        if let Some(capsule) = self.host_function_capsule(obj) {
            return host_capsule_value(interp, capsule.id());
        }
        let tags = class_tags(interp, &self.symbols, &*self.class_filter, obj, None)
            .map_err(|_| self.fetch_error(false))?;
        let name = match interp.get_attr(obj, "__name__") {
            Ok(n) => {
                let n = OwnedRef::new(interp, n);
                interp.as_str(n.id()).unwrap_or_else(|| ANONYMOUS_CALLABLE.to_owned())
            }
            Err(_) => {
                interp.err_clear();
                ANONYMOUS_CALLABLE.to_owned()
            }
        };

        let target = Arc::new(GuestObjectRef::new(
            &self.interp,
            OwnedRef::borrowed(interp, obj),
            convert,
        ));
        let bridge: Weak<Bridge> = self.me.clone();
        let callee = target.clone();
        let mut closure = HostClosure::new(&name, move |_session, args| {
            let bridge = bridge.upgrade().ok_or_else(|| HostError::from(BridgeError::Disconnected))?;
            bridge.call_guest_object(&callee, args).map_err(HostError::from)
        });
        closure.classes = tags.clone();
        closure.foreign = Some(ExternalRef::new(target, tags));
        Ok(HostValue::Closure(closure))
    }
}

fn scalar_to_host(scalar: Scalar) -> HostValue {
    match scalar {
        Scalar::Bool(v) => HostValue::logical(v),
        Scalar::Int(v) if fits_host_integer(v) => HostValue::integer(v as i32),
        Scalar::Int(v) => HostValue::double(v as f64),
        Scalar::Float(v) => HostValue::double(v),
        Scalar::Complex(v) => HostValue::complex(v),
        Scalar::Str(text, encoding) => {
            HostValue::Character(Vector::scalar(Some(HostString { text, encoding })))
        }
    }
}

/// One vector element per scalar, `na` where the item was missing.
fn fill<T: Clone>(scalars: &[Option<Scalar>], na: T, element: impl Fn(&Scalar) -> Option<T>) -> Vector<T> {
    Vector::from(
        scalars
            .iter()
            .map(|s| s.as_ref().and_then(&element).unwrap_or_else(|| na.clone()))
            .collect::<Vec<_>>(),
    )
}

/// Numeric array scalar cast to its narrowed host kind; `None` for kinds
/// that stay opaque.
fn narrowed_scalar(scalar: &ArrayScalar) -> BridgeResult<Option<HostValue>> {
    let converted = match narrow(scalar.dtype)? {
        DType::Bool => scalar.to_bool().map(HostValue::logical),
        DType::Int32 => scalar.to_i64().map(|v| HostValue::integer(v as i32)),
        DType::Float64 => scalar.to_f64().map(HostValue::double),
        DType::Complex128 => scalar.to_complex().map(HostValue::complex),
        _ => None,
    };
    Ok(converted)
}
