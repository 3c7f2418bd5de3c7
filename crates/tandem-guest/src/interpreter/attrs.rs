//! Type checks and attribute access

use super::Interpreter;
use crate::error::GuestResult;
use crate::object::{ObjectData, ObjectId};

/// What a type-level attribute lookup found.
#[derive(Clone, Copy)]
enum Found {
    Plain(ObjectId),
    Function(ObjectId),
    Property(ObjectId),
}

impl Interpreter {
    // ========================================================================
    // Type checks
    // ========================================================================

    /// Class of an object (borrowed).
    pub fn type_of(&self, id: ObjectId) -> ObjectId {
        self.heap
            .lock()
            .class_of(id)
            .unwrap_or(self.builtins.object)
    }

    pub fn is_type(&self, id: ObjectId) -> bool {
        self.with_object(id, |d| matches!(d, ObjectData::Type(_)))
            .unwrap_or(false)
    }

    pub fn type_name(&self, ty: ObjectId) -> String {
        self.with_object(ty, |d| match d {
            ObjectData::Type(t) => t.name.clone(),
            _ => String::new(),
        })
        .unwrap_or_default()
    }

    pub fn type_module(&self, ty: ObjectId) -> String {
        self.with_object(ty, |d| match d {
            ObjectData::Type(t) => t.module.clone(),
            _ => String::new(),
        })
        .unwrap_or_default()
    }

    /// Method resolution order of a type, starting with the type itself.
    pub fn type_mro(&self, ty: ObjectId) -> Vec<ObjectId> {
        self.with_object(ty, |d| match d {
            ObjectData::Type(t) => t.mro.clone(),
            _ => Vec::new(),
        })
        .unwrap_or_default()
    }

    /// True if `ty` has `base` in its MRO.
    pub fn is_subtype(&self, ty: ObjectId, base: ObjectId) -> bool {
        ty == base || self.type_mro(ty).contains(&base)
    }

    /// Exact type check; subclasses do not match.
    pub fn is_exact(&self, id: ObjectId, ty: ObjectId) -> bool {
        self.type_of(id) == ty
    }

    /// Subclass-aware check against the real class pointer. Never runs guest code.
    pub fn is_kind(&self, id: ObjectId, ty: ObjectId) -> bool {
        self.is_subtype(self.type_of(id), ty)
    }

    /// `isinstance`: falls back to the object's `__class__` attribute, which
    /// may be computed by guest code.
    pub fn is_instance(&self, id: ObjectId, cls: ObjectId) -> GuestResult<bool> {
        if self.is_kind(id, cls) {
            return Ok(true);
        }
        let claimed = self.get_attr(id, "__class__")?;
        let result = claimed != self.type_of(id) && self.is_type(claimed) && self.is_subtype(claimed, cls);
        self.dec_ref(claimed);
        Ok(result)
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    fn lookup_in_type(&self, ty: ObjectId, name: &str) -> Option<Found> {
        let heap = self.heap.lock();
        let mro = match heap.get(ty) {
            Some(ObjectData::Type(t)) => t.mro.clone(),
            _ => return None,
        };
        for class in mro {
            if let Some(ObjectData::Type(t)) = heap.get(class) {
                if let Some(&value) = t.namespace.get(name) {
                    return Some(match heap.get(value) {
                        Some(ObjectData::NativeFunction(_)) => Found::Function(value),
                        Some(ObjectData::Property(getter)) => Found::Property(*getter),
                        _ => Found::Plain(value),
                    });
                }
            }
        }
        None
    }

    /// True if the object's type (not the instance) defines `name`.
    pub fn type_has_attr(&self, ty: ObjectId, name: &str) -> bool {
        self.lookup_in_type(ty, name).is_some()
    }

    fn own_attr(&self, id: ObjectId, name: &str) -> Option<ObjectId> {
        let heap = self.heap.lock();
        match heap.get(id)? {
            ObjectData::Instance(attrs) => attrs.get(name).copied(),
            ObjectData::Module(m) => m.attrs.get(name).copied(),
            _ => None,
        }
    }

    /// `getattr(obj, name)`. Returns a new reference or raises `AttributeError`.
    pub fn get_attr(&self, id: ObjectId, name: &str) -> GuestResult<ObjectId> {
        let ty = self.type_of(id);
        let type_level = self.lookup_in_type(ty, name);

        if let Some(Found::Property(getter)) = type_level {
            return self.call(getter, &[id], &[]);
        }

        if let Some(value) = self.own_attr(id, name) {
            self.inc_ref(value);
            return Ok(value);
        }

        if let Some(value) = self.special_attr(id, ty, name) {
            return Ok(value);
        }

        // class attribute access on a type object yields the raw attribute
        if self.is_type(id) {
            if let Some(found) = self.lookup_in_type(id, name) {
                let value = match found {
                    Found::Plain(v) | Found::Function(v) => v,
                    Found::Property(getter) => getter,
                };
                self.inc_ref(value);
                return Ok(value);
            }
        }

        match type_level {
            Some(Found::Plain(value)) => {
                self.inc_ref(value);
                return Ok(value);
            }
            Some(Found::Function(func)) => {
                self.inc_ref(func);
                self.inc_ref(id);
                return Ok(self.alloc(
                    self.builtins.method,
                    ObjectData::Method { func, receiver: id },
                ));
            }
            _ => {}
        }

        if let Some(Found::Function(hook)) = self.lookup_in_type(ty, "__getattr__") {
            let key = self.new_str(name);
            let result = self.call(hook, &[id, key], &[]);
            self.dec_ref(key);
            return result;
        }

        Err(self.raise(
            self.builtins.attribute_error,
            &format!("'{}' object has no attribute '{}'", self.type_name(ty), name),
        ))
    }

    fn special_attr(&self, id: ObjectId, ty: ObjectId, name: &str) -> Option<ObjectId> {
        match name {
            "__class__" => {
                self.inc_ref(ty);
                Some(ty)
            }
            "__name__" => {
                let n = self.with_object(id, |d| match d {
                    ObjectData::Type(t) => Some(t.name.clone()),
                    ObjectData::NativeFunction(f) => Some(f.name.clone()),
                    ObjectData::Module(m) => Some(m.name.clone()),
                    _ => None,
                })??;
                Some(self.new_str(&n))
            }
            "__module__" => {
                let m = self.with_object(id, |d| match d {
                    ObjectData::Type(t) => Some(t.module.clone()),
                    _ => None,
                })??;
                Some(self.new_str(&m))
            }
            "__func__" | "__self__" => {
                let v = self.with_object(id, |d| match d {
                    ObjectData::Method { func, receiver } => {
                        Some(if name == "__func__" { *func } else { *receiver })
                    }
                    _ => None,
                })??;
                self.inc_ref(v);
                Some(v)
            }
            _ => None,
        }
    }

    /// `hasattr(obj, name)`. Errors raised during lookup are swallowed.
    pub fn has_attr(&self, id: ObjectId, name: &str) -> bool {
        match self.get_attr(id, name) {
            Ok(value) => {
                self.dec_ref(value);
                true
            }
            Err(_) => {
                self.err_clear();
                false
            }
        }
    }

    /// `setattr(obj, name, value)`. Borrows `value`.
    pub fn set_attr(&self, id: ObjectId, name: &str, value: ObjectId) -> GuestResult<()> {
        let mut heap = self.heap.lock();
        let slot = match heap.get_mut(id) {
            Some(ObjectData::Instance(attrs)) => Some(attrs.insert(name.to_owned(), value)),
            Some(ObjectData::Module(m)) => Some(m.attrs.insert(name.to_owned(), value)),
            Some(ObjectData::Type(t)) => Some(t.namespace.insert(name.to_owned(), value)),
            _ => None,
        };
        match slot {
            Some(previous) => {
                heap.inc_ref(value);
                let mut finalizers = Vec::new();
                if let Some(previous) = previous {
                    heap.dec_ref(previous, &mut finalizers);
                }
                drop(heap);
                self.run_finalizers(finalizers);
                Ok(())
            }
            None => {
                let ty = heap.class_of(id).unwrap_or(self.builtins.object);
                drop(heap);
                Err(self.raise(
                    self.builtins.attribute_error,
                    &format!(
                        "'{}' object has no attribute '{}' and no __dict__ for setting new attributes",
                        self.type_name(ty),
                        name
                    ),
                ))
            }
        }
    }

    /// `delattr(obj, name)`. Raises `AttributeError` when `obj` has no
    /// such attribute of its own.
    pub fn del_attr(&self, id: ObjectId, name: &str) -> GuestResult<()> {
        let removed = {
            let mut heap = self.heap.lock();
            match heap.get_mut(id) {
                Some(ObjectData::Instance(attrs)) => attrs.remove(name),
                Some(ObjectData::Module(m)) => m.attrs.remove(name),
                Some(ObjectData::Type(t)) => t.namespace.remove(name),
                _ => None,
            }
        };
        match removed {
            Some(value) => {
                self.dec_ref(value);
                Ok(())
            }
            None => {
                let ty = self.type_of(id);
                Err(self.raise(
                    self.builtins.attribute_error,
                    &format!("'{}' object has no attribute '{}'", self.type_name(ty), name),
                ))
            }
        }
    }

    /// True if `name` resolves to a property on `ty` or one of its bases.
    pub fn type_attr_is_property(&self, ty: ObjectId, name: &str) -> bool {
        matches!(self.lookup_in_type(ty, name), Some(Found::Property(_)))
    }

    /// `dir(obj)`: own attributes plus everything reachable through the
    /// class (or, for a type, its own MRO), sorted.
    pub fn dir(&self, id: ObjectId) -> Vec<String> {
        let mut classes = self.type_mro(self.type_of(id));
        if self.is_type(id) {
            classes.extend(self.type_mro(id));
        }
        let heap = self.heap.lock();
        let mut names: Vec<String> = match heap.get(id) {
            Some(ObjectData::Instance(attrs)) => attrs.keys().cloned().collect(),
            Some(ObjectData::Module(m)) => m.attrs.keys().cloned().collect(),
            _ => Vec::new(),
        };
        for class in classes {
            if let Some(ObjectData::Type(t)) = heap.get(class) {
                names.extend(t.namespace.keys().cloned());
            }
        }
        drop(heap);
        names.sort_unstable();
        names.dedup();
        names
    }
}
