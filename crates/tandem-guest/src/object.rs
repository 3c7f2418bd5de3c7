//! Heap object representation
//!
//! Every guest value lives in the [`Heap`](crate::heap::Heap) as an
//! [`ObjectData`] payload plus a class pointer and a reference count.
//! Containers hold owned references to their children.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use num_complex::Complex64;
use rustc_hash::FxHashMap;

use crate::error::GuestResult;
use crate::interpreter::Interpreter;
use crate::ndarray::{ArrayBuffer, ArrayScalar, NdArray};

/// Handle to an object on the guest heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

impl ObjectId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    /// Slot index in the heap.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Signature of functions implemented natively.
///
/// Arguments are borrowed; the returned object is a new reference. On
/// failure the function sets the error indicator and returns `Raised`.
pub type NativeFn =
    Arc<dyn Fn(&Interpreter, &[ObjectId], &[(String, ObjectId)]) -> GuestResult<ObjectId> + Send + Sync>;

/// Opaque payload carried by a capsule.
pub type CapsulePayload = Arc<dyn Any + Send + Sync>;

/// Destructor run once when a capsule is freed.
///
/// Runs outside the heap lock on whichever thread dropped the last reference.
pub type CapsuleDestructor = Box<dyn FnOnce(&Interpreter, CapsulePayload) + Send>;

/// A natively implemented callable.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: String,
    pub func: NativeFn,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction").field("name", &self.name).finish()
    }
}

/// Opaque pointer wrapper with a name tag.
pub struct Capsule {
    pub name: Option<String>,
    pub payload: CapsulePayload,
    pub context: Option<CapsulePayload>,
    pub(crate) destructor: Option<CapsuleDestructor>,
}

impl fmt::Debug for Capsule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capsule")
            .field("name", &self.name)
            .field("has_destructor", &self.destructor.is_some())
            .finish()
    }
}

/// Class object.
#[derive(Debug, Default)]
pub struct TypeObject {
    pub name: String,
    pub module: String,
    /// Owned references to direct bases
    pub bases: Vec<ObjectId>,
    /// Method resolution order, starting with the type itself
    pub mro: Vec<ObjectId>,
    /// Owned references to class attributes
    pub namespace: FxHashMap<String, ObjectId>,
}

/// Insertion-ordered mapping.
#[derive(Debug, Default)]
pub struct Dict {
    pub entries: Vec<(ObjectId, ObjectId)>,
}

/// Module object.
#[derive(Debug, Default)]
pub struct Module {
    pub name: String,
    pub attrs: FxHashMap<String, ObjectId>,
}

/// Iterator over a snapshot of sequence items.
#[derive(Debug, Default)]
pub struct SeqIter {
    pub items: Vec<ObjectId>,
    pub index: usize,
}

/// Heap payload.
#[derive(Debug)]
pub enum ObjectData {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(Complex64),
    Str(String),
    Bytes(Vec<u8>),
    ByteArray(Vec<u8>),
    List(Vec<ObjectId>),
    Tuple(Vec<ObjectId>),
    Dict(Dict),
    Type(TypeObject),
    /// Plain instance with an attribute dictionary (also used for exceptions)
    Instance(FxHashMap<String, ObjectId>),
    Module(Module),
    NativeFunction(NativeFunction),
    /// Function bound to a receiver
    Method { func: ObjectId, receiver: ObjectId },
    /// Computed attribute; the getter is called with the instance
    Property(ObjectId),
    Capsule(Capsule),
    Array(NdArray),
    ArrayScalar(ArrayScalar),
    Iterator(SeqIter),
    /// Function names from outermost to innermost frame
    Traceback(Vec<String>),
}

impl ObjectData {
    /// Variant name, used for heap statistics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjectData::None => "None",
            ObjectData::Bool(_) => "Bool",
            ObjectData::Int(_) => "Int",
            ObjectData::Float(_) => "Float",
            ObjectData::Complex(_) => "Complex",
            ObjectData::Str(_) => "Str",
            ObjectData::Bytes(_) => "Bytes",
            ObjectData::ByteArray(_) => "ByteArray",
            ObjectData::List(_) => "List",
            ObjectData::Tuple(_) => "Tuple",
            ObjectData::Dict(_) => "Dict",
            ObjectData::Type(_) => "Type",
            ObjectData::Instance(_) => "Instance",
            ObjectData::Module(_) => "Module",
            ObjectData::NativeFunction(_) => "NativeFunction",
            ObjectData::Method { .. } => "Method",
            ObjectData::Property(_) => "Property",
            ObjectData::Capsule(_) => "Capsule",
            ObjectData::Array(_) => "Array",
            ObjectData::ArrayScalar(_) => "ArrayScalar",
            ObjectData::Iterator(_) => "Iterator",
            ObjectData::Traceback(_) => "Traceback",
        }
    }

    /// Collect the ids this payload holds owned references to.
    pub(crate) fn child_ids(&self, out: &mut Vec<ObjectId>) {
        match self {
            ObjectData::List(items) | ObjectData::Tuple(items) => out.extend(items),
            ObjectData::Dict(dict) => {
                for (k, v) in &dict.entries {
                    out.push(*k);
                    out.push(*v);
                }
            }
            ObjectData::Type(ty) => {
                out.extend(&ty.bases);
                out.extend(ty.namespace.values());
            }
            ObjectData::Instance(attrs) => out.extend(attrs.values()),
            ObjectData::Module(module) => out.extend(module.attrs.values()),
            ObjectData::Method { func, receiver } => {
                out.push(*func);
                out.push(*receiver);
            }
            ObjectData::Property(getter) => out.push(*getter),
            ObjectData::Array(array) => {
                if let Some(base) = array.base() {
                    out.push(base);
                }
                if let ArrayBuffer::Object(items) = array.buffer() {
                    out.extend(items);
                }
            }
            ObjectData::Iterator(iter) => out.extend(&iter.items[iter.index.min(iter.items.len())..]),
            _ => {}
        }
    }
}
