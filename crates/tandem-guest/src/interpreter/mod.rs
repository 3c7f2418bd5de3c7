//! The guest interpreter
//!
//! `Interpreter` is the single entry point for guest operations. Its surface
//! follows the shape of a C embedding API: objects are [`ObjectId`] handles
//! with manual reference counting, functions that return an object hand the
//! caller a new reference, and failures set the per-thread error indicator
//! and return [`Raised`](crate::Raised).
//!
//! The implementation is split across submodules:
//! - `attrs`: attribute lookup and type checks
//! - `call`: calling, pending calls and interrupts
//! - `errors`: the error indicator and exception formatting
//! - `protocols`: length, item access, iteration, string conversion

mod attrs;
mod call;
mod errors;
mod protocols;

pub use protocols::CompareOp;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use num_complex::Complex64;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::builtins::{self, Builtins};
use crate::error::{GuestResult, HeapError};
use crate::gil::ExecutionLock;
use crate::heap::{Heap, HeapStats, PendingFinalizer};
use crate::ndarray::{ArrayBuffer, ArrayScalar, DType, NdArray, Order};
use crate::object::{
    Capsule, CapsuleDestructor, CapsulePayload, Dict, Module, NativeFunction, ObjectData, ObjectId,
    TypeObject,
};
use crate::pending::PendingCalls;
use crate::thread_state::{ThreadStack, ThreadStates};

/// An embedded guest interpreter.
pub struct Interpreter {
    heap: Mutex<Heap>,
    builtins: Builtins,
    modules: Mutex<FxHashMap<String, ObjectId>>,
    threads: ThreadStates,
    gil: ExecutionLock,
    pending: PendingCalls,
    pending_busy: AtomicBool,
    interrupt: AtomicBool,
    main_thread: ThreadId,
    calls: AtomicUsize,
}

impl Interpreter {
    /// Start an interpreter. The calling thread becomes its main thread.
    pub fn new() -> Arc<Self> {
        Self::with_pending_capacity(crate::pending::PENDING_CALLS_CAPACITY)
    }

    /// Start an interpreter with a custom pending-call queue depth.
    pub fn with_pending_capacity(capacity: usize) -> Arc<Self> {
        let (heap, builtins, modules) = builtins::bootstrap();
        Arc::new(Self {
            heap: Mutex::new(heap),
            builtins,
            modules: Mutex::new(modules),
            threads: ThreadStates::new(),
            gil: ExecutionLock::new(),
            pending: PendingCalls::with_capacity(capacity),
            pending_busy: AtomicBool::new(false),
            interrupt: AtomicBool::new(false),
            main_thread: thread::current().id(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    /// The execution lock.
    pub fn gil(&self) -> &ExecutionLock {
        &self.gil
    }

    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    /// Call stacks of every thread that has touched the interpreter.
    pub fn thread_stacks(&self) -> Vec<ThreadStack> {
        self.threads.stacks()
    }

    /// Number of guest-level calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Reference counting
    // ========================================================================

    pub fn inc_ref(&self, id: ObjectId) {
        self.heap.lock().inc_ref(id);
    }

    /// Drop a reference. Capsule destructors triggered by the release run on
    /// the calling thread after the heap lock is dropped.
    pub fn dec_ref(&self, id: ObjectId) {
        let mut finalizers = Vec::new();
        self.heap.lock().dec_ref(id, &mut finalizers);
        self.run_finalizers(finalizers);
    }

    /// Drop a reference if `id` is set.
    pub fn xdec_ref(&self, id: Option<ObjectId>) {
        if let Some(id) = id {
            self.dec_ref(id);
        }
    }

    fn run_finalizers(&self, finalizers: Vec<PendingFinalizer>) {
        for (destructor, payload) in finalizers {
            destructor(self, payload);
        }
    }

    pub fn refcount(&self, id: ObjectId) -> usize {
        self.heap.lock().refcount(id)
    }

    pub fn is_alive(&self, id: ObjectId) -> bool {
        self.heap.lock().is_live(id)
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.lock().stats()
    }

    /// Run `f` against an object's payload.
    ///
    /// The heap stays locked while `f` runs, so `f` must not call back into
    /// the interpreter.
    pub fn with_object<R>(&self, id: ObjectId, f: impl FnOnce(&ObjectData) -> R) -> Option<R> {
        self.heap.lock().get(id).map(f)
    }

    fn alloc(&self, class: ObjectId, data: ObjectData) -> ObjectId {
        self.heap.lock().allocate(class, data)
    }

    // ========================================================================
    // Singletons
    // ========================================================================

    pub fn none(&self) -> ObjectId {
        self.builtins.none
    }

    pub fn is_none(&self, id: ObjectId) -> bool {
        id == self.builtins.none
    }

    pub fn new_bool(&self, value: bool) -> ObjectId {
        if value {
            self.builtins.true_
        } else {
            self.builtins.false_
        }
    }

    // ========================================================================
    // Constructors
    // ========================================================================

    pub fn new_int(&self, value: i64) -> ObjectId {
        self.alloc(self.builtins.int, ObjectData::Int(value))
    }

    pub fn new_float(&self, value: f64) -> ObjectId {
        self.alloc(self.builtins.float, ObjectData::Float(value))
    }

    pub fn new_complex(&self, value: Complex64) -> ObjectId {
        self.alloc(self.builtins.complex, ObjectData::Complex(value))
    }

    pub fn new_str(&self, value: &str) -> ObjectId {
        self.alloc(self.builtins.str_, ObjectData::Str(value.to_owned()))
    }

    pub fn new_bytes(&self, value: &[u8]) -> ObjectId {
        self.alloc(self.builtins.bytes, ObjectData::Bytes(value.to_vec()))
    }

    pub fn new_bytearray(&self, value: &[u8]) -> ObjectId {
        self.alloc(self.builtins.bytearray, ObjectData::ByteArray(value.to_vec()))
    }

    /// New list. Steals the references in `items`.
    pub fn new_list(&self, items: Vec<ObjectId>) -> ObjectId {
        self.alloc(self.builtins.list, ObjectData::List(items))
    }

    /// New tuple. Steals the references in `items`.
    pub fn new_tuple(&self, items: Vec<ObjectId>) -> ObjectId {
        self.alloc(self.builtins.tuple, ObjectData::Tuple(items))
    }

    pub fn new_dict(&self) -> ObjectId {
        self.alloc(self.builtins.dict, ObjectData::Dict(Dict::default()))
    }

    /// Append to a list. Borrows `item`.
    pub fn list_append(&self, list: ObjectId, item: ObjectId) -> GuestResult<()> {
        let mut heap = self.heap.lock();
        if let Some(ObjectData::List(items)) = heap.get_mut(list) {
            items.push(item);
            heap.inc_ref(item);
            return Ok(());
        }
        drop(heap);
        Err(self.raise(self.builtins.type_error, "list_append() expects a list"))
    }

    /// Insert or replace a dict entry. Borrows `key` and `value`; an equal
    /// existing key keeps its position and has its value overwritten.
    pub fn dict_set_item(&self, dict: ObjectId, key: ObjectId, value: ObjectId) -> GuestResult<()> {
        let mut finalizers = Vec::new();
        let mut heap = self.heap.lock();
        let lookup = match heap.get(dict) {
            Some(ObjectData::Dict(d)) => Some(
                d.entries
                    .iter()
                    .position(|(k, _)| protocols::keys_equal(&heap, *k, key)),
            ),
            _ => None,
        };
        let Some(position) = lookup else {
            drop(heap);
            return Err(self.raise(self.builtins.type_error, "dict_set_item() expects a dict"));
        };
        heap.inc_ref(value);
        let old = match (position, heap.get_mut(dict)) {
            (Some(i), Some(ObjectData::Dict(d))) => Some(std::mem::replace(&mut d.entries[i].1, value)),
            (None, Some(ObjectData::Dict(d))) => {
                d.entries.push((key, value));
                None
            }
            _ => None,
        };
        match old {
            Some(old) => heap.dec_ref(old, &mut finalizers),
            None => heap.inc_ref(key),
        }
        drop(heap);
        self.run_finalizers(finalizers);
        Ok(())
    }

    /// Insert or replace an entry under a string key.
    pub fn dict_set_item_str(&self, dict: ObjectId, key: &str, value: ObjectId) -> GuestResult<()> {
        let key = self.new_str(key);
        let result = self.dict_set_item(dict, key, value);
        self.dec_ref(key);
        result
    }

    /// Look up a dict entry by key. Returns a borrowed reference.
    pub fn dict_get_item(&self, dict: ObjectId, key: ObjectId) -> Option<ObjectId> {
        let heap = self.heap.lock();
        match heap.get(dict) {
            Some(ObjectData::Dict(d)) => d
                .entries
                .iter()
                .find(|(k, _)| protocols::keys_equal(&heap, *k, key))
                .map(|(_, v)| *v),
            _ => None,
        }
    }

    /// New native function object.
    pub fn new_native_function<F>(&self, name: &str, func: F) -> ObjectId
    where
        F: Fn(&Interpreter, &[ObjectId], &[(String, ObjectId)]) -> GuestResult<ObjectId>
            + Send
            + Sync
            + 'static,
    {
        self.alloc(
            self.builtins.function,
            ObjectData::NativeFunction(NativeFunction {
                name: name.to_owned(),
                func: Arc::new(func),
            }),
        )
    }

    /// New property whose getter is called with the instance. Borrows `getter`.
    pub fn new_property(&self, getter: ObjectId) -> ObjectId {
        self.inc_ref(getter);
        self.alloc(self.builtins.property, ObjectData::Property(getter))
    }

    /// New capsule.
    ///
    /// `destructor`, when given, runs exactly once when the capsule is freed.
    pub fn new_capsule(
        &self,
        payload: CapsulePayload,
        name: Option<&str>,
        destructor: Option<CapsuleDestructor>,
    ) -> ObjectId {
        self.alloc(
            self.builtins.capsule,
            ObjectData::Capsule(Capsule {
                name: name.map(str::to_owned),
                payload,
                context: None,
                destructor,
            }),
        )
    }

    /// New class. Borrows `bases`; an empty slice means `object`.
    pub fn new_type(&self, name: &str, module: &str, bases: &[ObjectId]) -> GuestResult<ObjectId> {
        let bases = if bases.is_empty() {
            vec![self.builtins.object]
        } else {
            bases.to_vec()
        };
        let mut heap = self.heap.lock();
        let Some(linear) = builtins::linearize(&heap, &bases) else {
            drop(heap);
            return Err(self.raise(
                self.builtins.type_error,
                "Cannot create a consistent method resolution order (MRO)",
            ));
        };
        for base in &bases {
            heap.inc_ref(*base);
        }
        let id = heap.allocate(
            self.builtins.type_,
            ObjectData::Type(TypeObject {
                name: name.to_owned(),
                module: module.to_owned(),
                bases,
                ..TypeObject::default()
            }),
        );
        if let Some(ObjectData::Type(t)) = heap.get_mut(id) {
            t.mro = std::iter::once(id).chain(linear).collect();
        }
        Ok(id)
    }

    /// New instance of `class` with an empty attribute dictionary.
    pub fn new_instance(&self, class: ObjectId) -> ObjectId {
        self.alloc(class, ObjectData::Instance(FxHashMap::default()))
    }

    /// New module object.
    pub fn new_module(&self, name: &str) -> ObjectId {
        self.alloc(
            self.builtins.module,
            ObjectData::Module(Module {
                name: name.to_owned(),
                attrs: FxHashMap::default(),
            }),
        )
    }

    /// New array object. Takes over the array's base and element references.
    pub fn new_array(&self, array: NdArray) -> ObjectId {
        self.alloc(self.builtins.ndarray, ObjectData::Array(array))
    }

    /// Build an owned array, raising `ValueError` on a bad shape or buffer.
    pub fn new_array_from(
        &self,
        dtype: DType,
        shape: Vec<usize>,
        order: Order,
        buffer: ArrayBuffer,
    ) -> GuestResult<ObjectId> {
        match NdArray::new(dtype, shape, order, buffer) {
            Ok(array) => Ok(self.new_array(array)),
            Err(e) => Err(self.raise_heap_error(e)),
        }
    }

    pub fn new_array_scalar(&self, scalar: ArrayScalar) -> ObjectId {
        let class = self.builtins.scalar_type(scalar.dtype);
        self.alloc(class, ObjectData::ArrayScalar(scalar))
    }

    pub(crate) fn raise_heap_error(&self, err: HeapError) -> crate::Raised {
        let class = match err {
            HeapError::UnsupportedCast { .. } => self.builtins.type_error,
            _ => self.builtins.value_error,
        };
        self.raise(class, &err.to_string())
    }

    // ========================================================================
    // Readers
    // ========================================================================

    pub fn as_bool(&self, id: ObjectId) -> Option<bool> {
        self.with_object(id, |d| match d {
            ObjectData::Bool(b) => Some(*b),
            _ => None,
        })
        .flatten()
    }

    /// Integer payload. Booleans are not integers here.
    pub fn as_int(&self, id: ObjectId) -> Option<i64> {
        self.with_object(id, |d| match d {
            ObjectData::Int(i) => Some(*i),
            _ => None,
        })
        .flatten()
    }

    pub fn as_float(&self, id: ObjectId) -> Option<f64> {
        self.with_object(id, |d| match d {
            ObjectData::Float(f) => Some(*f),
            _ => None,
        })
        .flatten()
    }

    pub fn as_complex(&self, id: ObjectId) -> Option<Complex64> {
        self.with_object(id, |d| match d {
            ObjectData::Complex(c) => Some(*c),
            _ => None,
        })
        .flatten()
    }

    pub fn as_str(&self, id: ObjectId) -> Option<String> {
        self.with_object(id, |d| match d {
            ObjectData::Str(s) => Some(s.clone()),
            _ => None,
        })
        .flatten()
    }

    /// Byte payload of `bytes` or `bytearray`.
    pub fn as_bytes(&self, id: ObjectId) -> Option<Vec<u8>> {
        self.with_object(id, |d| match d {
            ObjectData::Bytes(b) | ObjectData::ByteArray(b) => Some(b.clone()),
            _ => None,
        })
        .flatten()
    }

    /// Items of a list (or list subclass). Borrowed references.
    pub fn list_items(&self, id: ObjectId) -> Option<Vec<ObjectId>> {
        self.with_object(id, |d| match d {
            ObjectData::List(items) => Some(items.clone()),
            _ => None,
        })
        .flatten()
    }

    /// Items of a tuple. Borrowed references.
    pub fn tuple_items(&self, id: ObjectId) -> Option<Vec<ObjectId>> {
        self.with_object(id, |d| match d {
            ObjectData::Tuple(items) => Some(items.clone()),
            _ => None,
        })
        .flatten()
    }

    /// Entries of a dict (or dict subclass). Borrowed references.
    pub fn dict_entries(&self, id: ObjectId) -> Option<Vec<(ObjectId, ObjectId)>> {
        self.with_object(id, |d| match d {
            ObjectData::Dict(dict) => Some(dict.entries.clone()),
            _ => None,
        })
        .flatten()
    }

    /// `dict.items()` as a new list of 2-tuples.
    pub fn dict_items_list(&self, id: ObjectId) -> GuestResult<ObjectId> {
        let Some(entries) = self.dict_entries(id) else {
            return Err(self.raise(self.builtins.type_error, "items() requires a dict"));
        };
        let items = entries
            .into_iter()
            .map(|(k, v)| {
                self.inc_ref(k);
                self.inc_ref(v);
                self.new_tuple(vec![k, v])
            })
            .collect();
        Ok(self.new_list(items))
    }

    /// Copy of an array's header and buffer. Object element ids are borrowed.
    pub fn array(&self, id: ObjectId) -> Option<NdArray> {
        self.with_object(id, |d| match d {
            ObjectData::Array(a) => Some(a.clone()),
            _ => None,
        })
        .flatten()
    }

    /// Cast an array into a new array of `dtype` in `order`.
    pub fn array_cast(&self, id: ObjectId, dtype: DType, order: Order) -> GuestResult<ObjectId> {
        let Some(array) = self.array(id) else {
            return Err(self.raise(self.builtins.type_error, "expected an ndarray"));
        };
        let cast = array.cast(dtype, order).map_err(|e| self.raise_heap_error(e))?;
        if let ArrayBuffer::Object(items) = cast.buffer() {
            for item in items {
                self.inc_ref(*item);
            }
        }
        Ok(self.new_array(cast))
    }

    pub fn array_scalar(&self, id: ObjectId) -> Option<ArrayScalar> {
        self.with_object(id, |d| match d {
            ObjectData::ArrayScalar(s) => Some(s.clone()),
            _ => None,
        })
        .flatten()
    }

    pub fn is_capsule(&self, id: ObjectId) -> bool {
        self.with_object(id, |d| matches!(d, ObjectData::Capsule(_)))
            .unwrap_or(false)
    }

    /// Name tag of a capsule.
    pub fn capsule_name(&self, id: ObjectId) -> Option<String> {
        self.with_object(id, |d| match d {
            ObjectData::Capsule(c) => c.name.clone(),
            _ => None,
        })
        .flatten()
    }

    /// Payload of a capsule whose name matches `name`; raises `ValueError` otherwise.
    pub fn capsule_payload(&self, id: ObjectId, name: Option<&str>) -> GuestResult<CapsulePayload> {
        let found = self.with_object(id, |d| match d {
            ObjectData::Capsule(c) if c.name.as_deref() == name => Some(c.payload.clone()),
            _ => None,
        });
        found.flatten().ok_or_else(|| {
            self.raise(
                self.builtins.value_error,
                "PyCapsule_GetPointer called with incorrect name",
            )
        })
    }

    pub fn capsule_context(&self, id: ObjectId) -> Option<CapsulePayload> {
        self.with_object(id, |d| match d {
            ObjectData::Capsule(c) => c.context.clone(),
            _ => None,
        })
        .flatten()
    }

    pub fn capsule_set_context(&self, id: ObjectId, context: CapsulePayload) -> GuestResult<()> {
        let mut heap = self.heap.lock();
        if let Some(ObjectData::Capsule(c)) = heap.get_mut(id) {
            c.context = Some(context);
            return Ok(());
        }
        drop(heap);
        Err(self.raise(self.builtins.value_error, "object is not a capsule"))
    }

    // ========================================================================
    // Modules
    // ========================================================================

    /// Import a registered module. Returns a new reference.
    pub fn import(&self, name: &str) -> GuestResult<ObjectId> {
        let found = self.modules.lock().get(name).copied();
        match found {
            Some(module) => {
                self.inc_ref(module);
                Ok(module)
            }
            None => Err(self.raise(
                self.builtins.import_error,
                &format!("No module named '{}'", name),
            )),
        }
    }

    /// Register a module under `name`. Borrows `module`.
    pub fn register_module(&self, name: &str, module: ObjectId) {
        self.inc_ref(module);
        let previous = self.modules.lock().insert(name.to_owned(), module);
        self.xdec_ref(previous);
    }

    /// Attribute of an imported module. Returns a new reference.
    pub fn import_attr(&self, module: &str, attr: &str) -> GuestResult<ObjectId> {
        let m = self.import(module)?;
        let result = self.get_attr(m, attr);
        self.dec_ref(m);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dict_set_item_overwrites_equal_key() {
        let interp = Interpreter::new();
        let d = interp.new_dict();
        let one = interp.new_int(1);
        let two = interp.new_int(2);
        interp.dict_set_item_str(d, "a", one).unwrap();
        interp.dict_set_item_str(d, "a", two).unwrap();
        let entries = interp.dict_entries(d).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(interp.as_int(entries[0].1), Some(2));
        // the replaced value lost the dict's reference
        assert_eq!(interp.refcount(one), 1);
        interp.dec_ref(d);
        interp.dec_ref(one);
        interp.dec_ref(two);
        assert!(!interp.is_alive(two));
    }

    #[test]
    fn test_capsule_destructor_runs_once_on_free() {
        let interp = Interpreter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let cap = interp.new_capsule(
            Arc::new(5u32),
            Some("tag"),
            Some(Box::new(move |_, payload| {
                assert_eq!(payload.downcast_ref::<u32>(), Some(&5));
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        interp.inc_ref(cap);
        interp.dec_ref(cap);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        interp.dec_ref(cap);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_capsule_payload_checks_name() {
        let interp = Interpreter::new();
        let cap = interp.new_capsule(Arc::new("payload"), Some("right"), None);
        assert!(interp.capsule_payload(cap, Some("right")).is_ok());
        assert!(interp.capsule_payload(cap, Some("wrong")).is_err());
        interp.err_clear();
        interp.dec_ref(cap);
    }

    #[test]
    fn test_new_type_mro() {
        let interp = Interpreter::new();
        let b = interp.builtins().clone();
        let base = interp.new_type("Base", "app", &[]).unwrap();
        let derived = interp.new_type("Derived", "app", &[base]).unwrap();
        assert_eq!(interp.type_mro(derived), vec![derived, base, b.object]);
        assert!(interp.is_subtype(derived, base));
        assert!(!interp.is_subtype(base, derived));
    }

    #[test]
    fn test_import_unknown_module_raises() {
        let interp = Interpreter::new();
        assert!(interp.import("no_such_module").is_err());
        let err = interp.err_fetch().unwrap();
        assert!(interp.is_subtype(err.ptype, interp.builtins().import_error));
        interp.release_error(err);
    }
}
