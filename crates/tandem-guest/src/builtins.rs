//! Bootstrap of builtin types and modules
//!
//! Builtin types, singletons and the handful of library modules the bridge
//! relies on (`inspect`, `traceback`, `numpy`, `pandas._libs.missing`) are
//! allocated immortal at interpreter start-up.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::GuestResult;
use crate::heap::Heap;
use crate::interpreter::Interpreter;
use crate::ndarray::{DType, ALL_DTYPES};
use crate::object::{Module, NativeFunction, ObjectData, ObjectId, TypeObject};

/// Ids of builtin types and singletons.
#[derive(Debug, Clone)]
pub struct Builtins {
    pub object: ObjectId,
    pub type_: ObjectId,
    pub none_type: ObjectId,
    pub bool_: ObjectId,
    pub int: ObjectId,
    pub float: ObjectId,
    pub complex: ObjectId,
    pub str_: ObjectId,
    pub bytes: ObjectId,
    pub bytearray: ObjectId,
    pub list: ObjectId,
    pub tuple: ObjectId,
    pub dict: ObjectId,
    pub function: ObjectId,
    pub method: ObjectId,
    pub property: ObjectId,
    pub module: ObjectId,
    pub capsule: ObjectId,
    pub traceback: ObjectId,
    pub iterator: ObjectId,

    pub base_exception: ObjectId,
    pub exception: ObjectId,
    pub keyboard_interrupt: ObjectId,
    pub stop_iteration: ObjectId,
    pub type_error: ObjectId,
    pub value_error: ObjectId,
    pub runtime_error: ObjectId,
    pub attribute_error: ObjectId,
    pub key_error: ObjectId,
    pub index_error: ObjectId,
    pub import_error: ObjectId,

    pub ndarray: ObjectId,
    pub generic: ObjectId,
    /// Array scalar types indexed by type number
    pub scalar_types: Vec<ObjectId>,
    pub na_type: ObjectId,

    pub none: ObjectId,
    pub true_: ObjectId,
    pub false_: ObjectId,
    pub na: ObjectId,
    pub nan: ObjectId,
}

impl Builtins {
    /// Array scalar type for a dtype.
    pub fn scalar_type(&self, dtype: DType) -> ObjectId {
        self.scalar_types[dtype.typenum() as usize]
    }
}

/// Merge base linearizations (C3). Returns `None` for an inconsistent hierarchy.
pub(crate) fn linearize(heap: &Heap, bases: &[ObjectId]) -> Option<Vec<ObjectId>> {
    let mut seqs: Vec<Vec<ObjectId>> = bases
        .iter()
        .map(|b| match heap.get(*b) {
            Some(ObjectData::Type(t)) => t.mro.clone(),
            _ => vec![*b],
        })
        .collect();
    seqs.push(bases.to_vec());

    let mut out = Vec::new();
    loop {
        seqs.retain(|s| !s.is_empty());
        if seqs.is_empty() {
            return Some(out);
        }
        let head = seqs
            .iter()
            .map(|s| s[0])
            .find(|cand| !seqs.iter().any(|s| s[1..].contains(cand)))?;
        out.push(head);
        for seq in &mut seqs {
            if seq[0] == head {
                seq.remove(0);
            }
        }
    }
}

struct Bootstrap {
    heap: Heap,
    type_: ObjectId,
    function: ObjectId,
}

impl Bootstrap {
    fn new_type(&mut self, name: &str, module: &str, bases: &[ObjectId]) -> ObjectId {
        let id = self.heap.allocate_immortal(
            self.type_,
            ObjectData::Type(TypeObject {
                name: name.to_owned(),
                module: module.to_owned(),
                bases: bases.to_vec(),
                ..TypeObject::default()
            }),
        );
        let mut mro = vec![id];
        mro.extend(linearize(&self.heap, bases).unwrap_or_else(|| bases.to_vec()));
        if let Some(ObjectData::Type(t)) = self.heap.get_mut(id) {
            t.mro = mro;
        }
        id
    }

    fn native(&mut self, name: &str, func: crate::object::NativeFn) -> ObjectId {
        self.heap.allocate_immortal(
            self.function,
            ObjectData::NativeFunction(NativeFunction {
                name: name.to_owned(),
                func,
            }),
        )
    }

    fn set_class_attr(&mut self, ty: ObjectId, name: &str, value: ObjectId) {
        if let Some(ObjectData::Type(t)) = self.heap.get_mut(ty) {
            t.namespace.insert(name.to_owned(), value);
        }
    }

    fn module(&mut self, module_type: ObjectId, name: &str, attrs: Vec<(&str, ObjectId)>) -> ObjectId {
        self.heap.allocate_immortal(
            module_type,
            ObjectData::Module(Module {
                name: name.to_owned(),
                attrs: attrs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect(),
            }),
        )
    }
}

/// Build the builtin heap. Returns the heap, builtin ids and module table.
pub(crate) fn bootstrap() -> (Heap, Builtins, FxHashMap<String, ObjectId>) {
    let mut heap = Heap::new();
    let placeholder = ObjectId::new(0);
    let object = heap.allocate_immortal(
        placeholder,
        ObjectData::Type(TypeObject {
            name: "object".into(),
            module: "builtins".into(),
            ..TypeObject::default()
        }),
    );
    let type_ = heap.allocate_immortal(
        placeholder,
        ObjectData::Type(TypeObject {
            name: "type".into(),
            module: "builtins".into(),
            bases: vec![object],
            ..TypeObject::default()
        }),
    );
    heap.set_class(object, type_);
    heap.set_class(type_, type_);
    if let Some(ObjectData::Type(t)) = heap.get_mut(object) {
        t.mro = vec![object];
    }
    if let Some(ObjectData::Type(t)) = heap.get_mut(type_) {
        t.mro = vec![type_, object];
    }

    let mut b = Bootstrap {
        heap,
        type_,
        function: placeholder,
    };
    let function = b.new_type("builtin_function_or_method", "builtins", &[object]);
    b.function = function;

    let none_type = b.new_type("NoneType", "builtins", &[object]);
    let int = b.new_type("int", "builtins", &[object]);
    let bool_ = b.new_type("bool", "builtins", &[int]);
    let float = b.new_type("float", "builtins", &[object]);
    let complex = b.new_type("complex", "builtins", &[object]);
    let str_ = b.new_type("str", "builtins", &[object]);
    let bytes = b.new_type("bytes", "builtins", &[object]);
    let bytearray = b.new_type("bytearray", "builtins", &[object]);
    let list = b.new_type("list", "builtins", &[object]);
    let tuple = b.new_type("tuple", "builtins", &[object]);
    let dict = b.new_type("dict", "builtins", &[object]);
    let method = b.new_type("method", "builtins", &[object]);
    let property = b.new_type("property", "builtins", &[object]);
    let module = b.new_type("module", "builtins", &[object]);
    let capsule = b.new_type("PyCapsule", "builtins", &[object]);
    let traceback = b.new_type("traceback", "builtins", &[object]);
    let iterator = b.new_type("iterator", "builtins", &[object]);

    let base_exception = b.new_type("BaseException", "builtins", &[object]);
    let exception = b.new_type("Exception", "builtins", &[base_exception]);
    let keyboard_interrupt = b.new_type("KeyboardInterrupt", "builtins", &[base_exception]);
    let stop_iteration = b.new_type("StopIteration", "builtins", &[exception]);
    let type_error = b.new_type("TypeError", "builtins", &[exception]);
    let value_error = b.new_type("ValueError", "builtins", &[exception]);
    let runtime_error = b.new_type("RuntimeError", "builtins", &[exception]);
    let attribute_error = b.new_type("AttributeError", "builtins", &[exception]);
    let lookup_error = b.new_type("LookupError", "builtins", &[exception]);
    let key_error = b.new_type("KeyError", "builtins", &[lookup_error]);
    let index_error = b.new_type("IndexError", "builtins", &[lookup_error]);
    let import_error = b.new_type("ImportError", "builtins", &[exception]);

    let ndarray = b.new_type("ndarray", "numpy", &[object]);
    let generic = b.new_type("generic", "numpy", &[object]);
    let scalar_types: Vec<ObjectId> = ALL_DTYPES
        .iter()
        .map(|dt| b.new_type(dt.scalar_type_name(), "numpy", &[generic]))
        .collect();
    let na_type = b.new_type("NAType", "pandas._libs.missing", &[object]);

    let none = b.heap.allocate_immortal(none_type, ObjectData::None);
    let true_ = b.heap.allocate_immortal(bool_, ObjectData::Bool(true));
    let false_ = b.heap.allocate_immortal(bool_, ObjectData::Bool(false));
    let na = b.heap.allocate_immortal(na_type, ObjectData::Instance(FxHashMap::default()));
    let nan = b.heap.allocate_immortal(float, ObjectData::Float(f64::NAN));

    for attr in ["__traceback__", "__context__", "__cause__"] {
        b.set_class_attr(base_exception, attr, none);
    }

    let iter_self = b.native(
        "__iter__",
        Arc::new(|interp: &Interpreter, args: &[ObjectId], _kw: &[(String, ObjectId)]| {
            let this = expect_arg(interp, args, 0, "__iter__")?;
            interp.inc_ref(this);
            Ok(this)
        }),
    );
    let iter_next = b.native(
        "__next__",
        Arc::new(|interp: &Interpreter, args: &[ObjectId], _kw: &[(String, ObjectId)]| {
            let this = expect_arg(interp, args, 0, "__next__")?;
            match interp.iter_next(this)? {
                Some(item) => Ok(item),
                None => {
                    let stop = interp.builtins().stop_iteration;
                    Err(interp.raise(stop, ""))
                }
            }
        }),
    );
    b.set_class_attr(iterator, "__iter__", iter_self);
    b.set_class_attr(iterator, "__next__", iter_next);

    let dict_items = b.native(
        "items",
        Arc::new(|interp: &Interpreter, args: &[ObjectId], _kw: &[(String, ObjectId)]| {
            let this = expect_arg(interp, args, 0, "items")?;
            interp.dict_items_list(this)
        }),
    );
    let dict_keys = b.native(
        "keys",
        Arc::new(|interp: &Interpreter, args: &[ObjectId], _kw: &[(String, ObjectId)]| {
            let this = expect_arg(interp, args, 0, "keys")?;
            let keys: Vec<ObjectId> = interp
                .dict_entries(this)
                .unwrap_or_default()
                .into_iter()
                .map(|(k, _)| {
                    interp.inc_ref(k);
                    k
                })
                .collect();
            Ok(interp.new_list(keys))
        }),
    );
    b.set_class_attr(dict, "items", dict_items);
    b.set_class_attr(dict, "keys", dict_keys);

    let getmro = b.native(
        "getmro",
        Arc::new(|interp: &Interpreter, args: &[ObjectId], _kw: &[(String, ObjectId)]| {
            let cls = expect_arg(interp, args, 0, "getmro")?;
            if !interp.is_type(cls) {
                let te = interp.builtins().type_error;
                return Err(interp.raise(te, "getmro() argument must be a type"));
            }
            let mro: Vec<ObjectId> = interp.type_mro(cls);
            for id in &mro {
                interp.inc_ref(*id);
            }
            Ok(interp.new_tuple(mro))
        }),
    );
    let format_exception_only = b.native(
        "format_exception_only",
        Arc::new(|interp: &Interpreter, args: &[ObjectId], _kw: &[(String, ObjectId)]| {
            let etype = expect_arg(interp, args, 0, "format_exception_only")?;
            let value = args.get(1).copied().unwrap_or(interp.none());
            let lines = interp.format_exception_only(etype, value)?;
            let items = lines.iter().map(|l| interp.new_str(l)).collect();
            Ok(interp.new_list(items))
        }),
    );

    let module_type = module;
    let mut modules = FxHashMap::default();
    let builtins_attrs = vec![
        ("object", object),
        ("type", type_),
        ("int", int),
        ("bool", bool_),
        ("float", float),
        ("complex", complex),
        ("str", str_),
        ("bytes", bytes),
        ("bytearray", bytearray),
        ("list", list),
        ("tuple", tuple),
        ("dict", dict),
        ("BaseException", base_exception),
        ("Exception", exception),
        ("KeyboardInterrupt", keyboard_interrupt),
        ("StopIteration", stop_iteration),
        ("TypeError", type_error),
        ("ValueError", value_error),
        ("RuntimeError", runtime_error),
        ("AttributeError", attribute_error),
        ("LookupError", lookup_error),
        ("KeyError", key_error),
        ("IndexError", index_error),
        ("ImportError", import_error),
        ("None", none),
        ("True", true_),
        ("False", false_),
    ];
    let m = b.module(module_type, "builtins", builtins_attrs);
    modules.insert("builtins".to_owned(), m);
    let m = b.module(module_type, "inspect", vec![("getmro", getmro)]);
    modules.insert("inspect".to_owned(), m);
    let m = b.module(
        module_type,
        "traceback",
        vec![("format_exception_only", format_exception_only)],
    );
    modules.insert("traceback".to_owned(), m);

    let mut numpy_attrs = vec![("nan", nan), ("ndarray", ndarray), ("generic", generic)];
    for (dt, ty) in ALL_DTYPES.iter().zip(&scalar_types) {
        numpy_attrs.push((dt.scalar_type_name(), *ty));
    }
    let m = b.module(module_type, "numpy", numpy_attrs);
    modules.insert("numpy".to_owned(), m);
    let m = b.module(
        module_type,
        "pandas._libs.missing",
        vec![("NA", na), ("NAType", na_type)],
    );
    modules.insert("pandas._libs.missing".to_owned(), m);

    let builtins = Builtins {
        object,
        type_,
        none_type,
        bool_,
        int,
        float,
        complex,
        str_,
        bytes,
        bytearray,
        list,
        tuple,
        dict,
        function,
        method,
        property,
        module,
        capsule,
        traceback,
        iterator,
        base_exception,
        exception,
        keyboard_interrupt,
        stop_iteration,
        type_error,
        value_error,
        runtime_error,
        attribute_error,
        key_error,
        index_error,
        import_error,
        ndarray,
        generic,
        scalar_types,
        na_type,
        none,
        true_,
        false_,
        na,
        nan,
    };
    (b.heap, builtins, modules)
}

/// Fetch positional argument `index` or raise `TypeError`.
pub fn expect_arg(
    interp: &Interpreter,
    args: &[ObjectId],
    index: usize,
    func: &str,
) -> GuestResult<ObjectId> {
    args.get(index).copied().ok_or_else(|| {
        let te = interp.builtins().type_error;
        interp.raise(
            te,
            &format!("{}() missing required positional argument {}", func, index),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_mro_goes_through_int() {
        let (heap, b, _) = bootstrap();
        match heap.get(b.bool_) {
            Some(ObjectData::Type(t)) => assert_eq!(t.mro, vec![b.bool_, b.int, b.object]),
            _ => panic!("bool is not a type"),
        }
    }

    #[test]
    fn test_linearize_diamond() {
        let (heap, b, _) = bootstrap();
        // KeyError and IndexError share LookupError
        let merged = linearize(&heap, &[b.key_error, b.index_error]).unwrap();
        let names: Vec<String> = merged
            .iter()
            .map(|id| match heap.get(*id) {
                Some(ObjectData::Type(t)) => t.name.clone(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(
            names,
            vec!["KeyError", "IndexError", "LookupError", "Exception", "BaseException", "object"]
        );
    }

    #[test]
    fn test_modules_registered() {
        let (_, _, modules) = bootstrap();
        for name in ["builtins", "inspect", "traceback", "numpy", "pandas._libs.missing"] {
            assert!(modules.contains_key(name), "missing module {}", name);
        }
    }
}
