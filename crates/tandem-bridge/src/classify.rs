//! Marshalling category of a guest value
//!
//! Checks run in a fixed order. Everything up to the list-subclass check
//! only inspects the heap; the mapping check may run guest code through
//! `__class__`, so it comes after every cheap test. Tabular columns and
//! frames are recognised by class name anywhere in the MRO.

use num_complex::Complex64;
use tandem_guest::{ArrayScalar, GuestResult, Interpreter, ObjectId, ScalarValue};
use tandem_host::Encoding;

use crate::capsule::is_host_capsule;
use crate::symbols::{
    SymbolCache, MISSING_MODULE, MISSING_TYPE_NAMES, TABULAR_COLUMN_TYPE, TABULAR_FRAME_TYPE,
};

/// A guest scalar with a direct host counterpart.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(Complex64),
    Str(String, Encoding),
}

/// How a guest value crosses to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Category {
    Null,
    Scalar(Scalar),
    /// Exact list; items are borrowed
    List(Vec<ObjectId>),
    /// Exact tuple without `_fields`; items are borrowed
    Tuple(Vec<ObjectId>),
    Dict,
    Array,
    /// Numeric array scalar, narrowed on conversion
    ArrayScalar(ArrayScalar),
    /// List subclass, read through the sequence protocol
    ListLike,
    Mapping,
    Callable,
    Iterator,
    ByteArray(Vec<u8>),
    /// The tabular missing-value sentinel
    MissingSentinel,
    TabularColumn,
    TabularFrame,
    HostCapsule,
    Opaque,
}

/// Classify `obj`. Fails only if guest code run by the mapping check raises.
pub fn classify(interp: &Interpreter, symbols: &SymbolCache, obj: ObjectId) -> GuestResult<Category> {
    let b = interp.builtins();

    if interp.is_none(obj) {
        return Ok(Category::Null);
    }
    if let Some(scalar) = scalar_of(interp, obj) {
        return Ok(Category::Scalar(scalar));
    }
    if interp.is_exact(obj, b.list) {
        return Ok(Category::List(interp.list_items(obj).unwrap_or_default()));
    }
    if interp.is_exact(obj, b.tuple) && !interp.has_attr(obj, "_fields") {
        return Ok(Category::Tuple(interp.tuple_items(obj).unwrap_or_default()));
    }
    if interp.is_exact(obj, b.dict) {
        return Ok(Category::Dict);
    }
    if interp.is_kind(obj, b.ndarray) {
        return Ok(Category::Array);
    }
    if let Some(scalar) = interp.array_scalar(obj) {
        return Ok(Category::ArrayScalar(scalar));
    }
    if interp.is_kind(obj, b.list) {
        return Ok(Category::ListLike);
    }
    if interp.is_instance(obj, b.dict)? {
        return Ok(Category::Mapping);
    }
    if interp.is_callable(obj) || interp.has_attr(obj, "__call__") {
        return Ok(Category::Callable);
    }
    if is_iterator(interp, obj) {
        return Ok(Category::Iterator);
    }
    if interp.is_kind(obj, b.bytearray) {
        return Ok(Category::ByteArray(interp.as_bytes(obj).unwrap_or_default()));
    }
    if is_missing_sentinel(interp, symbols, obj) {
        return Ok(Category::MissingSentinel);
    }
    if has_class(interp, obj, TABULAR_COLUMN_TYPE) {
        return Ok(Category::TabularColumn);
    }
    if has_class(interp, obj, TABULAR_FRAME_TYPE) {
        return Ok(Category::TabularFrame);
    }
    if is_host_capsule(interp, obj) {
        return Ok(Category::HostCapsule);
    }
    Ok(Category::Opaque)
}

/// Direct scalars, including string-valued array scalars. Byte strings are
/// not scalars.
pub(crate) fn scalar_of(interp: &Interpreter, obj: ObjectId) -> Option<Scalar> {
    if let Some(v) = interp.as_bool(obj) {
        return Some(Scalar::Bool(v));
    }
    if let Some(v) = interp.as_int(obj) {
        return Some(Scalar::Int(v));
    }
    if let Some(v) = interp.as_float(obj) {
        return Some(Scalar::Float(v));
    }
    if let Some(v) = interp.as_complex(obj) {
        return Some(Scalar::Complex(v));
    }
    if let Some(v) = interp.as_str(obj) {
        return Some(Scalar::Str(v, Encoding::Utf8));
    }
    match interp.array_scalar(obj)?.value {
        ScalarValue::Unicode(s) => Some(Scalar::Str(s, Encoding::Utf8)),
        ScalarValue::Bytes(raw) => Some(Scalar::Str(
            String::from_utf8_lossy(&raw).into_owned(),
            Encoding::Native,
        )),
        _ => None,
    }
}

/// Has `__iter__` and either `__next__` or `next`.
pub fn is_iterator(interp: &Interpreter, obj: ObjectId) -> bool {
    interp.has_attr(obj, "__iter__")
        && (interp.has_attr(obj, "__next__") || interp.has_attr(obj, "next"))
}

/// True for the tabular `NA` singleton (or any instance of its type).
pub fn is_missing_sentinel(interp: &Interpreter, symbols: &SymbolCache, obj: ObjectId) -> bool {
    let ty = interp.type_of(obj);
    if symbols.na_type(interp) == Some(ty) {
        return true;
    }
    interp.type_module(ty) == MISSING_MODULE
        && MISSING_TYPE_NAMES.contains(&interp.type_name(ty).as_str())
}

/// True if a class named `(module, name)` is in the MRO of `obj`'s type.
pub fn has_class(interp: &Interpreter, obj: ObjectId, (module, name): (&str, &str)) -> bool {
    interp
        .type_mro(interp.type_of(obj))
        .into_iter()
        .any(|ty| interp.type_name(ty) == name && interp.type_module(ty) == module)
}

/// Missing-like inside string and object arrays: guest null, the tabular
/// sentinel, or the array library's NaN singleton (by identity).
pub fn is_missing_like(interp: &Interpreter, symbols: &SymbolCache, obj: ObjectId) -> bool {
    if interp.is_none(obj) || is_missing_sentinel(interp, symbols, obj) {
        return true;
    }
    match symbols.nan(interp) {
        Ok(nan) => nan == obj,
        Err(_) => {
            interp.err_clear();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_guest::DType;

    fn check(interp: &Interpreter, obj: ObjectId) -> Category {
        let symbols = SymbolCache::new();
        classify(interp, &symbols, obj).unwrap()
    }

    #[test]
    fn test_scalars_before_containers() {
        let interp = Interpreter::new();
        assert_eq!(check(&interp, interp.none()), Category::Null);
        let t = interp.new_bool(true);
        assert_eq!(check(&interp, t), Category::Scalar(Scalar::Bool(true)));
        let s = interp.new_str("x");
        assert_eq!(check(&interp, s), Category::Scalar(Scalar::Str("x".into(), Encoding::Utf8)));
        let u = interp.new_array_scalar(ArrayScalar::new(
            DType::Unicode,
            ScalarValue::Unicode("cell".into()),
        ));
        assert_eq!(
            check(&interp, u),
            Category::Scalar(Scalar::Str("cell".into(), Encoding::Utf8))
        );
        interp.dec_ref(s);
        interp.dec_ref(u);
    }

    #[test]
    fn test_bytes_are_opaque() {
        let interp = Interpreter::new();
        let raw = interp.new_bytes(b"abc");
        assert_eq!(check(&interp, raw), Category::Opaque);
        let buf = interp.new_bytearray(b"abc");
        assert_eq!(check(&interp, buf), Category::ByteArray(b"abc".to_vec()));
        interp.dec_ref(raw);
        interp.dec_ref(buf);
    }

    #[test]
    fn test_named_tuple_is_not_a_tuple() {
        let interp = Interpreter::new();
        let b = interp.builtins().clone();
        let point = interp.new_type("Point", "geometry", &[b.tuple]).unwrap();
        let fields = interp.new_tuple(vec![interp.new_str("x"), interp.new_str("y")]);
        interp.set_attr(point, "_fields", fields).unwrap();
        interp.dec_ref(fields);

        let one = interp.new_int(1);
        let args = interp.new_list(vec![interp.new_int(3), interp.new_int(4)]);
        let p = interp.call(point, &[args], &[]).unwrap();
        assert_eq!(check(&interp, p), Category::Opaque);

        let plain = interp.new_tuple(vec![one]);
        assert!(matches!(check(&interp, plain), Category::Tuple(items) if items.len() == 1));
        interp.dec_ref(p);
        interp.dec_ref(args);
        interp.dec_ref(plain);
    }

    #[test]
    fn test_dict_subclass_is_mapping() {
        let interp = Interpreter::new();
        let b = interp.builtins().clone();
        let ordered = interp.new_type("OrderedDict", "collections", &[b.dict]).unwrap();
        let d = interp.call(ordered, &[], &[]).unwrap();
        assert_eq!(check(&interp, d), Category::Mapping);
        let exact = interp.new_dict();
        assert_eq!(check(&interp, exact), Category::Dict);
        interp.dec_ref(d);
        interp.dec_ref(exact);
    }

    #[test]
    fn test_iterator_and_callable() {
        let interp = Interpreter::new();
        let list = interp.new_list(vec![interp.new_int(1), interp.new_int(2)]);
        let it = interp.get_iter(list).unwrap();
        assert_eq!(check(&interp, it), Category::Iterator);
        let f = interp.new_native_function("f", |interp, _a, _k| Ok(interp.none()));
        assert_eq!(check(&interp, f), Category::Callable);
        interp.dec_ref(it);
        interp.dec_ref(list);
        interp.dec_ref(f);
    }

    #[test]
    fn test_tabular_classes_by_name() {
        let interp = Interpreter::new();
        let object = interp.builtins().object;
        let series = interp.new_type("Series", "pandas.core.series", &[object]).unwrap();
        let subclass = interp.new_type("GeoSeries", "geopandas", &[series]).unwrap();
        let frame = interp.new_type("DataFrame", "pandas.core.frame", &[object]).unwrap();
        let other = interp.new_type("Series", "statsmodels", &[object]).unwrap();

        let col = interp.new_instance(subclass);
        assert_eq!(check(&interp, col), Category::TabularColumn);
        let df = interp.new_instance(frame);
        assert_eq!(check(&interp, df), Category::TabularFrame);
        let unrelated = interp.new_instance(other);
        assert_eq!(check(&interp, unrelated), Category::Opaque);
        for id in [unrelated, df, col, other, frame, subclass, series] {
            interp.dec_ref(id);
        }
    }

    #[test]
    fn test_missing_sentinel() {
        let interp = Interpreter::new();
        let na = interp.builtins().na;
        assert_eq!(check(&interp, na), Category::MissingSentinel);
        let symbols = SymbolCache::new();
        assert!(is_missing_like(&interp, &symbols, interp.builtins().nan));
        let other_nan = interp.new_float(f64::NAN);
        assert!(!is_missing_like(&interp, &symbols, other_nan));
        interp.dec_ref(other_nan);
    }
}
