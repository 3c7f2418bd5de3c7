//! Object protocols: length, items, iteration, truth, comparison, `str`

use std::cmp::Ordering as CmpOrdering;

use super::Interpreter;
use crate::error::GuestResult;
use crate::heap::Heap;
use crate::ndarray::{ArrayBuffer, ScalarValue};
use crate::object::{ObjectData, ObjectId, SeqIter};

/// Rich comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// Value equality used for dict keys and `==`. Falls back to identity.
pub(crate) fn keys_equal(heap: &Heap, a: ObjectId, b: ObjectId) -> bool {
    if a == b {
        return true;
    }
    match (heap.get(a), heap.get(b)) {
        (Some(ObjectData::Str(x)), Some(ObjectData::Str(y))) => x == y,
        (Some(ObjectData::Bytes(x)), Some(ObjectData::Bytes(y))) => x == y,
        (Some(ObjectData::Tuple(x)), Some(ObjectData::Tuple(y))) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| keys_equal(heap, *p, *q))
        }
        (Some(x), Some(y)) => match (numeric(x), numeric(y)) {
            (Some(p), Some(q)) => p == q,
            _ => false,
        },
        _ => false,
    }
}

fn numeric(data: &ObjectData) -> Option<f64> {
    match data {
        ObjectData::Bool(b) => Some(*b as u8 as f64),
        ObjectData::Int(i) => Some(*i as f64),
        ObjectData::Float(f) => Some(*f),
        _ => None,
    }
}

fn format_float(value: f64) -> String {
    if value.is_nan() {
        "nan".to_owned()
    } else if value.is_infinite() {
        if value > 0.0 { "inf" } else { "-inf" }.to_owned()
    } else if value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

impl Interpreter {
    /// `len(obj)`.
    pub fn len(&self, id: ObjectId) -> GuestResult<usize> {
        let direct = self.with_object(id, |d| match d {
            ObjectData::Str(s) => Some(s.chars().count()),
            ObjectData::Bytes(b) | ObjectData::ByteArray(b) => Some(b.len()),
            ObjectData::List(items) | ObjectData::Tuple(items) => Some(items.len()),
            ObjectData::Dict(d) => Some(d.entries.len()),
            ObjectData::Array(a) if a.ndim() > 0 => Some(a.shape()[0]),
            _ => None,
        });
        if let Some(Some(n)) = direct {
            return Ok(n);
        }
        let ty = self.type_of(id);
        if self.type_has_attr(ty, "__len__") {
            let out = self.call_method(id, "__len__", &[], &[])?;
            let n = self.as_int(out);
            self.dec_ref(out);
            return match n {
                Some(n) if n >= 0 => Ok(n as usize),
                _ => Err(self.raise(
                    self.builtins.value_error,
                    "__len__() should return >= 0",
                )),
            };
        }
        Err(self.raise(
            self.builtins.type_error,
            &format!("object of type '{}' has no len()", self.type_name(ty)),
        ))
    }

    /// `obj[key]`. Returns a new reference.
    pub fn get_item(&self, id: ObjectId, key: ObjectId) -> GuestResult<ObjectId> {
        let index = self.as_int(key);
        let direct = self.with_object(id, |d| match d {
            ObjectData::List(items) | ObjectData::Tuple(items) => {
                let n = items.len() as i64;
                Some(index.and_then(|i| {
                    let i = if i < 0 { i + n } else { i };
                    (0..n).contains(&i).then(|| items[i as usize])
                }))
            }
            _ => None,
        });
        match direct {
            Some(Some(Some(item))) => {
                self.inc_ref(item);
                return Ok(item);
            }
            Some(Some(None)) => {
                return Err(self.raise(self.builtins.index_error, "index out of range"))
            }
            _ => {}
        }
        if self.dict_entries(id).is_some() {
            return match self.dict_get_item(id, key) {
                Some(value) => {
                    self.inc_ref(value);
                    Ok(value)
                }
                None => {
                    let shown = self.repr_of(key)?;
                    Err(self.raise(self.builtins.key_error, &shown))
                }
            };
        }
        let ty = self.type_of(id);
        if self.type_has_attr(ty, "__getitem__") {
            return self.call_method(id, "__getitem__", &[key], &[]);
        }
        Err(self.raise(
            self.builtins.type_error,
            &format!("'{}' object is not subscriptable", self.type_name(ty)),
        ))
    }

    /// `obj[index]` for sequences.
    pub fn sequence_item(&self, id: ObjectId, index: usize) -> GuestResult<ObjectId> {
        let key = self.new_int(index as i64);
        let result = self.get_item(id, key);
        self.dec_ref(key);
        result
    }

    /// `obj[key] = value`. Borrows `key` and `value`.
    pub fn set_item(&self, id: ObjectId, key: ObjectId, value: ObjectId) -> GuestResult<()> {
        if self.dict_entries(id).is_some() {
            return self.dict_set_item(id, key, value);
        }
        let ty = self.type_of(id);
        if self.type_has_attr(ty, "__setitem__") {
            let out = self.call_method(id, "__setitem__", &[key, value], &[])?;
            self.dec_ref(out);
            return Ok(());
        }
        Err(self.raise(
            self.builtins.type_error,
            &format!(
                "'{}' object does not support item assignment",
                self.type_name(ty)
            ),
        ))
    }

    /// Mapping protocol `items()`, as a new list of `(key, value)` tuples.
    pub fn mapping_items(&self, id: ObjectId) -> GuestResult<ObjectId> {
        if self.dict_entries(id).is_some() {
            return self.dict_items_list(id);
        }
        let items = self.call_method(id, "items", &[], &[])?;
        if self.list_items(items).is_some() {
            return Ok(items);
        }
        let result = self.collect_list(items);
        self.dec_ref(items);
        result
    }

    /// `list(iterable)`.
    pub fn collect_list(&self, iterable: ObjectId) -> GuestResult<ObjectId> {
        let iter = self.get_iter(iterable)?;
        let mut out = Vec::new();
        loop {
            match self.iter_next(iter) {
                Ok(Some(item)) => out.push(item),
                Ok(None) => break,
                Err(raised) => {
                    for item in out {
                        self.dec_ref(item);
                    }
                    self.dec_ref(iter);
                    return Err(raised);
                }
            }
        }
        self.dec_ref(iter);
        Ok(self.new_list(out))
    }

    /// `iter(obj)`.
    pub fn get_iter(&self, id: ObjectId) -> GuestResult<ObjectId> {
        let snapshot = self.with_object(id, |d| match d {
            ObjectData::List(items) | ObjectData::Tuple(items) => Some(items.clone()),
            ObjectData::Dict(d) => Some(d.entries.iter().map(|(k, _)| *k).collect()),
            _ => None,
        });
        if let Some(Some(items)) = snapshot {
            for item in &items {
                self.inc_ref(*item);
            }
            return Ok(self.alloc(
                self.builtins.iterator,
                ObjectData::Iterator(SeqIter { items, index: 0 }),
            ));
        }
        if let Some(s) = self.as_str(id) {
            let items = s
                .chars()
                .map(|c| self.new_str(c.encode_utf8(&mut [0; 4])))
                .collect();
            return Ok(self.alloc(
                self.builtins.iterator,
                ObjectData::Iterator(SeqIter { items, index: 0 }),
            ));
        }
        let ty = self.type_of(id);
        if self.type_has_attr(ty, "__iter__") {
            return self.call_method(id, "__iter__", &[], &[]);
        }
        Err(self.raise(
            self.builtins.type_error,
            &format!("'{}' object is not iterable", self.type_name(ty)),
        ))
    }

    /// Advance an iterator. `Ok(None)` means exhausted.
    pub fn iter_next(&self, iter: ObjectId) -> GuestResult<Option<ObjectId>> {
        let step = {
            let mut heap = self.heap.lock();
            match heap.get_mut(iter) {
                Some(ObjectData::Iterator(it)) => {
                    let next = it.items.get(it.index).copied();
                    if next.is_some() {
                        it.index += 1;
                    }
                    Some(next)
                }
                _ => None,
            }
        };
        if let Some(next) = step {
            return Ok(next);
        }
        let ty = self.type_of(iter);
        if !self.type_has_attr(ty, "__next__") {
            return Err(self.raise(
                self.builtins.type_error,
                &format!("'{}' object is not an iterator", self.type_name(ty)),
            ));
        }
        match self.call_method(iter, "__next__", &[], &[]) {
            Ok(item) => Ok(Some(item)),
            Err(raised) => {
                if self.err_matches(self.builtins.stop_iteration) {
                    self.err_clear();
                    Ok(None)
                } else {
                    Err(raised)
                }
            }
        }
    }

    /// Truth value.
    pub fn is_true(&self, id: ObjectId) -> GuestResult<bool> {
        let direct = self.with_object(id, |d| match d {
            ObjectData::None => Some(Ok(false)),
            ObjectData::Bool(b) => Some(Ok(*b)),
            ObjectData::Int(i) => Some(Ok(*i != 0)),
            ObjectData::Float(f) => Some(Ok(*f != 0.0)),
            ObjectData::Complex(c) => Some(Ok(c.re != 0.0 || c.im != 0.0)),
            ObjectData::Str(s) => Some(Ok(!s.is_empty())),
            ObjectData::Bytes(b) | ObjectData::ByteArray(b) => Some(Ok(!b.is_empty())),
            ObjectData::List(items) | ObjectData::Tuple(items) => Some(Ok(!items.is_empty())),
            ObjectData::Dict(d) => Some(Ok(!d.entries.is_empty())),
            ObjectData::ArrayScalar(s) => Some(Ok(s.to_bool().unwrap_or(true))),
            ObjectData::Array(a) if a.len() == 1 => Some(Ok(match a.buffer() {
                ArrayBuffer::Bool(v) => v[0],
                ArrayBuffer::F64(v) => v[0] != 0.0,
                ArrayBuffer::I32(v) => v[0] != 0,
                ArrayBuffer::I64(v) => v[0] != 0,
                _ => true,
            })),
            ObjectData::Array(_) => Some(Err(())),
            _ => None,
        });
        match direct {
            Some(Some(Ok(b))) => return Ok(b),
            Some(Some(Err(()))) => {
                return Err(self.raise(
                    self.builtins.value_error,
                    "The truth value of an array with more than one element is ambiguous",
                ))
            }
            _ => {}
        }
        let ty = self.type_of(id);
        if self.type_has_attr(ty, "__bool__") {
            let out = self.call_method(id, "__bool__", &[], &[])?;
            let b = self.as_bool(out).unwrap_or(false);
            self.dec_ref(out);
            return Ok(b);
        }
        if self.type_has_attr(ty, "__len__") {
            return Ok(self.len(id)? > 0);
        }
        Ok(true)
    }

    /// Rich comparison.
    pub fn rich_compare(&self, a: ObjectId, b: ObjectId, op: CompareOp) -> GuestResult<bool> {
        let ordering = {
            let heap = self.heap.lock();
            if matches!(op, CompareOp::Eq | CompareOp::Ne) {
                let eq = keys_equal(&heap, a, b);
                return Ok(if op == CompareOp::Eq { eq } else { !eq });
            }
            match (heap.get(a), heap.get(b)) {
                (Some(ObjectData::Str(x)), Some(ObjectData::Str(y))) => Some(x.cmp(y)),
                (Some(x), Some(y)) => match (numeric(x), numeric(y)) {
                    (Some(p), Some(q)) => p.partial_cmp(&q),
                    _ => None,
                },
                _ => None,
            }
        };
        match ordering {
            Some(ord) => Ok(match op {
                CompareOp::Lt => ord == CmpOrdering::Less,
                CompareOp::Le => ord != CmpOrdering::Greater,
                CompareOp::Gt => ord == CmpOrdering::Greater,
                CompareOp::Ge => ord != CmpOrdering::Less,
                CompareOp::Eq => ord == CmpOrdering::Equal,
                CompareOp::Ne => ord != CmpOrdering::Equal,
            }),
            None if self.is_numeric_nan_pair(a, b) => Ok(false),
            None => Err(self.raise(
                self.builtins.type_error,
                &format!(
                    "'{}' not supported between instances of '{}' and '{}'",
                    op.symbol(),
                    self.type_name(self.type_of(a)),
                    self.type_name(self.type_of(b))
                ),
            )),
        }
    }

    fn is_numeric_nan_pair(&self, a: ObjectId, b: ObjectId) -> bool {
        let heap = self.heap.lock();
        match (heap.get(a).and_then(numeric), heap.get(b).and_then(numeric)) {
            (Some(p), Some(q)) => p.is_nan() || q.is_nan(),
            _ => false,
        }
    }

    /// Identity token of an object, stable for its lifetime.
    pub fn object_id(&self, id: ObjectId) -> usize {
        id.index()
    }

    /// `str(obj)`.
    pub fn str_of(&self, id: ObjectId) -> GuestResult<String> {
        if let Some(s) = self.as_str(id) {
            return Ok(s);
        }
        let ty = self.type_of(id);
        if self.is_kind(id, self.builtins.base_exception) && !self.type_has_attr(ty, "__str__") {
            return self.exception_message(id);
        }
        if self.type_has_attr(ty, "__str__") {
            let out = self.call_method(id, "__str__", &[], &[])?;
            let s = self.as_str(out);
            self.dec_ref(out);
            return s.ok_or_else(|| {
                self.raise(self.builtins.type_error, "__str__ returned non-string")
            });
        }
        self.repr_of(id)
    }

    /// `repr(obj)`.
    pub fn repr_of(&self, id: ObjectId) -> GuestResult<String> {
        let ty = self.type_of(id);
        if self.type_has_attr(ty, "__repr__") {
            let out = self.call_method(id, "__repr__", &[], &[])?;
            let s = self.as_str(out);
            self.dec_ref(out);
            return s.ok_or_else(|| {
                self.raise(self.builtins.type_error, "__repr__ returned non-string")
            });
        }
        enum Shape {
            Done(String),
            Seq(Vec<ObjectId>, &'static str, &'static str),
            Generic,
        }
        let shape = self.with_object(id, |d| match d {
            ObjectData::None => Shape::Done("None".into()),
            ObjectData::Bool(b) => Shape::Done(if *b { "True" } else { "False" }.into()),
            ObjectData::Int(i) => Shape::Done(i.to_string()),
            ObjectData::Float(f) => Shape::Done(format_float(*f)),
            ObjectData::Complex(c) => Shape::Done(format!(
                "({}{}{}j)",
                format_float(c.re),
                if c.im < 0.0 { "" } else { "+" },
                format_float(c.im)
            )),
            ObjectData::Str(s) => Shape::Done(format!("'{}'", s)),
            ObjectData::Bytes(b) => Shape::Done(format!("b'{}'", String::from_utf8_lossy(b))),
            ObjectData::ByteArray(b) => {
                Shape::Done(format!("bytearray(b'{}')", String::from_utf8_lossy(b)))
            }
            ObjectData::List(items) => Shape::Seq(items.clone(), "[", "]"),
            ObjectData::Tuple(items) => Shape::Seq(items.clone(), "(", ")"),
            ObjectData::ArrayScalar(s) => Shape::Done(match &s.value {
                ScalarValue::Bool(b) => if *b { "True" } else { "False" }.into(),
                ScalarValue::Int(i) => i.to_string(),
                ScalarValue::UInt(u) => u.to_string(),
                ScalarValue::Float(f) => format_float(*f),
                ScalarValue::Complex(c) => format!("({}+{}j)", c.re, c.im),
                ScalarValue::Bytes(b) => format!("b'{}'", String::from_utf8_lossy(b)),
                ScalarValue::Unicode(u) => format!("'{}'", u),
            }),
            ObjectData::Type(t) => Shape::Done(if t.module == "builtins" {
                format!("<class '{}'>", t.name)
            } else {
                format!("<class '{}.{}'>", t.module, t.name)
            }),
            ObjectData::Module(m) => Shape::Done(format!("<module '{}'>", m.name)),
            ObjectData::NativeFunction(f) => Shape::Done(format!("<built-in function {}>", f.name)),
            ObjectData::Array(a) => Shape::Done(format!("array(shape={:?}, dtype={})", a.shape(), a.dtype().name())),
            _ => Shape::Generic,
        });
        match shape {
            Some(Shape::Done(s)) => Ok(s),
            Some(Shape::Seq(items, open, close)) => {
                let mut parts = Vec::with_capacity(items.len());
                for item in &items {
                    parts.push(self.repr_of(*item)?);
                }
                let trailing = if open == "(" && parts.len() == 1 { "," } else { "" };
                Ok(format!("{}{}{}{}", open, parts.join(", "), trailing, close))
            }
            _ => {
                let module = self.type_module(ty);
                let name = self.type_name(ty);
                Ok(format!("<{}.{} object at {:#x}>", module, name, id.index()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_len_of_builtins() {
        let interp = Interpreter::new();
        let s = interp.new_str("héllo");
        assert_eq!(interp.len(s).unwrap(), 5);
        let a = interp.new_int(1);
        let l = interp.new_list(vec![a]);
        assert_eq!(interp.len(l).unwrap(), 1);
        let n = interp.new_int(3);
        assert!(interp.len(n).is_err());
        interp.err_clear();
    }

    #[test]
    fn test_iterate_list_to_exhaustion() {
        let interp = Interpreter::new();
        let items = vec![interp.new_int(1), interp.new_int(2)];
        let list = interp.new_list(items);
        let it = interp.get_iter(list).unwrap();
        let mut seen = Vec::new();
        while let Some(item) = interp.iter_next(it).unwrap() {
            seen.push(interp.as_int(item).unwrap());
            interp.dec_ref(item);
        }
        assert_eq!(seen, vec![1, 2]);
        assert!(interp.iter_next(it).unwrap().is_none());
        interp.dec_ref(it);
        interp.dec_ref(list);
    }

    #[test]
    fn test_get_item_negative_and_missing() {
        let interp = Interpreter::new();
        let list = interp.new_list(vec![interp.new_int(10), interp.new_int(20)]);
        let last = interp.new_int(-1);
        let got = interp.get_item(list, last).unwrap();
        assert_eq!(interp.as_int(got), Some(20));

        let d = interp.new_dict();
        let k = interp.new_str("missing");
        assert!(interp.get_item(d, k).is_err());
        assert!(interp.err_matches(interp.builtins().key_error));
        interp.err_clear();
    }

    #[test]
    fn test_repr_and_compare() {
        let interp = Interpreter::new();
        let one = interp.new_int(1);
        let half = interp.new_float(0.5);
        let s = interp.new_str("x");
        let tup = interp.new_tuple(vec![s]);
        assert_eq!(interp.repr_of(tup).unwrap(), "('x',)");
        assert_eq!(interp.repr_of(half).unwrap(), "0.5");
        assert!(interp.rich_compare(half, one, CompareOp::Lt).unwrap());
        assert!(interp.rich_compare(one, one, CompareOp::Eq).unwrap());
        assert!(interp.rich_compare(one, tup, CompareOp::Lt).is_err());
        interp.err_clear();
    }
}
