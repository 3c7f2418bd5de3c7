//! HostValue — the Host interpreter's value model
//!
//! Every Host value is a vector, a list, a function or a reference to
//! something foreign. There are no true scalars: a length-1 vector is the
//! canonical scalar form. Atomic vectors share their storage through
//! `Arc<[T]>`, so handing a buffer to the Guest and back never copies.
//!
//! # Missing values
//!
//! ```text
//! logical / integer: i32::MIN
//! double:            NaN with low word 1954 (distinct from an ordinary NaN)
//! complex:           NA_real in both parts
//! character:         None
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use num_complex::Complex64;

use crate::error::HostError;
use crate::session::HostSession;

// ============================================================================
// Missing-value sentinels
// ============================================================================

/// Missing logical value.
pub const NA_LOGICAL: i32 = i32::MIN;

/// Missing integer value.
pub const NA_INTEGER: i32 = i32::MIN;

const NA_REAL_BITS: u64 = 0x7FF0_0000_0000_07A2;

/// Missing double value.
#[inline]
pub fn na_real() -> f64 {
    f64::from_bits(NA_REAL_BITS)
}

/// True only for the missing-value NaN, not for NaN in general.
#[inline]
pub fn is_na_real(x: f64) -> bool {
    x.is_nan() && (x.to_bits() & 0xFFFF_FFFF) == 1954
}

/// Missing complex value.
#[inline]
pub fn na_complex() -> Complex64 {
    Complex64::new(na_real(), na_real())
}

// ============================================================================
// Vectors
// ============================================================================

/// An atomic vector with optional `dim` metadata (column-major).
#[derive(Clone, PartialEq)]
pub struct Vector<T> {
    data: Arc<[T]>,
    dim: Option<Vec<usize>>,
}

impl<T> Vector<T> {
    /// Wrap shared storage without copying.
    pub fn from_shared(data: Arc<[T]>) -> Self {
        Self { data, dim: None }
    }

    /// Attach array dimensions. The product must equal the length.
    pub fn with_dim(mut self, dim: Vec<usize>) -> Result<Self, HostError> {
        let expected: usize = dim.iter().product();
        if expected != self.data.len() {
            return Err(HostError::Stop(format!(
                "dims [product {}] do not match the length of object [{}]",
                expected,
                self.data.len()
            )));
        }
        self.dim = Some(dim);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// The shared buffer backing this vector.
    pub fn shared(&self) -> &Arc<[T]> {
        &self.data
    }

    pub fn dim(&self) -> Option<&[usize]> {
        self.dim.as_deref()
    }
}

impl<T: Clone> Vector<T> {
    /// Length-1 vector.
    pub fn scalar(value: T) -> Self {
        Self::from_shared(Arc::from(vec![value]))
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.data.get(index).cloned()
    }
}

impl<T> From<Vec<T>> for Vector<T> {
    fn from(values: Vec<T>) -> Self {
        Self::from_shared(Arc::from(values))
    }
}

impl<T: fmt::Debug> fmt::Debug for Vector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_list();
        s.entries(self.data.iter());
        s.finish()?;
        if let Some(dim) = &self.dim {
            write!(f, " dim={:?}", dim)?;
        }
        Ok(())
    }
}

// ============================================================================
// Strings
// ============================================================================

/// Declared encoding of a character element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    /// The session's native encoding (byte strings from the Guest).
    Native,
}

/// One element of a character vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostString {
    pub text: String,
    pub encoding: Encoding,
}

impl HostString {
    pub fn utf8(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            encoding: Encoding::Utf8,
        }
    }

    pub fn native(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            encoding: Encoding::Native,
        }
    }
}

// ============================================================================
// Lists, closures and foreign references
// ============================================================================

/// Class of a list holding equal-length columns.
pub const DATA_FRAME_CLASS: &str = "data.frame";

/// Generic (recursive) vector, optionally named.
#[derive(Debug, Clone, Default)]
pub struct HostList {
    pub items: Vec<HostValue>,
    /// Same length as `items` when present. Duplicates are allowed.
    pub names: Option<Vec<String>>,
    /// Array dimensions (column-major), as for atomic vectors.
    pub dim: Option<Vec<usize>>,
    /// Class attribute, most specific first.
    pub classes: Vec<String>,
}

impl HostList {
    pub fn unnamed(items: Vec<HostValue>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn named(entries: Vec<(String, HostValue)>) -> Self {
        let (names, items) = entries.into_iter().unzip();
        Self {
            items,
            names: Some(names),
            ..Self::default()
        }
    }

    /// A data frame from named columns. Every column must have the same
    /// length.
    pub fn data_frame(columns: Vec<(String, HostValue)>) -> Result<Self, HostError> {
        if let Some((first, rest)) = columns.split_first() {
            let rows = first.1.len();
            if let Some((name, _)) = rest.iter().find(|(_, c)| c.len() != rows) {
                return Err(HostError::Stop(format!(
                    "column '{}' does not have {} rows",
                    name, rows
                )));
            }
        }
        let mut list = Self::named(columns);
        list.classes = vec![DATA_FRAME_CLASS.to_owned()];
        Ok(list)
    }

    /// Attach array dimensions. The product must equal the length.
    pub fn with_dim(mut self, dim: Vec<usize>) -> Result<Self, HostError> {
        let expected: usize = dim.iter().product();
        if expected != self.items.len() {
            return Err(HostError::Stop(format!(
                "dims [product {}] do not match the length of object [{}]",
                expected,
                self.items.len()
            )));
        }
        self.dim = Some(dim);
        Ok(self)
    }

    pub fn is_data_frame(&self) -> bool {
        self.classes.iter().any(|c| c == DATA_FRAME_CLASS)
    }

    /// First element named `name`.
    pub fn get(&self, name: &str) -> Option<&HostValue> {
        let names = self.names.as_ref()?;
        names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.items.get(i))
    }
}

/// Arguments of a closure call.
#[derive(Debug, Clone, Default)]
pub struct HostArgs {
    pub positional: Vec<HostValue>,
    pub named: Vec<(String, HostValue)>,
}

impl HostArgs {
    pub fn positional(values: Vec<HostValue>) -> Self {
        Self {
            positional: values,
            named: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn named_arg(&self, name: &str) -> Option<&HostValue> {
        self.named.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Body of a Host closure.
pub type HostFn =
    Arc<dyn Fn(&HostSession, HostArgs) -> Result<HostValue, HostError> + Send + Sync>;

/// A Host function value.
#[derive(Clone)]
pub struct HostClosure {
    pub name: String,
    pub func: HostFn,
    /// Class attribute, most specific first.
    pub classes: Vec<String>,
    /// Set when the closure forwards to a foreign object.
    pub foreign: Option<ExternalRef>,
}

impl HostClosure {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&HostSession, HostArgs) -> Result<HostValue, HostError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_owned(),
            func: Arc::new(func),
            classes: Vec::new(),
            foreign: None,
        }
    }
}

impl fmt::Debug for HostClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostClosure")
            .field("name", &self.name)
            .field("classes", &self.classes)
            .field("foreign", &self.foreign.is_some())
            .finish()
    }
}

/// An opaque reference to a foreign object, with a class attribute.
///
/// The payload is owned by whoever created it; dropping the last clone
/// runs the payload's own `Drop`.
#[derive(Clone)]
pub struct ExternalRef {
    pub payload: Arc<dyn Any + Send + Sync>,
    pub classes: Vec<String>,
}

impl ExternalRef {
    pub fn new(payload: Arc<dyn Any + Send + Sync>, classes: Vec<String>) -> Self {
        Self { payload, classes }
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn inherits(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }
}

impl fmt::Debug for ExternalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<external {:?}>", self.classes)
    }
}

/// A raw address with no finalizer. Address 0 is the null pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalPtr {
    pub address: usize,
}

impl ExternalPtr {
    pub fn is_null(&self) -> bool {
        self.address == 0
    }
}

// ============================================================================
// HostValue
// ============================================================================

/// A Host interpreter value.
#[derive(Debug, Clone)]
pub enum HostValue {
    Null,
    Logical(Vector<i32>),
    Integer(Vector<i32>),
    Double(Vector<f64>),
    Complex(Vector<Complex64>),
    Character(Vector<Option<HostString>>),
    Raw(Arc<[u8]>),
    List(HostList),
    Closure(HostClosure),
    ExternalPtr(ExternalPtr),
    External(ExternalRef),
    /// An unevaluated call expression, kept in its deparsed form.
    Language(String),
}

impl HostValue {
    // ========================================================================
    // Scalar constructors
    // ========================================================================

    pub fn logical(value: bool) -> Self {
        HostValue::Logical(Vector::scalar(value as i32))
    }

    pub fn integer(value: i32) -> Self {
        HostValue::Integer(Vector::scalar(value))
    }

    pub fn double(value: f64) -> Self {
        HostValue::Double(Vector::scalar(value))
    }

    pub fn complex(value: Complex64) -> Self {
        HostValue::Complex(Vector::scalar(value))
    }

    pub fn string(value: &str) -> Self {
        HostValue::Character(Vector::scalar(Some(HostString::utf8(value))))
    }

    /// A length-1 logical NA.
    pub fn na() -> Self {
        HostValue::Logical(Vector::scalar(NA_LOGICAL))
    }

    pub fn strings<S: AsRef<str>>(values: &[S]) -> Self {
        HostValue::Character(Vector::from(
            values
                .iter()
                .map(|s| Some(HostString::utf8(s.as_ref())))
                .collect::<Vec<_>>(),
        ))
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// The Host's type name (`typeof`).
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Null => "NULL",
            HostValue::Logical(_) => "logical",
            HostValue::Integer(_) => "integer",
            HostValue::Double(_) => "double",
            HostValue::Complex(_) => "complex",
            HostValue::Character(_) => "character",
            HostValue::Raw(_) => "raw",
            HostValue::List(_) => "list",
            HostValue::Closure(_) => "closure",
            HostValue::ExternalPtr(_) | HostValue::External(_) => "externalptr",
            HostValue::Language(_) => "language",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    /// Length of the value; 1 for functions and references.
    pub fn len(&self) -> usize {
        match self {
            HostValue::Null => 0,
            HostValue::Logical(v) | HostValue::Integer(v) => v.len(),
            HostValue::Double(v) => v.len(),
            HostValue::Complex(v) => v.len(),
            HostValue::Character(v) => v.len(),
            HostValue::Raw(bytes) => bytes.len(),
            HostValue::List(list) => list.items.len(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `dim` of an atomic vector or a list.
    pub fn dim(&self) -> Option<&[usize]> {
        match self {
            HostValue::Logical(v) | HostValue::Integer(v) => v.dim(),
            HostValue::Double(v) => v.dim(),
            HostValue::Complex(v) => v.dim(),
            HostValue::Character(v) => v.dim(),
            HostValue::List(list) => list.dim.as_deref(),
            _ => None,
        }
    }

    /// Class attribute of the value.
    pub fn classes(&self) -> &[String] {
        match self {
            HostValue::Closure(c) => &c.classes,
            HostValue::External(r) => &r.classes,
            HostValue::List(list) => &list.classes,
            _ => &[],
        }
    }

    pub fn inherits(&self, class: &str) -> bool {
        self.classes().iter().any(|c| c == class)
    }

    /// True for a length-1 missing value of any atomic type.
    pub fn is_scalar_na(&self) -> bool {
        match self {
            HostValue::Logical(v) | HostValue::Integer(v) => {
                v.len() == 1 && v.as_slice()[0] == NA_INTEGER
            }
            HostValue::Double(v) => v.len() == 1 && is_na_real(v.as_slice()[0]),
            HostValue::Character(v) => v.len() == 1 && v.as_slice()[0].is_none(),
            _ => false,
        }
    }

    // ========================================================================
    // Scalar accessors
    // ========================================================================

    pub fn as_logical(&self) -> Option<bool> {
        match self {
            HostValue::Logical(v) if v.len() == 1 && v.as_slice()[0] != NA_LOGICAL => {
                Some(v.as_slice()[0] != 0)
            }
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i32> {
        match self {
            HostValue::Integer(v) if v.len() == 1 && v.as_slice()[0] != NA_INTEGER => {
                Some(v.as_slice()[0])
            }
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            HostValue::Double(v) if v.len() == 1 => Some(v.as_slice()[0]),
            _ => None,
        }
    }

    pub fn as_complex(&self) -> Option<Complex64> {
        match self {
            HostValue::Complex(v) if v.len() == 1 => Some(v.as_slice()[0]),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Character(v) if v.len() == 1 => {
                v.as_slice()[0].as_ref().map(|s| s.text.as_str())
            }
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&HostList> {
        match self {
            HostValue::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_external(&self) -> Option<&ExternalRef> {
        match self {
            HostValue::External(r) => Some(r),
            _ => None,
        }
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::logical(value)
    }
}

impl From<i32> for HostValue {
    fn from(value: i32) -> Self {
        HostValue::integer(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::double(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::string(value)
    }
}

impl From<Complex64> for HostValue {
    fn from(value: Complex64) -> Self {
        HostValue::complex(value)
    }
}

impl From<HostList> for HostValue {
    fn from(list: HostList) -> Self {
        HostValue::List(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_na_real_is_distinct_from_nan() {
        assert!(is_na_real(na_real()));
        assert!(!is_na_real(f64::NAN));
        assert!(na_real().is_nan());
    }

    #[test]
    fn test_dim_must_match_length() {
        let v = Vector::from(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(v.clone().with_dim(vec![2, 3]).is_ok());
        assert!(v.with_dim(vec![4, 2]).is_err());
    }

    #[test]
    fn test_scalar_accessors() {
        assert_eq!(HostValue::from(true).as_logical(), Some(true));
        assert_eq!(HostValue::integer(7).as_integer(), Some(7));
        assert_eq!(HostValue::integer(NA_INTEGER).as_integer(), None);
        assert_eq!(HostValue::from("x").as_str(), Some("x"));
        assert!(HostValue::na().is_scalar_na());
        assert!(HostValue::double(na_real()).is_scalar_na());
        assert!(!HostValue::double(f64::NAN).is_scalar_na());
    }

    #[test]
    fn test_named_list_keeps_duplicates() {
        let list = HostList::named(vec![
            ("a".into(), HostValue::integer(1)),
            ("a".into(), HostValue::integer(2)),
        ]);
        assert_eq!(list.items.len(), 2);
        assert_eq!(list.get("a").and_then(|v| v.as_integer()), Some(1));
    }

    #[test]
    fn test_list_dim_and_data_frame() {
        let list = HostList::unnamed(vec![HostValue::integer(1), HostValue::Null]);
        assert!(list.clone().with_dim(vec![3]).is_err());
        let value = HostValue::List(list.with_dim(vec![1, 2]).unwrap());
        assert_eq!(value.dim(), Some(&[1, 2][..]));

        let frame = HostList::data_frame(vec![
            ("x".into(), HostValue::Integer(vec![1, 2].into())),
            ("y".into(), HostValue::strings(&["a", "b"])),
        ])
        .unwrap();
        assert!(frame.is_data_frame());
        assert!(HostValue::List(frame).inherits(DATA_FRAME_CLASS));

        let ragged = HostList::data_frame(vec![
            ("x".into(), HostValue::Integer(vec![1, 2].into())),
            ("y".into(), HostValue::string("a")),
        ]);
        assert!(ragged.is_err());
    }

    #[test]
    fn test_shared_storage_is_not_copied() {
        let data: Arc<[f64]> = Arc::from(vec![1.0, 2.0]);
        let v = HostValue::Double(Vector::from_shared(data.clone()));
        let HostValue::Double(inner) = v.clone() else {
            panic!("expected double");
        };
        assert!(Arc::ptr_eq(inner.shared(), &data));
    }
}
