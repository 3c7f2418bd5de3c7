//! N-dimensional arrays and array scalars
//!
//! Arrays carry a dtype (identified by the same integer type numbers the
//! array library uses on the wire), a shape, a memory order and a shared
//! buffer. Numeric buffers are `Arc` slices so an array can be a view over
//! memory owned by someone else; `base` then names the object keeping that
//! memory alive.

use std::sync::Arc;

use num_complex::{Complex32, Complex64};

use crate::error::HeapError;
use crate::object::ObjectId;

// ============================================================================
// DType
// ============================================================================

/// Array element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    LongLong,
    ULongLong,
    Float32,
    Float64,
    LongDouble,
    Complex64,
    Complex128,
    CLongDouble,
    Object,
    Bytes,
    Unicode,
    Void,
    Datetime,
    Timedelta,
    Float16,
}

/// Every dtype, in type-number order.
pub const ALL_DTYPES: [DType; 24] = [
    DType::Bool,
    DType::Int8,
    DType::UInt8,
    DType::Int16,
    DType::UInt16,
    DType::Int32,
    DType::UInt32,
    DType::Int64,
    DType::UInt64,
    DType::LongLong,
    DType::ULongLong,
    DType::Float32,
    DType::Float64,
    DType::LongDouble,
    DType::Complex64,
    DType::Complex128,
    DType::CLongDouble,
    DType::Object,
    DType::Bytes,
    DType::Unicode,
    DType::Void,
    DType::Datetime,
    DType::Timedelta,
    DType::Float16,
];

impl DType {
    /// Wire type number.
    pub fn typenum(self) -> i32 {
        match self {
            DType::Bool => 0,
            DType::Int8 => 1,
            DType::UInt8 => 2,
            DType::Int16 => 3,
            DType::UInt16 => 4,
            DType::Int32 => 5,
            DType::UInt32 => 6,
            DType::Int64 => 7,
            DType::UInt64 => 8,
            DType::LongLong => 9,
            DType::ULongLong => 10,
            DType::Float32 => 11,
            DType::Float64 => 12,
            DType::LongDouble => 13,
            DType::Complex64 => 14,
            DType::Complex128 => 15,
            DType::CLongDouble => 16,
            DType::Object => 17,
            DType::Bytes => 18,
            DType::Unicode => 19,
            DType::Void => 20,
            DType::Datetime => 21,
            DType::Timedelta => 22,
            DType::Float16 => 23,
        }
    }

    /// Look up a dtype by wire type number.
    pub fn from_typenum(typenum: i32) -> Option<DType> {
        usize::try_from(typenum)
            .ok()
            .and_then(|i| ALL_DTYPES.get(i))
            .copied()
    }

    /// Dtype name as the array library spells it.
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int8 => "int8",
            DType::UInt8 => "uint8",
            DType::Int16 => "int16",
            DType::UInt16 => "uint16",
            DType::Int32 => "int32",
            DType::UInt32 => "uint32",
            DType::Int64 => "int64",
            DType::UInt64 => "uint64",
            DType::LongLong => "longlong",
            DType::ULongLong => "ulonglong",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::LongDouble => "longdouble",
            DType::Complex64 => "complex64",
            DType::Complex128 => "complex128",
            DType::CLongDouble => "clongdouble",
            DType::Object => "object",
            DType::Bytes => "bytes",
            DType::Unicode => "str",
            DType::Void => "void",
            DType::Datetime => "datetime64",
            DType::Timedelta => "timedelta64",
            DType::Float16 => "float16",
        }
    }

    /// Class name of the matching array scalar type.
    pub fn scalar_type_name(self) -> &'static str {
        match self {
            DType::Bool => "bool_",
            DType::Object => "object_",
            DType::Bytes => "bytes_",
            DType::Unicode => "str_",
            other => other.name(),
        }
    }

    /// Physical storage backing this dtype.
    pub fn storage(self) -> StorageKind {
        match self {
            DType::Bool => StorageKind::Bool,
            DType::Int32 => StorageKind::I32,
            DType::Int8
            | DType::Int16
            | DType::Int64
            | DType::LongLong
            | DType::Datetime
            | DType::Timedelta => StorageKind::I64,
            DType::UInt8 | DType::UInt16 | DType::UInt32 | DType::UInt64 | DType::ULongLong => {
                StorageKind::U64
            }
            DType::Float16 | DType::Float32 => StorageKind::F32,
            DType::Float64 | DType::LongDouble => StorageKind::F64,
            DType::Complex64 => StorageKind::C64,
            DType::Complex128 | DType::CLongDouble => StorageKind::C128,
            DType::Bytes | DType::Void => StorageKind::Bytes,
            DType::Unicode => StorageKind::Unicode,
            DType::Object => StorageKind::Object,
        }
    }

    /// True for the fixed-width byte and unicode string dtypes.
    pub fn is_string(self) -> bool {
        matches!(self, DType::Bytes | DType::Unicode)
    }
}

/// Memory order of an array buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Row-major
    C,
    /// Column-major
    Fortran,
}

// ============================================================================
// Buffers
// ============================================================================

/// Storage kind of an [`ArrayBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Bool,
    I32,
    I64,
    U64,
    F32,
    F64,
    C64,
    C128,
    Bytes,
    Unicode,
    Object,
}

impl StorageKind {
    fn name(self) -> &'static str {
        match self {
            StorageKind::Bool => "bool",
            StorageKind::I32 => "i32",
            StorageKind::I64 => "i64",
            StorageKind::U64 => "u64",
            StorageKind::F32 => "f32",
            StorageKind::F64 => "f64",
            StorageKind::C64 => "c64",
            StorageKind::C128 => "c128",
            StorageKind::Bytes => "bytes",
            StorageKind::Unicode => "unicode",
            StorageKind::Object => "object",
        }
    }
}

/// Element storage of an array.
///
/// Object buffers hold owned references to their elements; the heap releases
/// them when the array is freed.
#[derive(Debug, Clone)]
pub enum ArrayBuffer {
    Bool(Arc<[bool]>),
    I32(Arc<[i32]>),
    I64(Arc<[i64]>),
    U64(Arc<[u64]>),
    F32(Arc<[f32]>),
    F64(Arc<[f64]>),
    C64(Arc<[Complex32]>),
    C128(Arc<[Complex64]>),
    Bytes(Arc<[Vec<u8>]>),
    Unicode(Arc<[String]>),
    Object(Vec<ObjectId>),
}

impl ArrayBuffer {
    /// Storage kind of this buffer.
    pub fn kind(&self) -> StorageKind {
        match self {
            ArrayBuffer::Bool(_) => StorageKind::Bool,
            ArrayBuffer::I32(_) => StorageKind::I32,
            ArrayBuffer::I64(_) => StorageKind::I64,
            ArrayBuffer::U64(_) => StorageKind::U64,
            ArrayBuffer::F32(_) => StorageKind::F32,
            ArrayBuffer::F64(_) => StorageKind::F64,
            ArrayBuffer::C64(_) => StorageKind::C64,
            ArrayBuffer::C128(_) => StorageKind::C128,
            ArrayBuffer::Bytes(_) => StorageKind::Bytes,
            ArrayBuffer::Unicode(_) => StorageKind::Unicode,
            ArrayBuffer::Object(_) => StorageKind::Object,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            ArrayBuffer::Bool(b) => b.len(),
            ArrayBuffer::I32(b) => b.len(),
            ArrayBuffer::I64(b) => b.len(),
            ArrayBuffer::U64(b) => b.len(),
            ArrayBuffer::F32(b) => b.len(),
            ArrayBuffer::F64(b) => b.len(),
            ArrayBuffer::C64(b) => b.len(),
            ArrayBuffer::C128(b) => b.len(),
            ArrayBuffer::Bytes(b) => b.len(),
            ArrayBuffer::Unicode(b) => b.len(),
            ArrayBuffer::Object(b) => b.len(),
        }
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_complex(&self) -> Option<Vec<Complex64>> {
        let out = match self {
            ArrayBuffer::Bool(b) => b.iter().map(|&v| Complex64::new(v as u8 as f64, 0.0)).collect(),
            ArrayBuffer::I32(b) => b.iter().map(|&v| Complex64::new(v as f64, 0.0)).collect(),
            ArrayBuffer::I64(b) => b.iter().map(|&v| Complex64::new(v as f64, 0.0)).collect(),
            ArrayBuffer::U64(b) => b.iter().map(|&v| Complex64::new(v as f64, 0.0)).collect(),
            ArrayBuffer::F32(b) => b.iter().map(|&v| Complex64::new(v as f64, 0.0)).collect(),
            ArrayBuffer::F64(b) => b.iter().map(|&v| Complex64::new(v, 0.0)).collect(),
            ArrayBuffer::C64(b) => b.iter().map(|v| Complex64::new(v.re as f64, v.im as f64)).collect(),
            ArrayBuffer::C128(b) => b.to_vec(),
            _ => return None,
        };
        Some(out)
    }

    fn to_f64(&self) -> Option<Vec<f64>> {
        let out = match self {
            ArrayBuffer::Bool(b) => b.iter().map(|&v| v as u8 as f64).collect(),
            ArrayBuffer::I32(b) => b.iter().map(|&v| v as f64).collect(),
            ArrayBuffer::I64(b) => b.iter().map(|&v| v as f64).collect(),
            ArrayBuffer::U64(b) => b.iter().map(|&v| v as f64).collect(),
            ArrayBuffer::F32(b) => b.iter().map(|&v| v as f64).collect(),
            ArrayBuffer::F64(b) => b.to_vec(),
            ArrayBuffer::C64(b) => b.iter().map(|v| v.re as f64).collect(),
            ArrayBuffer::C128(b) => b.iter().map(|v| v.re).collect(),
            _ => return None,
        };
        Some(out)
    }

    fn to_i64(&self) -> Option<Vec<i64>> {
        let out = match self {
            ArrayBuffer::Bool(b) => b.iter().map(|&v| v as i64).collect(),
            ArrayBuffer::I32(b) => b.iter().map(|&v| v as i64).collect(),
            ArrayBuffer::I64(b) => b.to_vec(),
            ArrayBuffer::U64(b) => b.iter().map(|&v| v as i64).collect(),
            ArrayBuffer::F32(b) => b.iter().map(|&v| v as i64).collect(),
            ArrayBuffer::F64(b) => b.iter().map(|&v| v as i64).collect(),
            ArrayBuffer::C64(b) => b.iter().map(|v| v.re as i64).collect(),
            ArrayBuffer::C128(b) => b.iter().map(|v| v.re as i64).collect(),
            _ => return None,
        };
        Some(out)
    }

    fn convert(&self, target: StorageKind) -> Option<ArrayBuffer> {
        if self.kind() == target {
            return Some(self.clone());
        }
        let out = match target {
            StorageKind::Bool => {
                ArrayBuffer::Bool(self.to_complex()?.iter().map(|v| v.re != 0.0 || v.im != 0.0).collect())
            }
            StorageKind::I32 => ArrayBuffer::I32(self.to_i64()?.into_iter().map(|v| v as i32).collect()),
            StorageKind::I64 => ArrayBuffer::I64(self.to_i64()?.into()),
            StorageKind::U64 => ArrayBuffer::U64(self.to_i64()?.into_iter().map(|v| v as u64).collect()),
            StorageKind::F32 => ArrayBuffer::F32(self.to_f64()?.into_iter().map(|v| v as f32).collect()),
            StorageKind::F64 => ArrayBuffer::F64(self.to_f64()?.into()),
            StorageKind::C64 => ArrayBuffer::C64(
                self.to_complex()?
                    .into_iter()
                    .map(|v| Complex32::new(v.re as f32, v.im as f32))
                    .collect(),
            ),
            StorageKind::C128 => ArrayBuffer::C128(self.to_complex()?.into()),
            StorageKind::Bytes | StorageKind::Unicode | StorageKind::Object => return None,
        };
        Some(out)
    }

    fn permuted(&self, perm: &[usize]) -> ArrayBuffer {
        fn pick<T: Clone>(src: &[T], perm: &[usize]) -> Arc<[T]> {
            perm.iter().map(|&i| src[i].clone()).collect()
        }
        match self {
            ArrayBuffer::Bool(b) => ArrayBuffer::Bool(pick(b, perm)),
            ArrayBuffer::I32(b) => ArrayBuffer::I32(pick(b, perm)),
            ArrayBuffer::I64(b) => ArrayBuffer::I64(pick(b, perm)),
            ArrayBuffer::U64(b) => ArrayBuffer::U64(pick(b, perm)),
            ArrayBuffer::F32(b) => ArrayBuffer::F32(pick(b, perm)),
            ArrayBuffer::F64(b) => ArrayBuffer::F64(pick(b, perm)),
            ArrayBuffer::C64(b) => ArrayBuffer::C64(pick(b, perm)),
            ArrayBuffer::C128(b) => ArrayBuffer::C128(pick(b, perm)),
            ArrayBuffer::Bytes(b) => ArrayBuffer::Bytes(pick(b, perm)),
            ArrayBuffer::Unicode(b) => ArrayBuffer::Unicode(pick(b, perm)),
            ArrayBuffer::Object(b) => ArrayBuffer::Object(perm.iter().map(|&i| b[i]).collect()),
        }
    }
}

/// For each column-major position, the row-major position holding the same element.
pub fn fortran_permutation(shape: &[usize]) -> Vec<usize> {
    let total: usize = shape.iter().product();
    let mut c_strides = vec![1usize; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        c_strides[axis] = c_strides[axis + 1] * shape[axis + 1];
    }
    let mut perm = Vec::with_capacity(total);
    let mut index = vec![0usize; shape.len()];
    for _ in 0..total {
        perm.push(index.iter().zip(&c_strides).map(|(i, s)| i * s).sum());
        for (axis, extent) in shape.iter().enumerate() {
            index[axis] += 1;
            if index[axis] < *extent {
                break;
            }
            index[axis] = 0;
        }
    }
    perm
}

// ============================================================================
// NdArray
// ============================================================================

/// An n-dimensional array.
#[derive(Debug, Clone)]
pub struct NdArray {
    dtype: DType,
    shape: Vec<usize>,
    order: Order,
    buffer: ArrayBuffer,
    base: Option<ObjectId>,
    owns_data: bool,
}

impl NdArray {
    /// Create an array that owns its buffer.
    pub fn new(
        dtype: DType,
        shape: Vec<usize>,
        order: Order,
        buffer: ArrayBuffer,
    ) -> Result<Self, HeapError> {
        let expected: usize = shape.iter().product();
        if buffer.len() != expected {
            return Err(HeapError::ShapeMismatch {
                shape,
                expected,
                got: buffer.len(),
            });
        }
        if dtype.storage() != buffer.kind() {
            return Err(HeapError::StorageMismatch {
                dtype: dtype.name(),
                storage: buffer.kind().name(),
            });
        }
        Ok(Self {
            dtype,
            shape,
            order,
            buffer,
            base: None,
            owns_data: true,
        })
    }

    /// Create a view over memory kept alive by `base`.
    ///
    /// The returned array takes over one reference to `base`.
    pub fn view(
        dtype: DType,
        shape: Vec<usize>,
        order: Order,
        buffer: ArrayBuffer,
        base: ObjectId,
    ) -> Result<Self, HeapError> {
        let mut array = Self::new(dtype, shape, order, buffer)?;
        array.base = Some(base);
        array.owns_data = false;
        Ok(array)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn order(&self) -> Order {
        self.order
    }

    pub fn buffer(&self) -> &ArrayBuffer {
        &self.buffer
    }

    /// Object keeping a borrowed buffer alive.
    pub fn base(&self) -> Option<ObjectId> {
        self.base
    }

    /// True when the array allocated its own buffer.
    pub fn owns_data(&self) -> bool {
        self.owns_data
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Cast into `dtype` with the given memory order.
    ///
    /// Shares the buffer when nothing changes. Object element ids in the
    /// result are *borrowed*; the caller must take references before storing
    /// the array on the heap.
    pub fn cast(&self, dtype: DType, order: Order) -> Result<NdArray, HeapError> {
        let target = dtype.storage();
        let buffer = match (self.buffer.kind(), target) {
            (from, to) if from == to => self.buffer.clone(),
            (StorageKind::Bytes | StorageKind::Unicode | StorageKind::Object, _)
            | (_, StorageKind::Bytes | StorageKind::Unicode | StorageKind::Object) => {
                return Err(HeapError::UnsupportedCast {
                    from: self.dtype.name(),
                    to: dtype.name(),
                })
            }
            _ => self.buffer.convert(target).ok_or(HeapError::UnsupportedCast {
                from: self.dtype.name(),
                to: dtype.name(),
            })?,
        };
        let needs_reorder = self.order != order && self.shape.iter().filter(|&&d| d > 1).count() > 1;
        let buffer = if needs_reorder {
            let perm = match order {
                Order::Fortran => fortran_permutation(&self.shape),
                Order::C => invert(&fortran_permutation(&self.shape)),
            };
            buffer.permuted(&perm)
        } else {
            buffer
        };
        Ok(NdArray {
            dtype,
            shape: self.shape.clone(),
            order,
            buffer,
            base: None,
            owns_data: true,
        })
    }
}

fn invert(perm: &[usize]) -> Vec<usize> {
    let mut out = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        out[p] = i;
    }
    out
}

// ============================================================================
// Array scalars
// ============================================================================

/// Payload of an array scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Complex(Complex64),
    Bytes(Vec<u8>),
    Unicode(String),
}

/// A zero-dimensional array element boxed as its own object.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayScalar {
    pub dtype: DType,
    pub value: ScalarValue,
}

impl ArrayScalar {
    pub fn new(dtype: DType, value: ScalarValue) -> Self {
        Self { dtype, value }
    }

    /// Value as a double; `None` for string payloads.
    pub fn to_f64(&self) -> Option<f64> {
        match &self.value {
            ScalarValue::Bool(b) => Some(*b as u8 as f64),
            ScalarValue::Int(i) => Some(*i as f64),
            ScalarValue::UInt(u) => Some(*u as f64),
            ScalarValue::Float(f) => Some(*f),
            ScalarValue::Complex(c) => Some(c.re),
            ScalarValue::Bytes(_) | ScalarValue::Unicode(_) => None,
        }
    }

    /// Value as a long integer; `None` for string payloads.
    pub fn to_i64(&self) -> Option<i64> {
        match &self.value {
            ScalarValue::Bool(b) => Some(*b as i64),
            ScalarValue::Int(i) => Some(*i),
            ScalarValue::UInt(u) => Some(*u as i64),
            ScalarValue::Float(f) => Some(*f as i64),
            ScalarValue::Complex(c) => Some(c.re as i64),
            ScalarValue::Bytes(_) | ScalarValue::Unicode(_) => None,
        }
    }

    /// Value as a complex; `None` for string payloads.
    pub fn to_complex(&self) -> Option<Complex64> {
        match &self.value {
            ScalarValue::Complex(c) => Some(*c),
            _ => self.to_f64().map(|re| Complex64::new(re, 0.0)),
        }
    }

    /// Truthiness; `None` for string payloads.
    pub fn to_bool(&self) -> Option<bool> {
        self.to_complex().map(|c| c.re != 0.0 || c.im != 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typenum_roundtrip() {
        for dtype in ALL_DTYPES {
            assert_eq!(DType::from_typenum(dtype.typenum()), Some(dtype));
        }
        assert_eq!(DType::from_typenum(24), None);
        assert_eq!(DType::from_typenum(-1), None);
    }

    #[test]
    fn test_fortran_permutation() {
        // 2x3 row-major: [[0,1,2],[3,4,5]] -> column-major order 0,3,1,4,2,5
        assert_eq!(fortran_permutation(&[2, 3]), vec![0, 3, 1, 4, 2, 5]);
        assert_eq!(fortran_permutation(&[4]), vec![0, 1, 2, 3]);
        assert_eq!(fortran_permutation(&[]), vec![0]);
    }

    #[test]
    fn test_cast_to_fortran_reorders() {
        let data: Arc<[i32]> = Arc::from(vec![0, 1, 2, 3, 4, 5]);
        let array = NdArray::new(DType::Int32, vec![2, 3], Order::C, ArrayBuffer::I32(data)).unwrap();
        let cast = array.cast(DType::Float64, Order::Fortran).unwrap();
        match cast.buffer() {
            ArrayBuffer::F64(v) => assert_eq!(&v[..], &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]),
            other => panic!("unexpected buffer {:?}", other.kind()),
        }
        assert_eq!(cast.order(), Order::Fortran);
    }

    #[test]
    fn test_cast_shares_buffer_when_unchanged() {
        let data: Arc<[f64]> = Arc::from(vec![1.0, 2.0]);
        let array =
            NdArray::new(DType::Float64, vec![2], Order::Fortran, ArrayBuffer::F64(data.clone())).unwrap();
        let cast = array.cast(DType::Float64, Order::Fortran).unwrap();
        match cast.buffer() {
            ArrayBuffer::F64(v) => assert!(Arc::ptr_eq(v, &data)),
            _ => panic!("expected f64 buffer"),
        }
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let data: Arc<[f64]> = Arc::from(vec![1.0, 2.0, 3.0]);
        let err = NdArray::new(DType::Float64, vec![2, 2], Order::C, ArrayBuffer::F64(data)).unwrap_err();
        assert!(matches!(err, HeapError::ShapeMismatch { expected: 4, got: 3, .. }));
    }

    #[test]
    fn test_string_cast_to_number_rejected() {
        let data: Arc<[String]> = Arc::from(vec!["a".to_string()]);
        let array = NdArray::new(DType::Unicode, vec![1], Order::C, ArrayBuffer::Unicode(data)).unwrap();
        assert!(array.cast(DType::Float64, Order::Fortran).is_err());
        assert!(array.cast(DType::Unicode, Order::Fortran).is_ok());
    }
}
