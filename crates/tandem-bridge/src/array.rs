//! Numeric array bridge
//!
//! Guest arrays are narrowed into one of four host kinds, cast into
//! column-major order and copied into a fresh host vector carrying `dim`.
//! In the other direction integer, double and complex host arrays become
//! guest views over the host's own buffer; a host capsule installed as the
//! array's base keeps that buffer rooted for as long as the view lives.
//! Logical, character and shaped list values are copied into fresh arrays.
//!
//! ```text
//! bool                                     -> logical
//! int8 uint8 int16 uint16 int32            -> integer
//! uint32 int64 uint64 longlong ulonglong
//! float16 float32 float64                  -> double
//! complex64 complex128                     -> complex
//! bytes str object                         -> unchanged
//! ```

use std::sync::Arc;

use tandem_guest::{ArrayBuffer, ArrayScalar, DType, NdArray, ObjectId, Order, ScalarValue};
use tandem_host::{HostList, HostString, HostValue, Vector};

use crate::capsule::new_host_capsule;
use crate::classify::is_missing_like;
use crate::error::{BridgeError, BridgeResult};
use crate::handle::OwnedRef;
use crate::Bridge;

/// Canonical dtype an array of `dtype` is cast to before crossing.
pub fn narrow(dtype: DType) -> BridgeResult<DType> {
    match dtype {
        DType::Bool => Ok(DType::Bool),
        DType::Int8 | DType::UInt8 | DType::Int16 | DType::UInt16 | DType::Int32 => {
            Ok(DType::Int32)
        }
        DType::UInt32
        | DType::Int64
        | DType::UInt64
        | DType::LongLong
        | DType::ULongLong
        | DType::Float16
        | DType::Float32
        | DType::Float64 => Ok(DType::Float64),
        DType::Complex64 | DType::Complex128 => Ok(DType::Complex128),
        DType::Bytes | DType::Unicode | DType::Object => Ok(dtype),
        other => Err(unsupported(other.typenum(), other.name())),
    }
}

/// Narrowing by wire type number; unknown numbers fail like unsupported kinds.
pub fn narrow_typenum(typenum: i32) -> BridgeResult<DType> {
    match DType::from_typenum(typenum) {
        Some(dtype) => narrow(dtype),
        None => Err(unsupported(typenum, "unknown")),
    }
}

fn unsupported(typenum: i32, name: &str) -> BridgeError {
    BridgeError::UnsupportedArrayKind {
        typenum,
        name: name.to_owned(),
    }
}

impl Bridge {
    // ========================================================================
    // Guest -> Host
    // ========================================================================

    pub(crate) fn array_to_host(&self, obj: ObjectId) -> BridgeResult<HostValue> {
        let interp = &*self.interp;
        let Some(array) = interp.array(obj) else {
            return Err(BridgeError::UnsupportedHostValue(format!(
                "{} is not an array",
                interp.type_name(interp.type_of(obj))
            )));
        };
        let target = narrow(array.dtype())?;
        let dim = if array.ndim() == 0 {
            vec![1]
        } else {
            array.shape().to_vec()
        };

        let cast = OwnedRef::from_result(interp, interp.array_cast(obj, target, Order::Fortran))
            .map_err(|_| self.fetch_error(false))?;
        let Some(cast_array) = interp.array(cast.id()) else {
            return Err(BridgeError::UnsupportedHostValue("array cast lost its buffer".into()));
        };

        let value = match cast_array.buffer() {
            ArrayBuffer::Bool(b) => HostValue::Logical(
                Vector::from(b.iter().map(|&v| v as i32).collect::<Vec<_>>()).with_dim(dim)?,
            ),
            ArrayBuffer::I32(b) => HostValue::Integer(Vector::from(b.to_vec()).with_dim(dim)?),
            ArrayBuffer::F64(b) => HostValue::Double(Vector::from(b.to_vec()).with_dim(dim)?),
            ArrayBuffer::C128(b) => HostValue::Complex(Vector::from(b.to_vec()).with_dim(dim)?),
            ArrayBuffer::Unicode(b) => HostValue::Character(
                Vector::from(
                    b.iter()
                        .map(|s| Some(HostString::utf8(s.as_str())))
                        .collect::<Vec<_>>(),
                )
                .with_dim(dim)?,
            ),
            ArrayBuffer::Bytes(b) => HostValue::Character(
                Vector::from(
                    b.iter()
                        .map(|s| Some(HostString::native(String::from_utf8_lossy(s))))
                        .collect::<Vec<_>>(),
                )
                .with_dim(dim)?,
            ),
            ArrayBuffer::Object(items) => self.object_array_to_host(items, dim)?,
            other => {
                return Err(unsupported(
                    cast_array.dtype().typenum(),
                    &format!("{:?}", other.kind()),
                ))
            }
        };
        Ok(value)
    }

    /// Character vector when every element is a string or missing, else a
    /// list of converted elements. Either way the result keeps the shape.
    fn object_array_to_host(&self, items: &[ObjectId], dim: Vec<usize>) -> BridgeResult<HostValue> {
        let interp = &*self.interp;
        let mut strings = Vec::with_capacity(items.len());
        for &item in items {
            if let Some(s) = interp.as_str(item) {
                strings.push(Some(HostString::utf8(s)));
            } else if let Some(ArrayScalar {
                value: ScalarValue::Unicode(s),
                ..
            }) = interp.array_scalar(item)
            {
                strings.push(Some(HostString::utf8(s)));
            } else if is_missing_like(interp, &self.symbols, item) {
                strings.push(None);
            } else {
                let converted = items
                    .iter()
                    .map(|&item| self.to_host(item, true))
                    .collect::<BridgeResult<Vec<_>>>()?;
                return Ok(HostValue::List(HostList::unnamed(converted).with_dim(dim)?));
            }
        }
        Ok(HostValue::Character(Vector::from(strings).with_dim(dim)?))
    }

    // ========================================================================
    // Host -> Guest
    // ========================================================================

    pub(crate) fn array_to_guest(&self, value: &HostValue, convert: bool) -> BridgeResult<OwnedRef<'_>> {
        let interp = &*self.interp;
        let shape = value.dim().map(<[usize]>::to_vec).unwrap_or_else(|| vec![value.len()]);

        let (dtype, buffer) = match value {
            HostValue::Integer(v) => (DType::Int32, ArrayBuffer::I32(v.shared().clone())),
            HostValue::Double(v) => (DType::Float64, ArrayBuffer::F64(v.shared().clone())),
            HostValue::Complex(v) => (DType::Complex128, ArrayBuffer::C128(v.shared().clone())),
            HostValue::Logical(v) => {
                let owned: Arc<[bool]> = v.as_slice().iter().map(|&x| x != 0).collect();
                let id = interp
                    .new_array_from(DType::Bool, shape, Order::Fortran, ArrayBuffer::Bool(owned))
                    .map_err(|_| self.fetch_error(false))?;
                return Ok(OwnedRef::new(interp, id));
            }
            HostValue::Character(v) => {
                let items = v
                    .as_slice()
                    .iter()
                    .map(|s| match s {
                        Some(s) => interp.new_str(&s.text),
                        None => {
                            let none = interp.none();
                            interp.inc_ref(none);
                            none
                        }
                    })
                    .collect();
                let id = interp
                    .new_array_from(DType::Object, shape, Order::Fortran, ArrayBuffer::Object(items))
                    .map_err(|_| self.fetch_error(false))?;
                return Ok(OwnedRef::new(interp, id));
            }
            HostValue::List(list) => {
                let items = list
                    .items
                    .iter()
                    .map(|item| self.to_guest(item, convert))
                    .collect::<BridgeResult<Vec<_>>>()?
                    .into_iter()
                    .map(OwnedRef::detach)
                    .collect();
                let id = interp
                    .new_array_from(DType::Object, shape, Order::Fortran, ArrayBuffer::Object(items))
                    .map_err(|_| self.fetch_error(false))?;
                return Ok(OwnedRef::new(interp, id));
            }
            other => {
                return Err(BridgeError::UnsupportedHostValue(format!(
                    "arrays of type '{}'",
                    other.type_name()
                )))
            }
        };

        // The view borrows the host buffer; the capsule roots the value.
        let base = new_host_capsule(interp, &self.session, &self.dispatcher, value.clone())?;
        let view = NdArray::view(dtype, shape, Order::Fortran, buffer, base.id())
            .map_err(|e| BridgeError::UnsupportedHostValue(e.to_string()))?;
        base.detach();
        Ok(OwnedRef::new(interp, interp.new_array(view)))
    }
}
