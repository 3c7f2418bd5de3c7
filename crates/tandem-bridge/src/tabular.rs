//! Tabular columns and frames
//!
//! Columns are read through the tabular library's public attributes, so
//! anything carrying the right class converts:
//!
//! ```text
//! dtype "category"                  -> character vector of level labels
//! dtype "datetime64[ns]" or `.dt`   -> double vector of POSIX seconds
//! nullable dtypes (Int64, boolean,
//!   Float64, string, ...)           -> vector of the matching kind
//! anything else                     -> the column's `values`
//! frame                             -> data frame of converted columns
//! ```
//!
//! Category code -1 and the tabular `NA` become host NA; a timestamp the
//! library cannot express (`NaT`) becomes NaN. In the other direction a
//! host data frame becomes a dict of column name to column, with atomic
//! columns as 1-D arrays.

use tandem_guest::ObjectId;
use tandem_host::{na_real, HostList, HostString, HostValue, Vector, NA_INTEGER, NA_LOGICAL};

use crate::classify::is_missing_sentinel;
use crate::error::{BridgeError, BridgeResult};
use crate::handle::OwnedRef;
use crate::Bridge;

const CATEGORY_DTYPE: &str = "category";

/// Dtype name of timezone-naive timestamps. Zoned timestamps report an
/// object dtype and are recognised by their `dt` accessor instead.
const DATETIME_DTYPE: &str = "datetime64[ns]";

/// Host kind of a nullable column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullableKind {
    Logical,
    Integer,
    Double,
    Character,
}

impl NullableKind {
    /// Kind for a nullable dtype name; `None` for every other dtype.
    pub fn from_dtype(name: &str) -> Option<Self> {
        match name {
            "Int8" | "Int16" | "Int32" | "Int64" | "UInt8" | "UInt16" | "UInt32" | "UInt64" => {
                Some(Self::Integer)
            }
            "Float32" | "Float64" => Some(Self::Double),
            "boolean" => Some(Self::Logical),
            "string" => Some(Self::Character),
            _ => None,
        }
    }
}

impl Bridge {
    fn attr(&self, obj: ObjectId, name: &str) -> BridgeResult<OwnedRef<'_>> {
        OwnedRef::from_result(&self.interp, self.interp.get_attr(obj, name))
            .map_err(|_| self.fetch_error(false))
    }

    fn next_item(&self, iter: ObjectId) -> BridgeResult<Option<OwnedRef<'_>>> {
        match self.interp.iter_next(iter) {
            Ok(item) => Ok(item.map(|id| OwnedRef::new(&self.interp, id))),
            Err(_) => Err(self.fetch_error(false)),
        }
    }

    fn iter_method(&self, obj: ObjectId, method: &str) -> BridgeResult<OwnedRef<'_>> {
        let interp = &*self.interp;
        let items = OwnedRef::from_result(interp, interp.call_method(obj, method, &[], &[]))
            .map_err(|_| self.fetch_error(false))?;
        OwnedRef::from_result(interp, interp.get_iter(items.id())).map_err(|_| self.fetch_error(false))
    }

    fn pair_item(&self, pair: ObjectId, index: usize) -> BridgeResult<OwnedRef<'_>> {
        OwnedRef::from_result(&self.interp, self.interp.sequence_item(pair, index))
            .map_err(|_| self.fetch_error(false))
    }

    // ========================================================================
    // Guest -> Host
    // ========================================================================

    pub(crate) fn tabular_column_to_host(&self, column: ObjectId) -> BridgeResult<HostValue> {
        let interp = &*self.interp;
        let dtype = self.attr(column, "dtype")?;
        let name = self.attr(dtype.id(), "name")?;
        let name = interp.str_of(name.id()).map_err(|_| self.fetch_error(false))?;

        if name == CATEGORY_DTYPE {
            return self.categorical_to_host(column, dtype.id());
        }
        if name == DATETIME_DTYPE || interp.has_attr(column, "dt") {
            return self.timestamps_to_host(column);
        }
        if let Some(kind) = NullableKind::from_dtype(&name) {
            return self.nullable_to_host(column, kind, &name);
        }
        let values = self.attr(column, "values")?;
        self.to_host(values.id(), true)
    }

    /// Data frame of the frame's columns in `items()` order.
    pub(crate) fn tabular_frame_to_host(&self, frame: ObjectId) -> BridgeResult<HostValue> {
        let iter = self.iter_method(frame, "items")?;
        let mut columns = Vec::new();
        while let Some(pair) = self.next_item(iter.id())? {
            let label = self.pair_item(pair.id(), 0)?;
            let column = self.pair_item(pair.id(), 1)?;
            columns.push((
                self.key_name(label.id())?,
                self.tabular_column_to_host(column.id())?,
            ));
        }
        Ok(HostValue::List(HostList::data_frame(columns)?))
    }

    fn categorical_to_host(&self, column: ObjectId, dtype: ObjectId) -> BridgeResult<HostValue> {
        let cat = self.attr(column, "cat")?;
        let codes = self.attr(cat.id(), "codes")?;
        let codes = self.attr(codes.id(), "values")?;
        let codes = match self.to_host(codes.id(), true)? {
            HostValue::Integer(v) => v,
            other => {
                return Err(BridgeError::TabularColumn(format!(
                    "{} (codes of type '{}')",
                    CATEGORY_DTYPE,
                    other.type_name()
                )))
            }
        };
        let categories = self.attr(dtype, "categories")?;
        let levels = self.attr(categories.id(), "values")?;
        let levels = level_labels(&self.to_host(levels.id(), true)?)?;

        let labels: Vec<Option<HostString>> = codes
            .as_slice()
            .iter()
            .map(|&code| {
                usize::try_from(code)
                    .ok()
                    .and_then(|i| levels.get(i).cloned().flatten())
            })
            .collect();
        Ok(HostValue::Character(Vector::from(labels)))
    }

    fn timestamps_to_host(&self, column: ObjectId) -> BridgeResult<HostValue> {
        let interp = &*self.interp;
        let iter = self.iter_method(column, "items")?;
        let mut seconds = Vec::new();
        while let Some(pair) = self.next_item(iter.id())? {
            let value = self.pair_item(pair.id(), 1)?;
            let stamp = match interp.call_method(value.id(), "timestamp", &[], &[]) {
                Ok(stamp) => {
                    let stamp = OwnedRef::new(interp, stamp);
                    interp
                        .as_float(stamp.id())
                        .or_else(|| interp.as_int(stamp.id()).map(|v| v as f64))
                        .unwrap_or(f64::NAN)
                }
                Err(_) => {
                    interp.err_clear();
                    f64::NAN
                }
            };
            seconds.push(stamp);
        }
        Ok(HostValue::Double(Vector::from(seconds)))
    }

    /// Walks the column's own iterator for `size` values.
    fn nullable_to_host(
        &self,
        column: ObjectId,
        kind: NullableKind,
        dtype: &str,
    ) -> BridgeResult<HostValue> {
        let interp = &*self.interp;
        let size = self.attr(column, "size")?;
        let size = interp
            .as_int(size.id())
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| BridgeError::TabularColumn(dtype.to_owned()))?;
        let iter = OwnedRef::from_result(interp, interp.get_iter(column))
            .map_err(|_| self.fetch_error(false))?;

        let mut values = Vec::with_capacity(size);
        for _ in 0..size {
            let Some(item) = self.next_item(iter.id())? else {
                return Err(BridgeError::TabularColumn(dtype.to_owned()));
            };
            if interp.is_none(item.id()) || is_missing_sentinel(interp, &self.symbols, item.id()) {
                values.push(None);
            } else {
                values.push(Some(self.to_host(item.id(), true)?));
            }
        }
        collect_nullable(kind, &values).ok_or_else(|| BridgeError::TabularColumn(dtype.to_owned()))
    }

    // ========================================================================
    // Host -> Guest
    // ========================================================================

    pub(crate) fn data_frame_to_guest(&self, frame: &HostList, convert: bool) -> BridgeResult<OwnedRef<'_>> {
        let interp = &*self.interp;
        let dict = OwnedRef::new(interp, interp.new_dict());
        let names = frame.names.as_deref().unwrap_or_default();
        for (name, column) in names.iter().zip(&frame.items) {
            let value = match column {
                HostValue::Logical(_)
                | HostValue::Integer(_)
                | HostValue::Double(_)
                | HostValue::Complex(_)
                | HostValue::Character(_) => self.array_to_guest(column, convert)?,
                other => self.to_guest(other, convert)?,
            };
            interp
                .dict_set_item_str(dict.id(), name, value.id())
                .map_err(|_| self.fetch_error(false))?;
        }
        Ok(dict)
    }
}

/// Category labels as strings.
fn level_labels(levels: &HostValue) -> BridgeResult<Vec<Option<HostString>>> {
    let labels = match levels {
        HostValue::Character(v) => v.as_slice().to_vec(),
        HostValue::Integer(v) => v
            .as_slice()
            .iter()
            .map(|&x| (x != NA_INTEGER).then(|| HostString::utf8(x.to_string())))
            .collect(),
        HostValue::Double(v) => v
            .as_slice()
            .iter()
            .map(|&x| (!x.is_nan()).then(|| HostString::utf8(x.to_string())))
            .collect(),
        HostValue::Logical(v) => v
            .as_slice()
            .iter()
            .map(|&x| (x != NA_LOGICAL).then(|| HostString::utf8(if x != 0 { "TRUE" } else { "FALSE" })))
            .collect(),
        other => {
            return Err(BridgeError::TabularColumn(format!(
                "{} (levels of type '{}')",
                CATEGORY_DTYPE,
                other.type_name()
            )))
        }
    };
    Ok(labels)
}

/// `None` when a present value cannot be read as `kind`.
fn collect_nullable(kind: NullableKind, values: &[Option<HostValue>]) -> Option<HostValue> {
    fn each<T: Clone>(
        values: &[Option<HostValue>],
        na: T,
        cast: impl Fn(&HostValue) -> Option<T>,
    ) -> Option<Vector<T>> {
        values
            .iter()
            .map(|v| match v {
                Some(v) => cast(v),
                None => Some(na.clone()),
            })
            .collect::<Option<Vec<_>>>()
            .map(Vector::from)
    }

    let value = match kind {
        NullableKind::Logical => HostValue::Logical(each(values, NA_LOGICAL, |v| {
            v.as_logical()
                .map(i32::from)
                .or_else(|| v.as_integer().map(|x| i32::from(x != 0)))
        })?),
        NullableKind::Integer => HostValue::Integer(each(values, NA_INTEGER, |v| {
            v.as_integer()
                .or_else(|| v.as_double().map(|x| x as i32))
                .or_else(|| v.as_logical().map(i32::from))
        })?),
        NullableKind::Double => HostValue::Double(each(values, na_real(), |v| {
            v.as_double().or_else(|| v.as_integer().map(f64::from))
        })?),
        NullableKind::Character => HostValue::Character(each(values, None, |v| {
            v.as_str().map(|s| Some(HostString::utf8(s)))
        })?),
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nullable_dtype_names() {
        assert_eq!(NullableKind::from_dtype("Int64"), Some(NullableKind::Integer));
        assert_eq!(NullableKind::from_dtype("UInt8"), Some(NullableKind::Integer));
        assert_eq!(NullableKind::from_dtype("Float32"), Some(NullableKind::Double));
        assert_eq!(NullableKind::from_dtype("boolean"), Some(NullableKind::Logical));
        assert_eq!(NullableKind::from_dtype("string"), Some(NullableKind::Character));
        assert_eq!(NullableKind::from_dtype("int64"), None);
        assert_eq!(NullableKind::from_dtype("object"), None);
    }

    #[test]
    fn test_collect_nullable_fills_na() {
        let values = vec![Some(HostValue::integer(3)), None, Some(HostValue::double(4.0))];
        match collect_nullable(NullableKind::Integer, &values) {
            Some(HostValue::Integer(v)) => assert_eq!(v.as_slice(), &[3, NA_INTEGER, 4]),
            other => panic!("expected an integer vector, got {:?}", other),
        }
        let strings = vec![Some(HostValue::integer(1))];
        assert!(collect_nullable(NullableKind::Character, &strings).is_none());
    }

    #[test]
    fn test_level_labels_stringify_numbers() {
        let levels = HostValue::Integer(vec![10, NA_INTEGER].into());
        let labels = level_labels(&levels).unwrap();
        assert_eq!(labels[0].as_ref().map(|s| s.text.as_str()), Some("10"));
        assert!(labels[1].is_none());
        assert!(level_labels(&HostValue::Null).is_err());
    }
}
