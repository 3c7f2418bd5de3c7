//! Tabular Conversion Integration Tests
//!
//! Columns and frames of the tabular library, modelled by classes that
//! carry its names and public attributes:
//! - Plain, categorical, datetime and nullable columns
//! - Frames as host data frames
//! - Host data frames as guest dicts of arrays

use std::sync::Arc;

use tandem_bridge::{Bridge, BridgeConfig, BridgeError};
use tandem_guest::{ArrayBuffer, DType, GuestResult, Interpreter, ObjectId, Order};
use tandem_host::{
    is_na_real, HostList, HostSession, HostString, HostValue, Vector, DATA_FRAME_CLASS,
    NA_INTEGER, NA_LOGICAL,
};

fn setup() -> Arc<Bridge> {
    Bridge::new(Interpreter::new(), HostSession::new(), BridgeConfig::default()).unwrap()
}

/// New instance of `class`; steals every attribute value.
fn instance(interp: &Interpreter, class: ObjectId, attrs: Vec<(&str, ObjectId)>) -> ObjectId {
    let obj = interp.new_instance(class);
    for (name, value) in attrs {
        interp.set_attr(obj, name, value).unwrap();
        interp.dec_ref(value);
    }
    obj
}

fn method<F>(interp: &Interpreter, class: ObjectId, name: &str, f: F)
where
    F: Fn(&Interpreter, &[ObjectId]) -> GuestResult<ObjectId> + Send + Sync + 'static,
{
    let func = interp.new_native_function(name, move |interp, args, _kwargs| f(interp, args));
    interp.set_attr(class, name, func).unwrap();
    interp.dec_ref(func);
}

fn strs(interp: &Interpreter, values: &[&str]) -> ObjectId {
    interp.new_list(values.iter().map(|v| interp.new_str(v)).collect())
}

fn tabular_na(interp: &Interpreter) -> ObjectId {
    interp.import_attr("pandas._libs.missing", "NA").unwrap()
}

/// Column classes sharing one interpreter.
struct Tabular {
    series: ObjectId,
    frame: ObjectId,
    dtype: ObjectId,
    accessor: ObjectId,
}

impl Tabular {
    fn new(interp: &Interpreter) -> Self {
        let series = interp.new_type("Series", "pandas.core.series", &[]).unwrap();
        // iteration and items() both walk the backing `_data` list
        method(interp, series, "__iter__", |interp, args| {
            let data = interp.get_attr(args[0], "_data")?;
            let iter = interp.get_iter(data);
            interp.dec_ref(data);
            iter
        });
        method(interp, series, "items", |interp, args| {
            let data = interp.get_attr(args[0], "_data")?;
            let pairs = interp
                .list_items(data)
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    interp.inc_ref(item);
                    interp.new_tuple(vec![interp.new_int(i as i64), item])
                })
                .collect();
            interp.dec_ref(data);
            Ok(interp.new_list(pairs))
        });

        let frame = interp.new_type("DataFrame", "pandas.core.frame", &[]).unwrap();
        method(interp, frame, "items", |interp, args| interp.get_attr(args[0], "_columns"));

        Self {
            series,
            frame,
            dtype: interp.new_type("Dtype", "pandas.core.dtypes", &[]).unwrap(),
            accessor: interp.new_type("Accessor", "pandas.core.accessor", &[]).unwrap(),
        }
    }

    /// A column of dtype `dtype_name` over `data`; steals `data` and every
    /// extra attribute.
    fn column(
        &self,
        interp: &Interpreter,
        dtype_name: &str,
        data: ObjectId,
        mut extra: Vec<(&str, ObjectId)>,
    ) -> ObjectId {
        let size = interp.list_items(data).map_or(0, |items| items.len());
        let dtype = instance(interp, self.dtype, vec![("name", interp.new_str(dtype_name))]);
        let mut attrs = vec![
            ("dtype", dtype),
            ("_data", data),
            ("size", interp.new_int(size as i64)),
        ];
        if !extra.iter().any(|(name, _)| *name == "values") {
            interp.inc_ref(data);
            attrs.push(("values", data));
        }
        attrs.append(&mut extra);
        instance(interp, self.series, attrs)
    }

    /// A frame over `(name, column)` pairs; steals the columns.
    fn frame(&self, interp: &Interpreter, columns: Vec<(&str, ObjectId)>) -> ObjectId {
        let pairs = columns
            .into_iter()
            .map(|(name, column)| interp.new_tuple(vec![interp.new_str(name), column]))
            .collect();
        instance(interp, self.frame, vec![("_columns", interp.new_list(pairs))])
    }

    fn release(self, interp: &Interpreter) {
        for ty in [self.series, self.frame, self.dtype, self.accessor] {
            interp.dec_ref(ty);
        }
    }
}

fn int_array(interp: &Interpreter, dtype: DType, values: Vec<i64>) -> ObjectId {
    let len = values.len();
    interp
        .new_array_from(dtype, vec![len], Order::C, ArrayBuffer::I64(Arc::from(values)))
        .unwrap()
}

fn text(value: &Option<HostString>) -> Option<&str> {
    value.as_ref().map(|s| s.text.as_str())
}

// ===== Columns =====

#[test]
fn test_plain_column_converts_values() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let tabular = Tabular::new(&interp);

    let data = interp.new_list(vec![interp.new_int(1), interp.new_int(2)]);
    let values = int_array(&interp, DType::Int32, vec![1, 2, 3]);
    let column = tabular.column(&interp, "int32", data, vec![("values", values)]);
    match bridge.guest_to_host(column, true).unwrap() {
        HostValue::Integer(v) => assert_eq!(v.as_slice(), &[1, 2, 3]),
        other => panic!("expected an integer vector, got {:?}", other),
    }
    interp.dec_ref(column);
    tabular.release(&interp);
}

#[test]
fn test_categorical_column_uses_level_labels() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let tabular = Tabular::new(&interp);

    let codes = int_array(&interp, DType::Int8, vec![0, 1, -1, 0]);
    let codes = instance(&interp, tabular.accessor, vec![("values", codes)]);
    let cat = instance(&interp, tabular.accessor, vec![("codes", codes)]);
    let column = tabular.column(&interp, "category", interp.new_list(Vec::new()), vec![("cat", cat)]);
    let dtype = interp.get_attr(column, "dtype").unwrap();
    let categories = instance(&interp, tabular.accessor, vec![("values", strs(&interp, &["low", "high"]))]);
    interp.set_attr(dtype, "categories", categories).unwrap();
    interp.dec_ref(categories);
    interp.dec_ref(dtype);

    match bridge.guest_to_host(column, true).unwrap() {
        HostValue::Character(v) => {
            let labels: Vec<_> = v.as_slice().iter().map(text).collect();
            assert_eq!(labels, vec![Some("low"), Some("high"), None, Some("low")]);
        }
        other => panic!("expected a character vector, got {:?}", other),
    }
    interp.dec_ref(column);
    tabular.release(&interp);
}

#[test]
fn test_datetime_column_in_posix_seconds() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let tabular = Tabular::new(&interp);

    let timestamp = interp
        .new_type("Timestamp", "pandas._libs.tslibs.timestamps", &[])
        .unwrap();
    method(&interp, timestamp, "timestamp", |interp, args| interp.get_attr(args[0], "_seconds"));
    let missing = interp.new_type("NaTType", "pandas._libs.tslibs.nattype", &[]).unwrap();
    method(&interp, missing, "timestamp", |interp, _args| {
        Err(interp.raise(interp.builtins().value_error, "NaTType does not support timestamp"))
    });

    let stamps = |interp: &Interpreter| {
        interp.new_list(vec![
            instance(interp, timestamp, vec![("_seconds", interp.new_float(0.0))]),
            interp.new_instance(missing),
            instance(interp, timestamp, vec![("_seconds", interp.new_float(86400.5))]),
        ])
    };
    let naive = tabular.column(&interp, "datetime64[ns]", stamps(&interp), Vec::new());
    // zoned columns report an object dtype but carry a `dt` accessor
    let accessor = interp.new_instance(tabular.accessor);
    let zoned = tabular.column(&interp, "object", stamps(&interp), vec![("dt", accessor)]);

    for column in [naive, zoned] {
        match bridge.guest_to_host(column, true).unwrap() {
            HostValue::Double(v) => {
                assert_eq!(v.as_slice()[0], 0.0);
                assert!(v.as_slice()[1].is_nan());
                assert_eq!(v.as_slice()[2], 86400.5);
            }
            other => panic!("expected a double vector, got {:?}", other),
        }
        assert!(interp.err_occurred().is_none());
        interp.dec_ref(column);
    }
    interp.dec_ref(timestamp);
    interp.dec_ref(missing);
    tabular.release(&interp);
}

#[test]
fn test_nullable_columns_fill_missing_values() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let tabular = Tabular::new(&interp);

    let ints = interp.new_list(vec![interp.new_int(1), tabular_na(&interp), interp.new_int(3)]);
    let ints = tabular.column(&interp, "Int64", ints, Vec::new());
    match bridge.guest_to_host(ints, true).unwrap() {
        HostValue::Integer(v) => assert_eq!(v.as_slice(), &[1, NA_INTEGER, 3]),
        other => panic!("expected an integer vector, got {:?}", other),
    }

    let flags = {
        let t = interp.builtins().true_;
        interp.inc_ref(t);
        interp.new_list(vec![t, tabular_na(&interp)])
    };
    let flags = tabular.column(&interp, "boolean", flags, Vec::new());
    match bridge.guest_to_host(flags, true).unwrap() {
        HostValue::Logical(v) => assert_eq!(v.as_slice(), &[1, NA_LOGICAL]),
        other => panic!("expected a logical vector, got {:?}", other),
    }

    let words = interp.new_list(vec![interp.new_str("a"), tabular_na(&interp)]);
    let words = tabular.column(&interp, "string", words, Vec::new());
    match bridge.guest_to_host(words, true).unwrap() {
        HostValue::Character(v) => {
            assert_eq!(text(&v.as_slice()[0]), Some("a"));
            assert!(v.as_slice()[1].is_none());
        }
        other => panic!("expected a character vector, got {:?}", other),
    }

    let reals = interp.new_list(vec![interp.new_float(0.5), tabular_na(&interp)]);
    let reals = tabular.column(&interp, "Float64", reals, Vec::new());
    match bridge.guest_to_host(reals, true).unwrap() {
        HostValue::Double(v) => {
            assert_eq!(v.as_slice()[0], 0.5);
            assert!(is_na_real(v.as_slice()[1]));
        }
        other => panic!("expected a double vector, got {:?}", other),
    }

    for column in [ints, flags, words, reals] {
        interp.dec_ref(column);
    }
    tabular.release(&interp);
}

#[test]
fn test_nullable_column_rejects_foreign_values() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let tabular = Tabular::new(&interp);

    let column = tabular.column(&interp, "Int64", strs(&interp, &["x"]), Vec::new());
    let err = bridge.guest_to_host(column, true).unwrap_err();
    assert!(matches!(&err, BridgeError::TabularColumn(name) if name == "Int64"));
    assert_eq!(err.to_string(), "Can't cast column with type name: Int64");
    interp.dec_ref(column);
    tabular.release(&interp);
}

// ===== Frames =====

#[test]
fn test_frame_becomes_data_frame() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let tabular = Tabular::new(&interp);

    let ids = interp.new_list(vec![interp.new_int(7), interp.new_int(8)]);
    let ids = tabular.column(&interp, "int64", ids, Vec::new());
    let names = tabular.column(&interp, "object", strs(&interp, &["ann", "bo"]), Vec::new());
    let frame = tabular.frame(&interp, vec![("id", ids), ("name", names)]);

    let value = bridge.guest_to_host(frame, true).unwrap();
    assert!(value.inherits(DATA_FRAME_CLASS));
    let list = value.as_list().unwrap();
    assert!(list.is_data_frame());
    assert_eq!(list.names.as_deref(), Some(&["id".to_string(), "name".to_string()][..]));
    match &list.items[0] {
        HostValue::Integer(v) => assert_eq!(v.as_slice(), &[7, 8]),
        other => panic!("expected an integer column, got {:?}", other),
    }
    assert_eq!(list.items[1].len(), 2);
    interp.dec_ref(frame);
    tabular.release(&interp);
}

#[test]
fn test_frame_with_ragged_columns_fails() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let tabular = Tabular::new(&interp);

    let short = tabular.column(&interp, "object", strs(&interp, &["a"]), Vec::new());
    let long = tabular.column(&interp, "object", strs(&interp, &["a", "b"]), Vec::new());
    let frame = tabular.frame(&interp, vec![("short", short), ("long", long)]);
    let err = bridge.guest_to_host(frame, true).unwrap_err();
    assert!(err.to_string().contains("column 'long'"));
    interp.dec_ref(frame);
    tabular.release(&interp);
}

#[test]
fn test_host_data_frame_becomes_dict_of_arrays() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();

    let frame = HostList::data_frame(vec![
        ("x".to_string(), HostValue::Double(Vector::from(vec![1.0, 2.0]))),
        (
            "label".to_string(),
            HostValue::Character(Vector::from(vec![Some(HostString::utf8("a")), None])),
        ),
        (
            "extra".to_string(),
            HostValue::List(HostList::unnamed(vec![HostValue::integer(1), HostValue::Null])),
        ),
    ])
    .unwrap();
    let dict = bridge.host_to_guest(&HostValue::List(frame), true).unwrap();
    let ndarray = interp.builtins().ndarray;
    let column = |name: &str| {
        let key = interp.new_str(name);
        let value = interp.get_item(dict.id(), key).unwrap();
        interp.dec_ref(key);
        value
    };

    let x = column("x");
    assert!(interp.is_kind(x, ndarray));
    assert_eq!(interp.len(x).unwrap(), 2);
    let label = column("label");
    assert!(interp.is_kind(label, ndarray));
    let extra = column("extra");
    assert!(interp.is_exact(extra, interp.builtins().list));
    for id in [x, label, extra] {
        interp.dec_ref(id);
    }

    // a data frame needs equal column lengths
    let err = HostList::data_frame(vec![
        ("a".to_string(), HostValue::integer(1)),
        ("b".to_string(), HostValue::Integer(Vector::from(vec![1, 2]))),
    ])
    .unwrap_err();
    assert!(err.to_string().contains("column 'b' does not have 1 rows"));
}
