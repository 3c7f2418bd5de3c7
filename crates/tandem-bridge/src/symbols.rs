//! Lazily resolved guest symbols
//!
//! Each symbol is imported on first use and kept (one owned reference)
//! until the bridge is dropped.

use once_cell::sync::OnceCell;
use tandem_guest::{GuestResult, Interpreter, ObjectId};

/// Module and class name of the tabular missing-value sentinel.
pub const MISSING_MODULE: &str = "pandas._libs.missing";
pub const MISSING_TYPE_NAMES: [&str; 2] = ["NAType", "C_NAType"];

/// Module and class name of a tabular column.
pub const TABULAR_COLUMN_TYPE: (&str, &str) = ("pandas.core.series", "Series");

/// Module and class name of a tabular frame.
pub const TABULAR_FRAME_TYPE: (&str, &str) = ("pandas.core.frame", "DataFrame");

#[derive(Default)]
pub struct SymbolCache {
    getmro: OnceCell<ObjectId>,
    format_exception_only: OnceCell<ObjectId>,
    nan: OnceCell<ObjectId>,
    na_type: OnceCell<Option<ObjectId>>,
}

impl SymbolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `inspect.getmro`
    pub fn getmro(&self, interp: &Interpreter) -> GuestResult<ObjectId> {
        self.getmro
            .get_or_try_init(|| interp.import_attr("inspect", "getmro"))
            .copied()
    }

    /// `traceback.format_exception_only`
    pub fn format_exception_only(&self, interp: &Interpreter) -> GuestResult<ObjectId> {
        self.format_exception_only
            .get_or_try_init(|| interp.import_attr("traceback", "format_exception_only"))
            .copied()
    }

    /// `numpy.nan`, compared by identity.
    pub fn nan(&self, interp: &Interpreter) -> GuestResult<ObjectId> {
        self.nan
            .get_or_try_init(|| interp.import_attr("numpy", "nan"))
            .copied()
    }

    /// The tabular `NAType`, or `None` when that library is not loaded.
    pub fn na_type(&self, interp: &Interpreter) -> Option<ObjectId> {
        *self.na_type.get_or_init(|| {
            match interp.import_attr(MISSING_MODULE, MISSING_TYPE_NAMES[0]) {
                Ok(ty) => Some(ty),
                Err(_) => {
                    interp.err_clear();
                    None
                }
            }
        })
    }

    /// Drop every resolved reference.
    pub fn release(&mut self, interp: &Interpreter) {
        for id in [
            self.getmro.take(),
            self.format_exception_only.take(),
            self.nan.take(),
            self.na_type.take().flatten(),
        ]
        .into_iter()
        .flatten()
        {
            interp.dec_ref(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbols_resolve_once() {
        let interp = Interpreter::new();
        let mut cache = SymbolCache::new();
        let first = cache.getmro(&interp).unwrap();
        let second = cache.getmro(&interp).unwrap();
        assert_eq!(first, second);
        assert!(interp.is_callable(cache.format_exception_only(&interp).unwrap()));
        assert!(interp.as_float(cache.nan(&interp).unwrap()).is_some_and(f64::is_nan));
        assert!(cache.na_type(&interp).is_some());
        cache.release(&interp);
    }
}
