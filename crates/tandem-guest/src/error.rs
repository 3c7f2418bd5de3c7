//! Error types for the guest runtime
//!
//! Guest exceptions do not travel through `Result` payloads. Like the C API the
//! model is shaped after, a failing operation stores the exception on the
//! calling thread's error indicator and returns [`Raised`]. Whoever receives
//! `Raised` is responsible for reading the indicator exactly once.

use crate::object::ObjectId;

/// Result type for guest operations that may raise.
pub type GuestResult<T> = Result<T, Raised>;

/// Marker returned when an exception has been set on the current thread's
/// error indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("guest exception raised")]
pub struct Raised;

/// The (type, value, traceback) triple held by a thread's error indicator.
///
/// Every field is an owned reference. `value` and `traceback` are the `None`
/// singleton when absent. The triple has no `Drop` impl because releasing it
/// needs the interpreter; use `Interpreter::release_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorTriple {
    /// Exception type
    pub ptype: ObjectId,
    /// Exception value (possibly not yet normalized)
    pub pvalue: ObjectId,
    /// Traceback object, or `None`
    pub ptraceback: ObjectId,
}

/// Construction failures for heap values that are rejected before allocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HeapError {
    /// Array buffer length does not match the product of its shape
    #[error("array buffer holds {got} elements but shape {shape:?} needs {expected}")]
    ShapeMismatch {
        /// Requested shape
        shape: Vec<usize>,
        /// Element count implied by the shape
        expected: usize,
        /// Element count actually supplied
        got: usize,
    },

    /// Array buffer storage does not match the declared dtype
    #[error("buffer storage {storage} cannot back dtype {dtype}")]
    StorageMismatch {
        /// Declared dtype name
        dtype: &'static str,
        /// Storage kind supplied
        storage: &'static str,
    },

    /// Cast between two dtypes that the model does not support
    #[error("cannot cast array from {from} to {to}")]
    UnsupportedCast {
        /// Source dtype name
        from: &'static str,
        /// Target dtype name
        to: &'static str,
    },
}
