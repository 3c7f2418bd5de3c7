//! Tandem guest runtime
//!
//! An embeddable, reference-counted dynamic interpreter runtime. The bridge
//! in `tandem-bridge` drives it through the C-API-shaped surface of
//! [`Interpreter`]: integer object handles with manual reference counting,
//! a per-thread error indicator, a global execution lock and a bounded
//! pending-call queue serviced on the main thread.
//!
//! # Example
//!
//! ```ignore
//! use tandem_guest::Interpreter;
//!
//! let interp = Interpreter::new();
//! let items = vec![interp.new_int(1), interp.new_int(2)];
//! let list = interp.new_list(items);
//! assert_eq!(interp.len(list).unwrap(), 2);
//! interp.dec_ref(list);
//! ```

pub mod builtins;
pub mod error;
pub mod gil;
pub mod heap;
pub mod interpreter;
pub mod ndarray;
pub mod object;
pub mod pending;
pub mod thread_state;

pub use builtins::{expect_arg, Builtins};
pub use error::{ErrorTriple, GuestResult, HeapError, Raised};
pub use gil::{ExecutionLock, GilGuard};
pub use heap::HeapStats;
pub use interpreter::{CompareOp, Interpreter};
pub use ndarray::{ArrayBuffer, ArrayScalar, DType, NdArray, Order, ScalarValue, StorageKind};
pub use object::{CapsuleDestructor, CapsulePayload, NativeFn, ObjectData, ObjectId};
pub use pending::{PendingFn, PENDING_CALLS_CAPACITY};
pub use thread_state::ThreadStack;
