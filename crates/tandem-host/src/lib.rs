//! Tandem host model
//!
//! The Host interpreter as the bridge sees it: vector-based values with
//! missing-value sentinels, closures, conditions, and a [`HostSession`]
//! holding GC roots, call frames, options and the interrupt flag. All
//! session mutation is restricted to the thread that created it.
//!
//! # Example
//!
//! ```ignore
//! use tandem_host::{HostArgs, HostClosure, HostSession, HostValue};
//!
//! let session = HostSession::new();
//! let double = HostValue::Closure(HostClosure::new("double", |_s, args| {
//!     let x = args.positional[0].as_double().unwrap_or(0.0);
//!     Ok(HostValue::double(x * 2.0))
//! }));
//! let out = session.apply(&double, HostArgs::positional(vec![HostValue::double(2.0)]))?;
//! ```

pub mod condition;
pub mod error;
pub mod session;
pub mod value;

pub use condition::Condition;
pub use error::{HostError, HostResult};
pub use session::{HostSession, PreciousToken, DEFAULT_WARNING_LENGTH, WARNING_LENGTH_RANGE};
pub use value::{
    is_na_real, na_complex, na_real, Encoding, ExternalPtr, ExternalRef, HostArgs, HostClosure,
    HostFn, HostList, HostString, HostValue, Vector, DATA_FRAME_CLASS, NA_INTEGER, NA_LOGICAL,
};
