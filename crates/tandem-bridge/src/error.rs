//! Error types for bridge operations

use tandem_host::{Condition, HostError};

use crate::config::ConfigError;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge error types
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A guest exception, translated into a host condition
    #[error("{}", .0.message)]
    GuestException(Box<Condition>),

    /// Array element type outside the narrowing table
    #[error("Conversion from array type {typenum} ({name}) is not supported")]
    UnsupportedArrayKind {
        /// Wire type number
        typenum: i32,
        /// Type name as the array library reports it
        name: String,
    },

    /// Host value with no guest counterpart
    #[error("Unable to convert host value of type '{0}'")]
    UnsupportedHostValue(String),

    /// Tabular column whose values do not fit its declared dtype
    #[error("Can't cast column with type name: {0}")]
    TabularColumn(String),

    /// A user interrupt unwinding to the host top level
    #[error("interrupted")]
    Interrupted,

    /// The pending-call queue stayed full past the ceiling
    #[error("Unable to schedule call on the main host thread after {waited_ms}ms")]
    DispatcherExhausted {
        /// Time spent retrying
        waited_ms: u64,
    },

    /// Capsule missing or carrying the wrong payload
    #[error("Invalid capsule: {0}")]
    InvalidCapsule(String),

    /// External pointer with a null address
    #[error("Invalid pointer")]
    NullExternalPointer,

    /// The guest runtime behind a wrapper is gone
    #[error(
        "Object is a null externalptr (it may have been disconnected from the session where it was created)"
    )]
    Disconnected,

    /// Error raised by the host itself
    #[error(transparent)]
    Host(#[from] HostError),

    /// Invalid bridge configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// The translated condition for guest exceptions.
    pub fn condition(&self) -> Option<&Condition> {
        match self {
            BridgeError::GuestException(c) => Some(c),
            BridgeError::Host(e) => e.condition(),
            _ => None,
        }
    }
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl From<BridgeError> for HostError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::GuestException(c) => HostError::Condition(c),
            BridgeError::Interrupted => HostError::Interrupted,
            BridgeError::Host(e) => e,
            other => HostError::Stop(other.to_string()),
        }
    }
}
