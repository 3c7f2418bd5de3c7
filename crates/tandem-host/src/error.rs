//! Error types for Host operations

use crate::condition::Condition;

/// Result type for Host operations
pub type HostResult<T> = Result<T, HostError>;

/// Host error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum HostError {
    /// A signalled error condition
    #[error("{}", .0.message)]
    Condition(Box<Condition>),

    /// The user interrupted evaluation
    #[error("interrupted")]
    Interrupted,

    /// Host state was touched from a thread other than the main thread
    #[error("host state accessed from a non-main thread")]
    WrongThread,

    /// Plain `stop()` with a message
    #[error("{0}")]
    Stop(String),
}

impl HostError {
    /// The condition carried by this error, if any.
    pub fn condition(&self) -> Option<&Condition> {
        match self {
            HostError::Condition(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, HostError::Interrupted)
    }
}

impl From<Condition> for HostError {
    fn from(condition: Condition) -> Self {
        HostError::Condition(Box::new(condition))
    }
}

impl From<String> for HostError {
    fn from(s: String) -> Self {
        HostError::Stop(s)
    }
}

impl From<&str> for HostError {
    fn from(s: &str) -> Self {
        HostError::Stop(s.to_string())
    }
}
