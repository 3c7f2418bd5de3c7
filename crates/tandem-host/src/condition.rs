//! Host conditions
//!
//! A condition is the Host's error object: a message, the call that
//! signalled it, an optional backtrace, and a class vector ending in
//! `"error", "condition"`. Conditions built from foreign exceptions also
//! carry the foreign exception object in `payload`.

use crate::value::{ExternalRef, HostValue};

/// A signalled Host condition.
#[derive(Debug, Clone)]
pub struct Condition {
    pub message: String,
    /// Call expression active when the condition was signalled.
    pub call: HostValue,
    /// Backtrace captured at signal time, or `Null`.
    pub trace: HostValue,
    /// Most specific first.
    pub classes: Vec<String>,
    /// Foreign exception this condition was translated from.
    pub payload: Option<ExternalRef>,
}

impl Condition {
    /// A plain `simpleError`.
    pub fn simple_error(message: impl Into<String>, call: HostValue) -> Self {
        Self {
            message: message.into(),
            call,
            trace: HostValue::Null,
            classes: vec![
                "simpleError".to_string(),
                "error".to_string(),
                "condition".to_string(),
            ],
            payload: None,
        }
    }

    pub fn inherits(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    pub fn is_error(&self) -> bool {
        self.inherits("error")
    }
}
