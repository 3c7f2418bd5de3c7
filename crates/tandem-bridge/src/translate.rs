//! Exception and traceback translation
//!
//! A guest failure leaves an exception on the calling thread's error
//! indicator. [`Bridge::fetch_error`] reads it exactly once, normalizes it,
//! decorates the exception object with the host call site and backtrace
//! (as host capsules, so a later host frame can recover them) and turns it
//! into a host [`Condition`]. The newest condition is also kept in the
//! translator's last-error slot.

use std::sync::Arc;

use parking_lot::Mutex;
use tandem_guest::{ErrorTriple, ObjectId};
use tandem_host::{Condition, ExternalRef, HostValue};

use crate::capsule::{host_capsule_value, is_host_capsule, new_host_capsule};
use crate::class_tags::class_tags;
use crate::error::BridgeError;
use crate::handle::{GuestObjectRef, OwnedRef};
use crate::Bridge;

/// Marker inserted where a long message was cut.
pub const TRUNCATION_MARKER: &str = "<...truncated...>";

/// Slack kept below the cap after truncation.
const TRUNCATION_SLACK: usize = 20;

/// Translator state: the last translated guest exception.
#[derive(Debug, Default)]
pub struct Translator {
    last_error: Mutex<Option<Condition>>,
}

impl Translator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_error(&self) -> Option<Condition> {
        self.last_error.lock().clone()
    }

    pub fn clear(&self) {
        self.last_error.lock().take();
    }

    fn publish(&self, condition: &Condition) {
        *self.last_error.lock() = Some(condition.clone());
    }
}

/// Cut `message` to at most `max` bytes, keeping its first two lines and
/// its tail with [`TRUNCATION_MARKER`] in between.
pub fn truncate_middle(message: &str, max: usize) -> String {
    if message.len() <= max {
        return message.to_owned();
    }
    let over = message.len() - max;
    let overhead = TRUNCATION_MARKER.len() + TRUNCATION_SLACK;

    let mut head = head_lines(message);
    if head.len() + overhead > max {
        head = "";
    }
    let start = over + head.len() + overhead;
    if start >= message.len() {
        // cap smaller than the marker itself
        return message[ceil_char_boundary(message, message.len() - max)..].to_owned();
    }
    let tail = &message[ceil_char_boundary(message, start)..];

    let mut out = String::with_capacity(head.len() + TRUNCATION_MARKER.len() + tail.len());
    out.push_str(head);
    out.push_str(TRUNCATION_MARKER);
    out.push_str(tail);
    out
}

/// Through the second newline, else the first, else nothing.
fn head_lines(message: &str) -> &str {
    let mut newlines = message.match_indices('\n').map(|(i, _)| i);
    match (newlines.next(), newlines.next()) {
        (_, Some(second)) => &message[..=second],
        (Some(first), None) => &message[..=first],
        _ => "",
    }
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

impl Bridge {
    /// Read the pending guest exception and translate it.
    ///
    /// A forwarded interrupt wins over whatever is on the indicator and is
    /// returned as [`BridgeError::Interrupted`]. With
    /// `maybe_reuse_cached_trace`, the backtrace stashed when the failing
    /// guest call was entered is used instead of the current one.
    pub fn fetch_error(&self, maybe_reuse_cached_trace: bool) -> BridgeError {
        let interp = &*self.interp;
        if self.signals.take_forwarded() {
            interp.err_clear();
            interp.clear_interrupt();
            return BridgeError::Interrupted;
        }

        let Some(triple) = self.normalized_error() else {
            let condition = Condition::simple_error("Unknown guest error", self.session.current_call());
            self.translator.publish(&condition);
            return BridgeError::GuestException(Box::new(condition));
        };
        let ErrorTriple {
            ptype,
            pvalue,
            ptraceback,
        } = triple;

        if !interp.is_none(ptraceback) && interp.exception_set_traceback(pvalue, ptraceback).is_err() {
            interp.err_clear();
        }

        if !interp.has_attr(pvalue, "call") {
            self.inherit_context_site(pvalue);
        }
        if !interp.has_attr(pvalue, "trace") {
            let trace = match self.session.stashed_backtrace() {
                Some(cached) if maybe_reuse_cached_trace => cached,
                _ => self.session.backtrace(),
            };
            self.attach_host_value(pvalue, "trace", trace);
        }
        if !interp.has_attr(pvalue, "call") {
            self.attach_host_value(pvalue, "call", self.session.current_call());
        }

        let message = self.format_exception_message(ptype, pvalue);
        let call = self.host_attr(pvalue, "call");
        let trace = self.host_attr(pvalue, "trace");
        let mut classes = match class_tags(interp, &self.symbols, &*self.class_filter, pvalue, None) {
            Ok(tags) => tags,
            Err(_) => {
                interp.err_clear();
                Vec::new()
            }
        };
        classes.push("error".to_owned());
        classes.push("condition".to_owned());

        interp.dec_ref(ptype);
        interp.dec_ref(ptraceback);
        let exception = GuestObjectRef::new(&self.interp, OwnedRef::new(interp, pvalue), true);
        let condition = Condition {
            message,
            call,
            trace,
            payload: Some(ExternalRef::new(Arc::new(exception), classes.clone())),
            classes,
        };
        tracing::debug!(message = %condition.message, "translated guest exception");
        self.translator.publish(&condition);
        BridgeError::GuestException(Box::new(condition))
    }

    /// Fetch and normalize the pending exception. A failure while
    /// normalizing replaces the original exception with the new one.
    fn normalized_error(&self) -> Option<ErrorTriple> {
        let interp = &*self.interp;
        let mut raw = interp.err_fetch()?;
        for _ in 0..2 {
            match interp.err_normalize(raw) {
                Ok(triple) => return Some(triple),
                Err(_) => {
                    interp.release_error(raw);
                    raw = interp.err_fetch()?;
                }
            }
        }
        // still a bare message: wrap it in a RuntimeError
        let message = interp.str_of(raw.pvalue).unwrap_or_default();
        interp.release_error(raw);
        let runtime_error = interp.builtins().runtime_error;
        let value = interp.new_exception(runtime_error, &message).ok()?;
        interp.inc_ref(runtime_error);
        let none = interp.none();
        interp.inc_ref(none);
        Some(ErrorTriple {
            ptype: runtime_error,
            pvalue: value,
            ptraceback: none,
        })
    }

    /// Copy `call` and `trace` from the first exception in the
    /// `__context__` chain carrying either.
    fn inherit_context_site(&self, exception: ObjectId) {
        let interp = &*self.interp;
        let mut context = match interp.get_attr(exception, "__context__") {
            Ok(c) => OwnedRef::new(interp, c),
            Err(_) => {
                interp.err_clear();
                return;
            }
        };
        while !interp.is_none(context.id()) {
            let has_call = interp.has_attr(context.id(), "call");
            let has_trace = interp.has_attr(context.id(), "trace");
            if has_call || has_trace {
                for name in ["call", "trace"] {
                    if let Ok(value) = interp.get_attr(context.id(), name) {
                        if interp.set_attr(exception, name, value).is_err() {
                            interp.err_clear();
                        }
                        interp.dec_ref(value);
                    } else {
                        interp.err_clear();
                    }
                }
                return;
            }
            context = match interp.get_attr(context.id(), "__context__") {
                Ok(next) => OwnedRef::new(interp, next),
                Err(_) => {
                    interp.err_clear();
                    return;
                }
            };
        }
    }

    /// Store `value` on `exception` as a host capsule attribute.
    pub(crate) fn attach_host_value(&self, exception: ObjectId, name: &str, value: HostValue) {
        let interp = &*self.interp;
        match new_host_capsule(interp, &self.session, &self.dispatcher, value) {
            Ok(capsule) => {
                if interp.set_attr(exception, name, capsule.id()).is_err() {
                    interp.err_clear();
                }
            }
            Err(e) => tracing::debug!(attr = name, error = %e, "unable to attach host context"),
        }
    }

    fn host_attr(&self, exception: ObjectId, name: &str) -> HostValue {
        let interp = &*self.interp;
        let Ok(value) = interp.get_attr(exception, name) else {
            interp.err_clear();
            return HostValue::Null;
        };
        let value = OwnedRef::new(interp, value);
        if is_host_capsule(interp, value.id()) {
            host_capsule_value(interp, value.id()).unwrap_or(HostValue::Null)
        } else {
            HostValue::Null
        }
    }

    /// The guest's own rendering of an exception, with the configured hint,
    /// capped at the host's message length.
    pub fn format_exception_message(&self, ptype: ObjectId, pvalue: ObjectId) -> String {
        let interp = &*self.interp;
        let lines = self
            .symbols
            .format_exception_only(interp)
            .and_then(|f| interp.call(f, &[ptype, pvalue], &[]));
        let mut message = match lines {
            Ok(list) => {
                let list = OwnedRef::new(interp, list);
                interp
                    .list_items(list.id())
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|line| interp.as_str(line))
                    .collect::<String>()
            }
            Err(_) => {
                interp.err_clear();
                format!("{}\n", interp.type_name(ptype))
            }
        };
        message.push_str(&self.config.error_hint);
        truncate_middle(&message, self.session.warning_length())
    }

    /// The most recently translated guest exception.
    pub fn last_error(&self) -> Option<Condition> {
        self.translator.last_error()
    }

    pub fn clear_last_error(&self) {
        self.translator.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_message_untouched() {
        assert_eq!(truncate_middle("ValueError: x\n", 100), "ValueError: x\n");
    }

    #[test]
    fn test_truncation_keeps_head_and_tail() {
        let body: String = (0..200).map(|i| format!("frame {}\n", i)).collect();
        let message = format!("Error: first\ndetail line\n{}", body);
        let out = truncate_middle(&message, 300);
        assert!(out.len() <= 300);
        assert!(out.starts_with("Error: first\ndetail line\n<...truncated...>"));
        let tail = out.split(TRUNCATION_MARKER).nth(1).unwrap();
        assert!(message.ends_with(tail));
        assert_eq!(out.len(), 300 - TRUNCATION_SLACK);
    }

    #[test]
    fn test_single_line_drops_head() {
        let message = "x".repeat(500);
        let out = truncate_middle(&message, 120);
        assert!(out.starts_with(TRUNCATION_MARKER));
        assert!(out.len() <= 120);
    }

    #[test]
    fn test_multibyte_tail_cut_on_char_boundary() {
        let message = format!("a\nb\n{}", "é".repeat(300));
        let out = truncate_middle(&message, 150);
        assert!(out.len() <= 150);
        assert!(out.starts_with("a\nb\n"));
    }

    #[test]
    fn test_tiny_cap_keeps_suffix() {
        let message = "0123456789".repeat(10);
        let out = truncate_middle(&message, 10);
        assert_eq!(out, "0123456789");
    }
}
