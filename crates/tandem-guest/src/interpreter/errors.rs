//! Per-thread error indicator and exception formatting

use super::Interpreter;
use crate::error::{ErrorTriple, GuestResult, Raised};
use crate::object::{ObjectData, ObjectId};

impl Interpreter {
    fn replace_error(&self, triple: Option<ErrorTriple>) {
        let previous = self.threads.with_current(|s| std::mem::replace(&mut s.error, triple));
        if let Some(previous) = previous {
            self.release_error(previous);
        }
    }

    /// Set the error indicator to `(ptype, pvalue)`. Borrows both.
    pub fn err_set_object(&self, ptype: ObjectId, pvalue: ObjectId) {
        self.inc_ref(ptype);
        self.inc_ref(pvalue);
        self.replace_error(Some(ErrorTriple {
            ptype,
            pvalue,
            ptraceback: self.none(),
        }));
    }

    /// Set the error indicator with a string value. The value stays
    /// unnormalized until [`Interpreter::err_normalize`] runs.
    pub fn err_set_string(&self, ptype: ObjectId, message: &str) {
        self.inc_ref(ptype);
        let pvalue = self.new_str(message);
        self.replace_error(Some(ErrorTriple {
            ptype,
            pvalue,
            ptraceback: self.none(),
        }));
    }

    /// Raise an exception of type `ptype` carrying `message`.
    pub fn raise(&self, ptype: ObjectId, message: &str) -> Raised {
        self.err_set_string(ptype, message);
        Raised
    }

    /// Raise an existing exception instance. Borrows `exc`.
    pub fn raise_object(&self, exc: ObjectId) -> Raised {
        let ptype = self.type_of(exc);
        self.err_set_object(ptype, exc);
        Raised
    }

    /// Type of the pending exception, if any (borrowed).
    pub fn err_occurred(&self) -> Option<ObjectId> {
        self.threads.with_current(|s| s.error.map(|e| e.ptype))
    }

    /// Take the pending exception, clearing the indicator.
    pub fn err_fetch(&self) -> Option<ErrorTriple> {
        self.threads.with_current(|s| s.error.take())
    }

    /// Put a fetched exception back. Replaces anything currently set.
    pub fn err_restore(&self, triple: Option<ErrorTriple>) {
        self.replace_error(triple);
    }

    pub fn err_clear(&self) {
        self.replace_error(None);
    }

    /// True if the pending exception is an instance of `ptype`.
    pub fn err_matches(&self, ptype: ObjectId) -> bool {
        self.err_occurred()
            .is_some_and(|t| self.is_subtype(t, ptype))
    }

    /// Release every reference held by a triple.
    pub fn release_error(&self, triple: ErrorTriple) {
        self.dec_ref(triple.ptype);
        self.dec_ref(triple.pvalue);
        self.dec_ref(triple.ptraceback);
    }

    /// Make sure `pvalue` is an instance of `ptype`, instantiating it if not.
    pub fn err_normalize(&self, triple: ErrorTriple) -> GuestResult<ErrorTriple> {
        if self.is_kind(triple.pvalue, triple.ptype) {
            return Ok(triple);
        }
        let args: Vec<ObjectId> = if self.is_none(triple.pvalue) {
            Vec::new()
        } else if let Some(items) = self.tuple_items(triple.pvalue) {
            items
        } else {
            vec![triple.pvalue]
        };
        let value = self.call(triple.ptype, &args, &[])?;
        self.dec_ref(triple.pvalue);
        Ok(ErrorTriple {
            pvalue: value,
            ..triple
        })
    }

    /// Store `tb` as the exception's `__traceback__`.
    pub fn exception_set_traceback(&self, exc: ObjectId, tb: ObjectId) -> GuestResult<()> {
        self.set_attr(exc, "__traceback__", tb)
    }

    /// Create an exception instance of `ptype` with a single message argument.
    pub fn new_exception(&self, ptype: ObjectId, message: &str) -> GuestResult<ObjectId> {
        let msg = self.new_str(message);
        let exc = self.call(ptype, &[msg], &[]);
        self.dec_ref(msg);
        exc
    }

    /// Exception message: `str()` of its single argument, or of the argument tuple.
    pub fn exception_message(&self, exc: ObjectId) -> GuestResult<String> {
        let args = match self.get_attr(exc, "args") {
            Ok(args) => args,
            Err(_) => {
                self.err_clear();
                return Ok(String::new());
            }
        };
        let items = self.tuple_items(args).unwrap_or_default();
        let message = match items.as_slice() {
            [] => Ok(String::new()),
            [single] => self.str_of(*single),
            _ => self.repr_of(args),
        };
        self.dec_ref(args);
        message
    }

    /// `traceback.format_exception_only(etype, value)`.
    ///
    /// One line per exception, newline-terminated; builtin types print
    /// without a module prefix.
    pub fn format_exception_only(&self, etype: ObjectId, value: ObjectId) -> GuestResult<Vec<String>> {
        let module = self.type_module(etype);
        let name = self.type_name(etype);
        let qualified = if module.is_empty() || module == "builtins" {
            name
        } else {
            format!("{}.{}", module, name)
        };
        let message = if self.is_none(value) {
            String::new()
        } else {
            self.str_of(value)?
        };
        let line = if message.is_empty() {
            format!("{}\n", qualified)
        } else {
            format!("{}: {}\n", qualified, message)
        };
        Ok(vec![line])
    }

    /// True if `id` is a traceback object.
    pub fn is_traceback(&self, id: ObjectId) -> bool {
        self.with_object(id, |d| matches!(d, ObjectData::Traceback(_)))
            .unwrap_or(false)
    }
}
