//! Guest reference ownership
//!
//! [`OwnedRef`] is the scoped owner of one guest reference: it releases the
//! reference when dropped, on every exit path, unless ownership is handed
//! on with [`OwnedRef::detach`]. [`GuestObjectRef`] is the host-side payload
//! of a wrapped guest object; it only holds a weak link to the interpreter,
//! so a wrapper that outlives the guest runtime reports itself as a null
//! external pointer instead of dangling.

use std::fmt;
use std::sync::{Arc, Weak};

use tandem_guest::{GuestResult, Interpreter, ObjectId};

use crate::error::{BridgeError, BridgeResult};

// ============================================================================
// OwnedRef
// ============================================================================

/// One owned guest reference, released on drop.
pub struct OwnedRef<'a> {
    interp: &'a Interpreter,
    id: ObjectId,
}

impl<'a> OwnedRef<'a> {
    /// Take ownership of a new reference.
    pub fn new(interp: &'a Interpreter, id: ObjectId) -> Self {
        Self { interp, id }
    }

    /// Take a new reference to a borrowed object.
    pub fn borrowed(interp: &'a Interpreter, id: ObjectId) -> Self {
        interp.inc_ref(id);
        Self { interp, id }
    }

    /// Wrap the result of a guest call returning a new reference.
    pub fn from_result(interp: &'a Interpreter, result: GuestResult<ObjectId>) -> GuestResult<Self> {
        result.map(|id| Self::new(interp, id))
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn interpreter(&self) -> &'a Interpreter {
        self.interp
    }

    /// Give up ownership without releasing, e.g. into a container that
    /// steals the reference.
    pub fn detach(self) -> ObjectId {
        let id = self.id;
        std::mem::forget(self);
        id
    }
}

impl Clone for OwnedRef<'_> {
    fn clone(&self) -> Self {
        Self::borrowed(self.interp, self.id)
    }
}

impl Drop for OwnedRef<'_> {
    fn drop(&mut self) {
        self.interp.dec_ref(self.id);
    }
}

impl fmt::Debug for OwnedRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnedRef({})", self.id)
    }
}

// ============================================================================
// GuestObjectRef
// ============================================================================

/// A guest object held by a host value.
///
/// Owns one guest reference, released when the last host value holding
/// this payload is dropped.
pub struct GuestObjectRef {
    interp: Weak<Interpreter>,
    id: ObjectId,
    convert: bool,
}

impl GuestObjectRef {
    /// Wrap an owned reference; ownership moves into the wrapper.
    pub fn new(interp: &Arc<Interpreter>, owned: OwnedRef<'_>, convert: bool) -> Self {
        Self {
            interp: Arc::downgrade(interp),
            id: owned.detach(),
            convert,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Whether values obtained through this object convert to host values.
    pub fn convert(&self) -> bool {
        self.convert
    }

    /// True once the interpreter that owned the object is gone.
    pub fn is_null_xptr(&self) -> bool {
        self.interp.strong_count() == 0
    }

    /// The owning interpreter, or [`BridgeError::Disconnected`].
    pub fn interpreter(&self) -> BridgeResult<Arc<Interpreter>> {
        self.interp.upgrade().ok_or(BridgeError::Disconnected)
    }

    /// A new owned reference to the object.
    pub fn new_ref<'a>(&self, interp: &'a Interpreter) -> OwnedRef<'a> {
        OwnedRef::borrowed(interp, self.id)
    }
}

impl Drop for GuestObjectRef {
    fn drop(&mut self) {
        if let Some(interp) = self.interp.upgrade() {
            interp.dec_ref(self.id);
        }
    }
}

impl fmt::Debug for GuestObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestObjectRef")
            .field("id", &self.id)
            .field("convert", &self.convert)
            .field("null", &self.is_null_xptr())
            .finish()
    }
}
