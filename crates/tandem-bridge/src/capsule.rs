//! Host values inside guest capsules
//!
//! A host capsule roots its host value in the session when created and
//! unroots it exactly once when the guest frees the capsule. Unrooting
//! touches host state, so a capsule finalized on any other thread hands the
//! release to the dispatcher instead of doing it in place.

use std::sync::Arc;

use tandem_guest::{CapsuleDestructor, Interpreter, ObjectId};
use tandem_host::{ExternalPtr, HostSession, HostValue, PreciousToken};

use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, BridgeResult};
use crate::handle::OwnedRef;

/// Name tag identifying host-value capsules.
pub const HOST_CAPSULE_TAG: &str = "host_object";

/// Payload of a host capsule.
#[derive(Debug)]
pub struct HostCapsule {
    value: HostValue,
    token: PreciousToken,
}

impl HostCapsule {
    pub fn value(&self) -> &HostValue {
        &self.value
    }

    pub fn token(&self) -> PreciousToken {
        self.token
    }
}

/// Wrap `value` in a new host capsule. Must run on the host thread.
pub fn new_host_capsule<'a>(
    interp: &'a Interpreter,
    session: &Arc<HostSession>,
    dispatcher: &Dispatcher,
    value: HostValue,
) -> BridgeResult<OwnedRef<'a>> {
    let token = session.preserve(value.clone())?;
    let payload = Arc::new(HostCapsule { value, token });

    let session = session.clone();
    let dispatcher = dispatcher.clone();
    let destructor: CapsuleDestructor = Box::new(move |interp, payload| {
        if let Some(capsule) = payload.downcast_ref::<HostCapsule>() {
            release_on_main_thread(interp, &session, &dispatcher, capsule.token);
        }
    });

    let id = interp.new_capsule(payload, Some(HOST_CAPSULE_TAG), Some(destructor));
    Ok(OwnedRef::new(interp, id))
}

/// Unroot `token`, deferring to the host thread when called elsewhere.
pub fn release_on_main_thread(
    interp: &Interpreter,
    session: &Arc<HostSession>,
    dispatcher: &Dispatcher,
    token: PreciousToken,
) {
    if session.is_main_thread() {
        if let Err(e) = session.release(token) {
            tracing::error!(token = token.id(), error = %e, "failed to release host object");
        }
        return;
    }

    let session = session.clone();
    let scheduled = dispatcher.submit(
        interp,
        Box::new(move |_interp| {
            if let Err(e) = session.release(token) {
                tracing::error!(token = token.id(), error = %e, "failed to release host object");
            }
            Ok(())
        }),
    );
    if scheduled.is_err() {
        // abandoned: the value stays rooted for the rest of the session
        tracing::error!(token = token.id(), "unable to register host object finalizer on main thread");
    }
}

/// True if `id` is a capsule created by [`new_host_capsule`].
pub fn is_host_capsule(interp: &Interpreter, id: ObjectId) -> bool {
    interp.is_capsule(id) && interp.capsule_name(id).as_deref() == Some(HOST_CAPSULE_TAG)
}

/// The host value carried by a host capsule.
pub fn host_capsule_value(interp: &Interpreter, id: ObjectId) -> BridgeResult<HostValue> {
    let payload = match interp.capsule_payload(id, Some(HOST_CAPSULE_TAG)) {
        Ok(payload) => payload,
        Err(_) => {
            interp.err_clear();
            return Err(BridgeError::InvalidCapsule(format!(
                "{} is not a host object capsule",
                id
            )));
        }
    };
    payload
        .downcast_ref::<HostCapsule>()
        .map(|c| c.value.clone())
        .ok_or_else(|| BridgeError::InvalidCapsule(format!("{} carries a foreign payload", id)))
}

/// Record the conversion mode on a capsule.
pub fn set_capsule_convert(interp: &Interpreter, id: ObjectId, convert: bool) -> BridgeResult<()> {
    interp.capsule_set_context(id, Arc::new(convert)).map_err(|_| {
        interp.err_clear();
        BridgeError::InvalidCapsule(format!("{} is not a capsule", id))
    })
}

/// Conversion mode recorded on a capsule; `false` when none was set.
pub fn capsule_convert(interp: &Interpreter, id: ObjectId) -> bool {
    interp
        .capsule_context(id)
        .and_then(|c| c.downcast_ref::<bool>().copied())
        .unwrap_or(false)
}

/// A lightweight capsule around a raw address. It has no finalizer.
pub fn external_pointer_capsule(interp: &Interpreter, ptr: ExternalPtr) -> BridgeResult<OwnedRef<'_>> {
    if ptr.is_null() {
        return Err(BridgeError::NullExternalPointer);
    }
    let id = interp.new_capsule(Arc::new(ptr), None, None);
    Ok(OwnedRef::new(interp, id))
}
