//! Endpoint list (C6): the set of pipes open on a device, each carrying its
//! own in-flight request registry.
//!
//! Grounded in the original driver's per-device endpoint array plus the
//! per-endpoint request list it anchors; the default control pipe is always
//! present and is never removed by [`EndpointList::remove`].

use std::sync::Mutex;

use protocol::submit::EndpointDescriptor;

use crate::request_registry::RequestRegistry;

/// Local identifier for one open pipe on a device. `0` is always the
/// default control pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub u32);

impl EndpointId {
    pub const CONTROL: EndpointId = EndpointId(0);

    /// Derives the key identifying a (number, direction) pair, matching the
    /// `ep`/`direction` fields carried separately in every PDU header: the
    /// low nibble is the endpoint number, bit 4 is direction (set = IN).
    pub fn for_number(number: u32, dir_in: bool) -> EndpointId {
        EndpointId(number | if dir_in { 0x10 } else { 0 })
    }
}

/// One endpoint's descriptor plus the request registry serving it.
pub struct EndpointContext {
    pub id: EndpointId,
    pub descriptor: EndpointDescriptor,
    pub requests: RequestRegistry,
}

impl EndpointContext {
    fn new(id: EndpointId, descriptor: EndpointDescriptor) -> Self {
        EndpointContext {
            id,
            descriptor,
            requests: RequestRegistry::new(),
        }
    }
}

/// The device's endpoint list, indexed by [`EndpointId`]. The default
/// control pipe is inserted by [`EndpointList::new`] and is always list
/// head, matching the original's invariant that endpoint 0 is never absent.
#[derive(Default)]
pub struct EndpointList {
    inner: Mutex<Vec<EndpointContext>>,
}

impl EndpointList {
    pub fn new() -> Self {
        let control = EndpointContext::new(
            EndpointId::CONTROL,
            EndpointDescriptor { address: 0, interval: 0 },
        );
        EndpointList {
            inner: Mutex::new(vec![control]),
        }
    }

    /// Adds a non-control endpoint, replacing any prior entry with the same
    /// address/direction. Returns the assigned [`EndpointId`].
    pub fn add(&self, descriptor: EndpointDescriptor) -> EndpointId {
        let id = EndpointId::for_number(descriptor.number(), !descriptor.dir_out());
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|e| e.id != id);
        inner.push(EndpointContext::new(id, descriptor));
        id
    }

    /// Removes every non-control endpoint, used when the device is
    /// reconfigured (a new `SET_CONFIGURATION`/`SET_INTERFACE`).
    pub fn clear_non_control(&self) {
        self.inner.lock().unwrap().retain(|e| e.id == EndpointId::CONTROL);
    }

    pub fn with_registry<R>(&self, id: EndpointId, f: impl FnOnce(&RequestRegistry) -> R) -> Option<R> {
        let inner = self.inner.lock().unwrap();
        inner.iter().find(|e| e.id == id).map(|e| f(&e.requests))
    }

    pub fn descriptor(&self, id: EndpointId) -> Option<EndpointDescriptor> {
        self.inner.lock().unwrap().iter().find(|e| e.id == id).map(|e| e.descriptor)
    }

    pub fn ids(&self) -> Vec<EndpointId> {
        self.inner.lock().unwrap().iter().map(|e| e.id).collect()
    }

    /// Cancels every in-flight request on every endpoint, returning their
    /// handles. Used by device teardown (§4.7 `D0Exit`/unplug path).
    pub fn cancel_all(&self) -> Vec<crate::request_registry::RequestHandle> {
        let inner = self.inner.lock().unwrap();
        inner
            .iter()
            .flat_map(|e| e.requests.remove(crate::request_registry::RequestSearch::Endpoint(e.id), true))
            .collect()
    }
}
