//! Device lifecycle and state (C7): the per-device record anchoring the
//! endpoint list, request completions, and the socket a device's TX/RX
//! engines share.
//!
//! Grounded in the original driver's per-device WDF object — a fixed devid/
//! speed/port triple established once at `OP_REP_IMPORT` time, an
//! `unplugged` flag checked before every submission, and a single send lock
//! serializing CMD_SUBMIT/CMD_UNLINK writers onto one socket.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Mutex;

use protocol::iso::LocalIsoPacket;
use protocol::{Devid, Kind, SeqnumAllocator, Speed};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::endpoint::{EndpointId, EndpointList};
use crate::request_registry::RequestHandle;

/// The three strings identifying where an imported device lives, per §8's
/// `GET_IMPORTED_DEVICES`/`SET_PERSISTENT` record. `location_hash` dedups
/// reattach attempts for the same location without string comparison on
/// every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedDeviceLocation {
    pub node_name: String,
    pub service_name: String,
    pub busid: String,
}

impl ImportedDeviceLocation {
    pub fn location_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.node_name.hash(&mut hasher);
        self.service_name.hash(&mut hasher);
        self.busid.hash(&mut hasher);
        hasher.finish()
    }
}

/// Outcome of one completed transfer, delivered from the RX engine to the
/// caller that submitted it via a one-shot channel. Stands in for the
/// original driver's URB completion callback.
#[derive(Debug)]
pub enum TransferOutcome {
    Success { actual_length: u32, data: Vec<u8> },
    Error { kind: Kind, actual_length: u32 },
}

/// One imported device, live for as long as it occupies a controller port.
pub struct Device {
    pub devid: Devid,
    pub speed: Speed,
    pub location: ImportedDeviceLocation,
    port: AtomicU16,
    pub seqnum_alloc: SeqnumAllocator,
    pub endpoints: EndpointList,
    pub write_half: tokio::sync::Mutex<OwnedWriteHalf>,
    pub unplugged: AtomicBool,
    completions: Mutex<HashMap<RequestHandle, oneshot::Sender<TransferOutcome>>>,
    next_handle: AtomicU64,
    /// Join handle for this device's receive task, used by `detach` to
    /// apply the "defer if called from inside the RX task itself, else
    /// wait up to one minute" rule from §4.7.
    pub rx_task: Mutex<Option<JoinHandle<()>>>,
    /// The local packet offsets/lengths of the most recent still-in-flight
    /// isochronous submission per endpoint, stashed by the TX engine so the
    /// RX engine can restore padding on the matching RET_SUBMIT without
    /// threading the layout through the request registry itself.
    iso_layouts: Mutex<HashMap<EndpointId, Vec<LocalIsoPacket>>>,
    /// Handles of in-flight GET_DESCRIPTOR(CONFIGURATION) requests whose
    /// RET_SUBMIT payload needs the FULL-speed `bInterval` rewrite applied
    /// on completion (§4.5/§4.6).
    descriptor_postprocess: Mutex<HashSet<RequestHandle>>,
}

impl Device {
    pub fn new(
        devid: Devid,
        speed: Speed,
        location: ImportedDeviceLocation,
        write_half: OwnedWriteHalf,
        port: u16,
    ) -> Self {
        Device {
            devid,
            speed,
            location,
            port: AtomicU16::new(port),
            seqnum_alloc: SeqnumAllocator::new(),
            endpoints: EndpointList::new(),
            write_half: tokio::sync::Mutex::new(write_half),
            unplugged: AtomicBool::new(false),
            completions: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            rx_task: Mutex::new(None),
            iso_layouts: Mutex::new(HashMap::new()),
            descriptor_postprocess: Mutex::new(HashSet::new()),
        }
    }

    /// Records the local packet layout for an isochronous submission on
    /// `endpoint`, overwriting any previous one (only one isoch transfer is
    /// ever outstanding per endpoint at a time).
    pub fn set_iso_layout(&self, endpoint: EndpointId, packets: Vec<LocalIsoPacket>) {
        self.iso_layouts.lock().unwrap().insert(endpoint, packets);
    }

    /// Takes the layout stashed by [`Device::set_iso_layout`] for
    /// `endpoint`, if any, so the RX engine can restore padding on the
    /// matching completion.
    pub fn take_iso_layout(&self, endpoint: EndpointId) -> Option<Vec<LocalIsoPacket>> {
        self.iso_layouts.lock().unwrap().remove(&endpoint)
    }

    /// Marks `handle` as a GET_DESCRIPTOR(CONFIGURATION) request whose
    /// completion needs the FULL-speed `bInterval` rewrite.
    pub fn mark_descriptor_postprocess(&self, handle: RequestHandle) {
        self.descriptor_postprocess.lock().unwrap().insert(handle);
    }

    /// Takes (removes) the marker set by [`Device::mark_descriptor_postprocess`]
    /// for `handle`, returning whether it was set.
    pub fn take_descriptor_postprocess(&self, handle: RequestHandle) -> bool {
        self.descriptor_postprocess.lock().unwrap().remove(&handle)
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    /// Records the port assigned by [`crate::port_table::PortTable::claim`],
    /// called once right after claiming since the port number isn't known
    /// until the table picks a free slot for this already-constructed device.
    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::SeqCst);
    }

    pub fn is_unplugged(&self) -> bool {
        self.unplugged.load(Ordering::SeqCst)
    }

    pub fn mark_unplugged(&self) {
        self.unplugged.store(true, Ordering::SeqCst);
    }

    pub fn next_handle(&self) -> RequestHandle {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a completion channel for `handle`, overwriting any prior
    /// registration (handles are never reused while still pending).
    pub fn register_completion(&self, handle: RequestHandle, tx: oneshot::Sender<TransferOutcome>) {
        self.completions.lock().unwrap().insert(handle, tx);
    }

    /// Removes and returns the completion channel for `handle`, if still
    /// pending. Called exactly once per handle, by whichever of the RX
    /// engine (normal completion) or teardown (forced close) gets there
    /// first.
    pub fn take_completion(&self, handle: RequestHandle) -> Option<oneshot::Sender<TransferOutcome>> {
        self.completions.lock().unwrap().remove(&handle)
    }

    /// Fails every still-pending completion with `kind`, draining the map.
    /// Used on RX loop exit (§4.5's "drain, then detach_and_delete").
    pub fn fail_all_pending(&self, kind: Kind) {
        let pending: Vec<_> = self.completions.lock().unwrap().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(TransferOutcome::Error { kind, actual_length: 0 });
        }
    }
}
