//! Controller event broadcast (§4.8): every port state transition is
//! delivered to every reader subscribed through the blocking read/event
//! interface (§6), bounded per subscriber with the oldest record dropped
//! first when a reader falls behind.
//!
//! Grounded in §5's own Rust-mapping guidance: `tokio::sync::broadcast`'s
//! lagging-receiver semantics (`RecvError::Lagged(n)`) are the direct
//! analogue of "bounded per-subscriber queue, oldest dropped on overflow" —
//! a lagged reader just skips ahead to the oldest record still buffered
//! rather than blocking the controller on a slow subscriber.

use protocol::{Devid, Speed};

use crate::device::ImportedDeviceLocation;

/// One port's state transition, as delivered to every subscribed reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStateEvent {
    pub port: u16,
    pub state: DeviceState,
    pub devid: Option<Devid>,
    pub speed: Option<Speed>,
    pub location: ImportedDeviceLocation,
}

/// Port lifecycle states surfaced over the event interface (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Resolving/connecting to the remote host.
    Connecting,
    /// TCP connected, handshake in progress.
    Connected,
    /// Plugged into a port and visible to the host surface.
    Plugged,
    /// Detach requested, tearing down.
    Unplugging,
    /// No longer occupying a port.
    Unplugged,
    /// The attach attempt failed before a port was ever claimed.
    Disconnected,
}

const DEFAULT_CAPACITY: usize = 256;

/// Bounded fan-out broadcast of [`DeviceStateEvent`]s.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<DeviceStateEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DeviceStateEvent> {
        self.tx.subscribe()
    }

    /// Publishes `event`. A send error just means there are currently no
    /// subscribers; the event is simply not retained for future ones.
    pub fn publish(&self, event: DeviceStateEvent) {
        let _ = self.tx.send(event);
    }
}
