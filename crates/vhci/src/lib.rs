//! USB/IP virtual host controller core: device lifecycle, the per-device
//! TX/RX engines, the port table, the reattach supervisor, persisted
//! state, and the [`Controller`] that ties them together behind the §6
//! command surface.
//!
//! This crate owns no kernel device object and drives no real USB host
//! controller; it assumes a stream-socket transport (here, TCP) and a
//! [`host::HostSurface`] it calls out to when a device should appear on or
//! leave the local bus. A concrete platform backend for that surface, and
//! the binary exposing the command surface itself, live outside this
//! crate (see the `cli` crate).

pub mod config;
pub mod controller;
pub mod device;
pub mod endpoint;
pub mod events;
pub mod host;
pub mod persistence;
pub mod port_table;
pub mod reattach;
pub mod request_registry;
pub mod rx;
pub mod socket;
pub mod tx;

pub use config::VhciConfig;
pub use controller::{Controller, ImportedDevice};
pub use device::{Device, ImportedDeviceLocation, TransferOutcome};
pub use endpoint::EndpointId;
pub use events::{DeviceState, DeviceStateEvent};
pub use host::{HostSurface, NullHostSurface};
pub use tx::TxEngine;
