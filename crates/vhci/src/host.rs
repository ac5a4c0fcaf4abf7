//! Host USB emulation surface: the boundary the core talks to in order to
//! present an imported device to the local USB stack.
//!
//! Per §1's explicit non-goal, the host-side virtual hub/HCD is an external
//! collaborator with a defined interface only — no kernel driver, platform
//! ioctl, or device node is implemented here. [`HostSurface`] names the
//! callbacks the controller drives during C7's attach/detach sequence
//! (`D0Entry`/`D0Exit`, endpoint bring-up, function suspend) so a concrete
//! platform backend can be dropped in later without touching the engine.
//!
//! A real Linux backend would attach by writing
//! `"<port> <sockfd> <devid> <speed>"` to
//! `/sys/devices/platform/vhci_hcd.0/attach`, as the upstream `usbip` client
//! does; [`NullHostSurface`] only logs the calls it would make.

use async_trait::async_trait;
use protocol::{Devid, Speed};

use crate::endpoint::EndpointId;

#[async_trait]
pub trait HostSurface: Send + Sync {
    /// The device has been attached to `port` and is ready to appear on the
    /// local bus (the `D0Entry` callback of §4.7).
    async fn device_arrived(&self, port: u16, devid: Devid, speed: Speed);

    /// The device is leaving `port`, either by request or because the
    /// connection died (`D0Exit`).
    async fn device_departed(&self, port: u16, devid: Devid);

    /// A new non-default endpoint was opened and should be exposed to the
    /// host stack (`EndpointAdd`).
    async fn endpoint_added(&self, port: u16, endpoint: EndpointId);

    /// The active configuration/interface changed; the previous
    /// non-control endpoint set should be torn down (`EndpointsConfigure`).
    async fn endpoints_reconfigured(&self, port: u16);

    /// The function on `port` is asked to suspend or resume
    /// (`FunctionSuspend`).
    async fn function_suspend(&self, port: u16, suspend: bool);
}

/// A no-op backend that only logs, used where no real host integration is
/// wired in (tests, and any platform without a concrete backend yet).
#[derive(Debug, Default)]
pub struct NullHostSurface;

#[async_trait]
impl HostSurface for NullHostSurface {
    async fn device_arrived(&self, port: u16, devid: Devid, speed: Speed) {
        tracing::info!(port, %devid, %speed, "host surface: device arrived (no-op backend)");
    }

    async fn device_departed(&self, port: u16, devid: Devid) {
        tracing::info!(port, %devid, "host surface: device departed (no-op backend)");
    }

    async fn endpoint_added(&self, port: u16, endpoint: EndpointId) {
        tracing::debug!(port, endpoint = endpoint.0, "host surface: endpoint added (no-op backend)");
    }

    async fn endpoints_reconfigured(&self, port: u16) {
        tracing::debug!(port, "host surface: endpoints reconfigured (no-op backend)");
    }

    async fn function_suspend(&self, port: u16, suspend: bool) {
        tracing::debug!(port, suspend, "host surface: function suspend (no-op backend)");
    }
}
