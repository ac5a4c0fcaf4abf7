//! Controller (C8): owns the port table, the reattach supervisor, the
//! persisted-location store, and the event bus, and dispatches the §6
//! IOCTL-equivalent command surface (`plugin`/`plugin-internal`/`plugout`/
//! `list`/`set-persistent`/`get-persistent`) against them.
//!
//! Grounded in the teacher's `VirtualUsbManager`
//! (`client/src/virtual_usb/mod.rs`): a single manager struct wrapping the
//! attach/detach/list surface behind `Arc<Self>` methods, with the actual
//! per-device work delegated to the device/TX/RX layer. The attach
//! sequencing itself (resolve → connect → handshake → claim → spawn
//! receive task) follows the original driver's `vhci.cpp`/`network.cpp`
//! pair, described in full in SPEC_FULL §4.7/§4.8.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use protocol::{Devid, Kind, Speed};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::lookup_host;
use tokio::task::JoinHandle;

use crate::config::VhciConfig;
use crate::device::{Device, ImportedDeviceLocation};
use crate::endpoint::EndpointId;
use crate::events::{DeviceState, DeviceStateEvent, EventBus};
use crate::host::HostSurface;
use crate::persistence::PersistenceStore;
use crate::port_table::PortTable;
use crate::reattach::ReattachSupervisor;
use crate::{rx, socket};

/// `GET_IMPORTED_DEVICES` record shape (SPEC_FULL §6 supplement): port,
/// speed, devid, and the location triple identifying where it came from.
#[derive(Debug, Clone)]
pub struct ImportedDevice {
    pub port: u16,
    pub speed: Speed,
    pub devid: Devid,
    pub location: ImportedDeviceLocation,
}

/// The controller (VHCI): the single top-level value a binary surface
/// drives. Everything under it is reachable only through `&Arc<Controller>`
/// methods since the receive task and the reattach loop both hold a clone.
pub struct Controller {
    config: VhciConfig,
    ports: PortTable<Device>,
    reattach: ReattachSupervisor,
    persistence: StdMutex<PersistenceStore>,
    events: EventBus,
    host: Arc<dyn HostSurface>,
    shutting_down: AtomicBool,
}

impl Controller {
    pub fn new(config: VhciConfig, host: Arc<dyn HostSurface>) -> anyhow::Result<Arc<Self>> {
        let persistence = PersistenceStore::load(config.persistence_path())?;
        let ports = PortTable::new(config.ports.number_of_usb20_ports, config.ports.number_of_usb30_ports);
        let reattach = ReattachSupervisor::new(&config.reattach, config.total_ports());
        Ok(Arc::new(Controller {
            ports,
            reattach,
            persistence: StdMutex::new(persistence),
            events: EventBus::default(),
            host,
            shutting_down: AtomicBool::new(false),
            config,
        }))
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<DeviceStateEvent> {
        self.events.subscribe()
    }

    /// Boot-time load of persisted devices (SPEC_FULL §4.9 supplement):
    /// every persisted location gets a reattach entry going through the
    /// normal SCHEDULED → ATTEMPT timer path, so a slow or unreachable
    /// persisted host never blocks startup.
    pub fn load_persistent_devices(&self) {
        let locations = self.persistence.lock().unwrap().get_persistent();
        for location in locations {
            tracing::info!(
                node_name = %location.node_name, busid = %location.busid,
                "scheduling boot-time reattach for persisted device"
            );
            self.reattach.schedule(location);
        }
    }

    /// `PLUGIN_HARDWARE`: attach a remote device, scheduling an automatic
    /// reattach on a retryable failure.
    pub async fn plugin(self: &Arc<Self>, node_name: &str, service_name: &str, busid: &str) -> Result<u16, Kind> {
        let location = ImportedDeviceLocation {
            node_name: node_name.to_string(),
            service_name: service_name.to_string(),
            busid: busid.to_string(),
        };
        let result = self.plugin_inner(&location).await;
        if let Err(kind) = &result {
            if kind.is_retryable() {
                self.reattach.schedule(location);
            }
        }
        result
    }

    /// `PLUGIN_HARDWARE_INTERNAL`: the same attach sequence, driven only by
    /// the reattach supervisor's own timer. Scheduling the next attempt is
    /// the caller's responsibility (via `on_success`/`on_failure`), not this
    /// method's — otherwise every failure would double-schedule.
    pub async fn plugin_internal(self: &Arc<Self>, location: &ImportedDeviceLocation) -> Result<u16, Kind> {
        self.plugin_inner(location).await
    }

    async fn plugin_inner(self: &Arc<Self>, location: &ImportedDeviceLocation) -> Result<u16, Kind> {
        let result = self.attach(location).await;
        if result.is_err() {
            self.events.publish(DeviceStateEvent {
                port: 0,
                state: DeviceState::Disconnected,
                devid: None,
                speed: None,
                location: location.clone(),
            });
        }
        result
    }

    /// The attach sequence proper (resolve → connect → handshake → claim →
    /// spawn receive task). Split out of `plugin_inner` so every failure
    /// path, without exception, runs through the single `Disconnected`
    /// publish above — none of them have claimed a port yet.
    async fn attach(self: &Arc<Self>, location: &ImportedDeviceLocation) -> Result<u16, Kind> {
        if self.is_already_attached(location) {
            return Err(Kind::Busy);
        }

        self.events.publish(DeviceStateEvent {
            port: 0,
            state: DeviceState::Connecting,
            devid: None,
            speed: None,
            location: location.clone(),
        });

        let addr_str = format!("{}:{}", location.node_name, location.service_name);
        let addrs: Vec<SocketAddr> = lookup_host(addr_str.as_str())
            .await
            .map_err(|e| {
                tracing::warn!(%addr_str, error = %e, "DNS resolution failed");
                Kind::Network
            })?
            .collect();
        if addrs.is_empty() {
            tracing::warn!(%addr_str, "DNS resolution returned no addresses");
            return Err(Kind::Network);
        }

        let mut stream = socket::connect_first_reachable(&addrs, &self.config.keepalive)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "connect failed for every candidate address");
                Kind::Network
            })?;

        self.events.publish(DeviceStateEvent {
            port: 0,
            state: DeviceState::Connected,
            devid: None,
            speed: None,
            location: location.clone(),
        });

        let req = protocol::encode_req_import(&location.busid).map_err(|_| Kind::Protocol)?;
        stream.write_all(&req).await.map_err(|_| Kind::Network)?;

        let mut reply = vec![0u8; protocol::handshake::REP_IMPORT_REPLY_SIZE];
        stream.read_exact(&mut reply).await.map_err(|_| Kind::Network)?;
        let record = protocol::decode_rep_import(&reply, &location.busid).map_err(|e| e.kind())?;

        let speed = Speed::from_wire(record.speed).ok_or(Kind::Protocol)?;
        let devid = Devid::new(record.busnum as u16, record.devnum as u16);

        let (read_half, write_half) = socket::split(stream);
        let device = Arc::new(Device::new(devid, speed, location.clone(), write_half, 0));

        let port = self.ports.claim(speed, device.clone()).ok_or(Kind::PortFull)?;
        device.set_port(port);

        self.spawn_rx_task(port, device.clone(), read_half);

        self.host.device_arrived(port, devid, speed).await;
        self.host.endpoint_added(port, EndpointId::CONTROL).await;
        self.events.publish(DeviceStateEvent {
            port,
            state: DeviceState::Plugged,
            devid: Some(devid),
            speed: Some(speed),
            location: location.clone(),
        });

        tracing::info!(port, %devid, %speed, node_name = %location.node_name, busid = %location.busid, "device plugged in");
        Ok(port)
    }

    fn is_already_attached(&self, location: &ImportedDeviceLocation) -> bool {
        self.ports.occupied().iter().any(|(_, d)| d.location == *location)
    }

    /// Spawns the per-device receive task. On exit, `on_rx_exit` performs
    /// the same teardown `plugout` would, but never touches its own join
    /// handle — a task cannot usefully abort or await itself, so the
    /// "thread-join rule" (§4.7) only applies to the externally-invoked
    /// detach path below.
    fn spawn_rx_task(self: &Arc<Self>, port: u16, device: Arc<Device>, read_half: tokio::net::tcp::OwnedReadHalf) {
        let controller = self.clone();
        let layout_device = device.clone();
        let run_device = device.clone();
        let handle = tokio::spawn(async move {
            let kind = rx::run(run_device, read_half, move |ep| {
                layout_device.take_iso_layout(ep).map(|local_packets| rx::IsochLayout { local_packets })
            })
            .await;
            controller.on_rx_exit(port, kind).await;
        });
        // `device` is the same Arc already stored in the port table by
        // `claim`; stashing the handle here is only ever read by a
        // *different* caller (`plugout`) since a task cannot join itself.
        *device.rx_task.lock().unwrap() = Some(handle);
    }

    /// Common teardown once a device has been reclaimed from the port
    /// table, shared by the explicit `plugout` path and the receive task's
    /// own exit handling.
    async fn teardown(&self, port: u16, device: &Arc<Device>) {
        device.mark_unplugged();
        device.endpoints.cancel_all();
        device.fail_all_pending(Kind::DeviceRemoved);
        rx::shutdown_write(device).await;
        self.host.device_departed(port, device.devid).await;
        self.events.publish(DeviceStateEvent {
            port,
            state: DeviceState::Unplugged,
            devid: Some(device.devid),
            speed: Some(device.speed),
            location: device.location.clone(),
        });
    }

    /// Called from within the spawned receive task once its loop exits.
    /// Races against an explicit `plugout`: whichever side successfully
    /// reclaims the port from the table does the teardown; the loser finds
    /// the port already empty and does nothing.
    async fn on_rx_exit(self: Arc<Self>, port: u16, kind: Kind) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let Some(device) = self.ports.reclaim(port) else {
            return;
        };
        tracing::info!(port, ?kind, "receive loop exited, tearing down device");
        self.teardown(port, &device).await;
        if kind.is_retryable() {
            self.reattach.schedule(device.location.clone());
        }
    }

    /// `PLUGOUT_HARDWARE`: detach the device at `port` (or, if `port == 0`,
    /// every occupied port). `reattach` requests an automatic reattach
    /// attempt afterward, independent of whether the disconnect itself was
    /// the user's request or a dead connection.
    pub async fn plugout(self: &Arc<Self>, port: u16, reattach: bool) -> Result<(), Kind> {
        if port == 0 {
            self.detach_all().await;
            return Ok(());
        }
        let Some(device) = self.ports.reclaim(port) else {
            return Err(Kind::NotFound);
        };
        self.events.publish(DeviceStateEvent {
            port,
            state: DeviceState::Unplugging,
            devid: Some(device.devid),
            speed: Some(device.speed),
            location: device.location.clone(),
        });
        self.teardown(port, &device).await;
        if reattach {
            self.reattach.schedule(device.location.clone());
        } else {
            self.reattach.cancel(device.location.location_hash());
        }

        // Thread-join rule (§4.7): we are not the receive task, so abort it
        // and wait up to one minute for it to actually finish.
        let handle: Option<JoinHandle<()>> = device.rx_task.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = tokio::time::timeout(Duration::from_secs(60), handle).await;
        }
        Ok(())
    }

    /// Detaches every currently occupied port, used on controller shutdown.
    pub async fn detach_all(self: &Arc<Self>) {
        for (port, _) in self.ports.occupied() {
            let _ = self.plugout(port, false).await;
        }
    }

    /// `GET_IMPORTED_DEVICES`.
    pub fn get_imported_devices(&self) -> Vec<ImportedDevice> {
        self.ports
            .occupied()
            .into_iter()
            .map(|(port, device)| ImportedDevice {
                port,
                speed: device.speed,
                devid: device.devid,
                location: device.location.clone(),
            })
            .collect()
    }

    /// Endpoint bring-up/reconfigure (§4.7's "endpoint-add /
    /// endpoints-configure"): replaces every non-control endpoint on `port`
    /// with `descriptors` and notifies the host surface of the new
    /// configuration, endpoint by endpoint. Called once a caller has learned
    /// the device's active configuration's endpoint descriptors (e.g. from
    /// a GET_DESCRIPTOR(CONFIGURATION) completion).
    pub async fn configure_endpoints(&self, port: u16, descriptors: &[protocol::submit::EndpointDescriptor]) -> Result<(), Kind> {
        let device = self.ports.get(port).ok_or(Kind::NotFound)?;
        device.endpoints.clear_non_control();
        self.host.endpoints_reconfigured(port).await;
        for descriptor in descriptors {
            let id = device.endpoints.add(*descriptor);
            self.host.endpoint_added(port, id).await;
        }
        Ok(())
    }

    /// Asks the host surface to suspend or resume the function on `port`
    /// (§4.7's `FunctionSuspend`).
    pub async fn suspend_function(&self, port: u16, suspend: bool) -> Result<(), Kind> {
        self.ports.get(port).ok_or(Kind::NotFound)?;
        self.host.function_suspend(port, suspend).await;
        Ok(())
    }

    /// `SET_PERSISTENT`.
    pub fn set_persistent(&self, location: ImportedDeviceLocation) -> anyhow::Result<()> {
        self.persistence.lock().unwrap().set_persistent(&location)
    }

    /// Removes a location from the persisted set (not a row in the §6
    /// table by name, but the natural complement `set-persistent` needs).
    pub fn clear_persistent(&self, location: &ImportedDeviceLocation) -> anyhow::Result<()> {
        self.persistence.lock().unwrap().clear_persistent(location)
    }

    /// `GET_PERSISTENT`.
    pub fn get_persistent(&self) -> Vec<ImportedDeviceLocation> {
        self.persistence.lock().unwrap().get_persistent()
    }

    /// Drives the reattach supervisor: on a fixed tick, attempts every
    /// location whose backoff delay has elapsed. Runs until the controller
    /// is dropped (all `Arc` clones gone) or `shutdown` is called.
    pub async fn run_reattach_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            for (hash, location) in self.reattach.due_for_attempt() {
                tracing::debug!(node_name = %location.node_name, busid = %location.busid, "attempting scheduled reattach");
                match self.plugin_internal(&location).await {
                    Ok(port) => {
                        tracing::info!(port, busid = %location.busid, "reattach succeeded");
                        self.reattach.on_success(hash);
                    }
                    Err(kind) if kind.is_retryable() => {
                        tracing::warn!(?kind, busid = %location.busid, "reattach attempt failed");
                        self.reattach.on_failure(hash);
                    }
                    Err(kind) => {
                        tracing::warn!(?kind, busid = %location.busid, "reattach attempt failed with a non-retryable error, giving up");
                        self.reattach.cancel(hash);
                    }
                }
            }
        }
    }

    /// Stops the reattach loop and detaches every attached device. Used at
    /// process shutdown to release sockets deterministically rather than
    /// relying on process exit.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.detach_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NullHostSurface;

    fn test_controller() -> Arc<Controller> {
        let mut config = VhciConfig::default();
        let dir = tempfile::tempdir().unwrap();
        config.persistence_path = Some(dir.path().join("imported_devices.toml"));
        // Keep the test fast and deterministic regardless of the temp dir's lifetime.
        std::mem::forget(dir);
        Controller::new(config, Arc::new(NullHostSurface)).unwrap()
    }

    #[test]
    fn get_imported_devices_starts_empty() {
        let controller = test_controller();
        assert!(controller.get_imported_devices().is_empty());
    }

    #[test]
    fn persistence_round_trips_through_the_controller() {
        let controller = test_controller();
        let location = ImportedDeviceLocation {
            node_name: "host".into(),
            service_name: "3240".into(),
            busid: "1-1".into(),
        };
        controller.set_persistent(location.clone()).unwrap();
        assert_eq!(controller.get_persistent(), vec![location.clone()]);
        controller.clear_persistent(&location).unwrap();
        assert!(controller.get_persistent().is_empty());
    }

    #[tokio::test]
    async fn plugout_of_an_unoccupied_port_is_not_found() {
        let controller = test_controller();
        let err = controller.plugout(1, false).await.unwrap_err();
        assert_eq!(err, Kind::NotFound);
    }

    #[tokio::test]
    async fn plugin_of_an_unreachable_host_fails_with_network_and_schedules_reattach() {
        let controller = test_controller();
        // Port 0 in TCP means "ask the OS for any free port", so connecting
        // to it always fails fast without touching the network.
        let err = controller.plugin("127.0.0.1", "0", "1-1").await.unwrap_err();
        assert_eq!(err, Kind::Network);
    }

    #[tokio::test]
    async fn plugin_failure_publishes_disconnected_before_any_port_is_claimed() {
        let controller = test_controller();
        let mut events = controller.subscribe_events();
        let _ = controller.plugin("127.0.0.1", "0", "1-1").await;
        let event = events.recv().await.unwrap();
        assert_eq!(event.state, DeviceState::Connecting);
        let event = events.recv().await.unwrap();
        assert_eq!(event.state, DeviceState::Disconnected);
        assert_eq!(event.port, 0);
    }

    #[tokio::test]
    async fn configure_endpoints_on_an_unoccupied_port_is_not_found() {
        let controller = test_controller();
        let err = controller.configure_endpoints(1, &[]).await.unwrap_err();
        assert_eq!(err, Kind::NotFound);
    }

    #[tokio::test]
    async fn suspend_function_on_an_unoccupied_port_is_not_found() {
        let controller = test_controller();
        let err = controller.suspend_function(1, true).await.unwrap_err();
        assert_eq!(err, Kind::NotFound);
    }
}
