//! `usbip-vhci`: a thin binary surface over the [`vhci`] library's
//! [`Controller`], exposing the §6 IOCTL-equivalent command table as
//! subcommands so the core is independently drivable and testable without
//! an actual host-side USB emulation backend.
//!
//! Grounded in the teacher's `client`/`server` binary entrypoints: a single
//! derived `Args` struct carrying `--config`/`--save-config`/`--log-level`,
//! config loaded before logging is set up so a config-supplied log level
//! can still take effect, and a long-running mode that attaches/watches
//! until `Ctrl+C`.
//!
//! This binary does not run a resident daemon other processes can attach
//! to: each invocation owns its own [`Controller`] for the duration of the
//! command. `plugin`/`plugin-internal`/`watch` hold that controller open
//! (and keep its reattach supervisor ticking) until interrupted; `plugout`,
//! `list`, `set-persistent`, and `get-persistent` act against a freshly
//! constructed one and exit immediately, so they only ever see the
//! persisted device set, not ports attached by a concurrently running
//! `plugin`/`watch` invocation. A deployment that needs those subcommands
//! to affect a shared, already-running controller would add an IPC
//! transport in front of it; that transport is outside this spec's scope.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;

use vhci::{Controller, DeviceState, ImportedDeviceLocation, NullHostSurface, VhciConfig};

#[derive(Parser, Debug)]
#[command(name = "usbip-vhci")]
#[command(author, version, about = "USB/IP virtual host controller core")]
#[command(long_about = "
Drives the USB/IP virtual host controller core directly from the command
line: attach and detach remote devices, inspect and manage the persisted
device list, and watch the controller's port-state event stream.

CONFIGURATION:
    The controller looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbip-vhci/vhci.toml
    3. /etc/usbip-vhci/vhci.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit.
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// PLUGIN_HARDWARE: attach a remote device and hold it attached until interrupted.
    Plugin {
        /// Remote host name or address.
        node_name: String,
        /// Remote service name or port.
        service_name: String,
        /// Remote bus id (e.g. "1-1").
        busid: String,
    },

    /// PLUGIN_HARDWARE_INTERNAL: the reattach supervisor's own attach path, exposed for manual testing.
    #[command(hide = true)]
    PluginInternal {
        node_name: String,
        service_name: String,
        busid: String,
    },

    /// PLUGOUT_HARDWARE: detach the device at a port (0 = every port).
    Plugout {
        /// Port number, or 0 for every occupied port.
        port: u16,
        /// Schedule an automatic reattach after detaching.
        #[arg(long)]
        reattach: bool,
    },

    /// GET_IMPORTED_DEVICES: list currently attached devices.
    List,

    /// SET_PERSISTENT: remember a device location for boot-time reattach.
    SetPersistent {
        node_name: String,
        service_name: String,
        busid: String,
    },

    /// GET_PERSISTENT: list persisted device locations.
    GetPersistent,

    /// Load persisted devices, run the reattach supervisor, and stream port-state events until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = VhciConfig::default();
        let path = VhciConfig::default_path();
        config.save(&path).context("failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        VhciConfig::load(Some(path.clone())).context("failed to load configuration")?
    } else {
        VhciConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or("info");
    common::setup_logging(log_level).context("failed to set up logging")?;

    info!("usbip-vhci v{}", env!("CARGO_PKG_VERSION"));

    let Some(command) = args.command else {
        println!("No command given; run with --help to see the available subcommands.");
        return Ok(());
    };

    let controller = Controller::new(config, Arc::new(NullHostSurface)).context("failed to start controller")?;

    match command {
        Command::Plugin { node_name, service_name, busid } => {
            run_attached_session(controller, &node_name, &service_name, &busid, false).await
        }
        Command::PluginInternal { node_name, service_name, busid } => {
            run_attached_session(controller, &node_name, &service_name, &busid, true).await
        }
        Command::Plugout { port, reattach } => plugout(controller, port, reattach).await,
        Command::List => list(controller),
        Command::SetPersistent { node_name, service_name, busid } => {
            set_persistent(controller, node_name, service_name, busid)
        }
        Command::GetPersistent => get_persistent(controller),
        Command::Watch => watch(controller).await,
    }
}

/// Shared body for `plugin`/`plugin-internal`: attach, then hold the
/// session open (ticking the reattach supervisor) until `Ctrl+C`.
async fn run_attached_session(
    controller: Arc<Controller>,
    node_name: &str,
    service_name: &str,
    busid: &str,
    internal: bool,
) -> Result<()> {
    let port = if internal {
        let location = ImportedDeviceLocation {
            node_name: node_name.to_string(),
            service_name: service_name.to_string(),
            busid: busid.to_string(),
        };
        controller.plugin_internal(&location).await
    } else {
        controller.plugin(node_name, service_name, busid).await
    }
    .map_err(|kind| anyhow::anyhow!("attach failed: {kind}"))?;

    println!("Attached {node_name}:{service_name}/{busid} on port {port}");

    let reattach_handle = tokio::spawn(controller.clone().run_reattach_loop());

    info!(port, "attached; press Ctrl+C to detach and exit");
    wait_for_shutdown().await?;

    reattach_handle.abort();
    controller.shutdown().await;
    println!("Detached port {port}");
    Ok(())
}

async fn plugout(controller: Arc<Controller>, port: u16, reattach: bool) -> Result<()> {
    controller
        .plugout(port, reattach)
        .await
        .map_err(|kind| anyhow::anyhow!("detach failed: {kind}"))?;
    println!("Detached port {port}");
    Ok(())
}

fn list(controller: Arc<Controller>) -> Result<()> {
    let devices = controller.get_imported_devices();
    if devices.is_empty() {
        println!("No devices attached.");
    } else {
        for device in devices {
            println!(
                "port {:3}  devid {}  speed {}  {}:{}/{}",
                device.port,
                device.devid,
                device.speed,
                device.location.node_name,
                device.location.service_name,
                device.location.busid
            );
        }
    }
    Ok(())
}

fn set_persistent(controller: Arc<Controller>, node_name: String, service_name: String, busid: String) -> Result<()> {
    controller
        .set_persistent(ImportedDeviceLocation { node_name: node_name.clone(), service_name: service_name.clone(), busid: busid.clone() })
        .context("failed to persist device location")?;
    println!("Persisted {node_name}:{service_name}/{busid}");
    Ok(())
}

fn get_persistent(controller: Arc<Controller>) -> Result<()> {
    let locations = controller.get_persistent();
    if locations.is_empty() {
        println!("No persisted devices.");
    } else {
        for location in locations {
            println!("{}:{}/{}", location.node_name, location.service_name, location.busid);
        }
    }
    Ok(())
}

async fn watch(controller: Arc<Controller>) -> Result<()> {
    controller.load_persistent_devices();
    let mut events = controller.subscribe_events();
    let reattach_handle = tokio::spawn(controller.clone().run_reattach_loop());

    println!("Watching controller events; press Ctrl+C to stop.");
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => print_event(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "watch fell behind, some events were dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = signal::ctrl_c() => break,
        }
    }

    reattach_handle.abort();
    controller.shutdown().await;
    Ok(())
}

fn print_event(event: &vhci::DeviceStateEvent) {
    let state = match event.state {
        DeviceState::Connecting => "connecting",
        DeviceState::Connected => "connected",
        DeviceState::Plugged => "plugged",
        DeviceState::Unplugging => "unplugging",
        DeviceState::Unplugged => "unplugged",
        DeviceState::Disconnected => "disconnected",
    };
    println!(
        "[port {}] {} {}:{}/{}",
        event.port, state, event.location.node_name, event.location.service_name, event.location.busid
    );
}

async fn wait_for_shutdown() -> Result<()> {
    signal::ctrl_c().await.context("failed to wait for Ctrl+C")?;
    info!("received Ctrl+C, shutting down");
    Ok(())
}
