//! Stream-socket abstraction (§5's "external collaborator" network layer):
//! connect, keepalive tuning, split read/write halves, and a clean half-close
//! on detach.
//!
//! The core treats the transport only as a reliable byte stream, so this is
//! a thin wrapper over [`tokio::net::TcpStream`] rather than the teacher's
//! iroh/QUIC endpoint — the spec's explicit non-goal excludes any particular
//! transport, and a plain TCP stream is the most direct implementation of
//! "assume connect/send/recv/shutdown/keepalive".

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::config::KeepaliveSettings;

/// Connects to the first address in `addrs` that accepts, mirroring the
/// original attach path's "iterate DNS results, try each in turn" behavior.
pub async fn connect_first_reachable(addrs: &[SocketAddr], keepalive: &KeepaliveSettings) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                apply_keepalive(&stream, keepalive)?;
                // §6: "WSK_FLAG_NODELAY equivalent used per send" — every
                // PDU write should hit the wire immediately rather than wait
                // for Nagle coalescing, since CMD_SUBMIT/CMD_UNLINK frames
                // are latency-sensitive request/response traffic.
                stream.set_nodelay(true).context("failed to set TCP_NODELAY")?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect attempt failed, trying next address");
                last_err = Some(e);
            }
        }
    }
    Err(last_err
        .map(|e| anyhow::Error::new(e).context("all candidate addresses refused connection"))
        .unwrap_or_else(|| anyhow::anyhow!("no candidate addresses to connect to")))
}

/// Applies the configured `SO_KEEPALIVE`/`TCP_KEEPIDLE`/`TCP_KEEPINTVL`/
/// `TCP_KEEPCNT` socket options. `nix`'s per-field knobs are Linux-only;
/// elsewhere we fall back to the portable boolean `SO_KEEPALIVE` and accept
/// the OS default timers.
#[cfg(unix)]
fn apply_keepalive(stream: &TcpStream, settings: &KeepaliveSettings) -> Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};

    setsockopt(stream, sockopt::KeepAlive, &true).context("failed to enable SO_KEEPALIVE")?;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        setsockopt(stream, sockopt::TcpKeepIdle, &settings.tcp_keepidle_secs)
            .context("failed to set TCP_KEEPIDLE")?;
        setsockopt(stream, sockopt::TcpKeepInterval, &settings.tcp_keepintvl_secs)
            .context("failed to set TCP_KEEPINTVL")?;
        setsockopt(stream, sockopt::TcpKeepCount, &settings.tcp_keepcnt)
            .context("failed to set TCP_KEEPCNT")?;
    }

    Ok(())
}

#[cfg(not(unix))]
fn apply_keepalive(_stream: &TcpStream, _settings: &KeepaliveSettings) -> Result<()> {
    Ok(())
}

/// Splits a connected stream into independently-owned halves: the RX task
/// reads exclusively from `OwnedReadHalf`, while `OwnedWriteHalf` is shared
/// behind the device's send mutex for TX/unlink writers.
pub fn split(stream: TcpStream) -> (OwnedReadHalf, OwnedWriteHalf) {
    stream.into_split()
}
