//! Stable error taxonomy shared by every layer of the core.
//!
//! `Kind` is deliberately small and `Copy`: it crosses the TX/RX/registry/
//! controller boundary on the hot path (one tag per failed transfer) and is
//! mapped to a native status by whichever surface is reporting it (URB
//! status, IOCTL return, reattach retry classification).

use std::fmt;

/// A stable, implementation-independent error classification.
///
/// Values are grouped by the layer that typically originates them, but the
/// taxonomy itself is shared: a `Kind` produced by the wire codec and one
/// produced by the port table compare equal and are handled identically by
/// callers that only care about the class of failure (e.g. the reattach
/// supervisor's retryable/non-retryable split).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Input struct size field did not match the expected size. Never retryable.
    Abi,
    /// Malformed PDU, unexpected command, busid mismatch, bad packet count, non-monotone iso offsets.
    Protocol,
    /// OP_REP_IMPORT version differs from ours.
    Version,
    /// Socket-level error other than cancellation or forced close.
    Network,
    /// Peer or local shutdown occurred while a send was in flight.
    ForcedClose,
    /// Cancelled by the OS, or by us during shutdown.
    Canceled,
    /// A described buffer was smaller than the data it needed to hold.
    BufferTooSmall,
    /// A transfer length violated a USB buffer/length invariant.
    InvalidBufferSize,
    /// Semantic validation failure (direction, iso layout, request shape).
    InvalidParameter,
    /// Submission was attempted after the device's `unplugged` flag was set.
    DeviceRemoved,
    /// No free port was available at claim time.
    PortFull,
    /// Attach rejected because the same location is already attached.
    Busy,
    /// An operation exceeded its deadline.
    Timeout,
    /// A lookup (registry, port, persisted record) found nothing.
    NotFound,
}

impl Kind {
    /// Wire-facing failures are final for the current connection: the
    /// reattach supervisor must not retry them. See §7 propagation rules.
    pub fn is_wire_fatal(self) -> bool {
        matches!(self, Kind::Protocol | Kind::Version | Kind::Abi)
    }

    /// Whether the reattach supervisor should schedule another attempt for
    /// a failure of this kind, independent of the remaining retry budget.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Kind::Network | Kind::ForcedClose | Kind::DeviceRemoved | Kind::Timeout
        )
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Abi => "ABI",
            Kind::Protocol => "PROTOCOL",
            Kind::Version => "VERSION",
            Kind::Network => "NETWORK",
            Kind::ForcedClose => "FORCED_CLOSE",
            Kind::Canceled => "CANCELED",
            Kind::BufferTooSmall => "BUFFER_TOO_SMALL",
            Kind::InvalidBufferSize => "INVALID_BUFFER_SIZE",
            Kind::InvalidParameter => "INVALID_PARAMETER",
            Kind::DeviceRemoved => "DEVICE_REMOVED",
            Kind::PortFull => "PORTFULL",
            Kind::Busy => "BUSY",
            Kind::Timeout => "TIMEOUT",
            Kind::NotFound => "NOT_FOUND",
        };
        f.write_str(s)
    }
}

/// Maps a Linux errno (as carried, negated, in a RET_SUBMIT/RET_UNLINK
/// `status` field) to a [`Kind`]. Deterministic and table-driven per the
/// wire codec's failure-mode contract.
///
/// `0` is not an error and is not represented here; callers check for it
/// before calling this function.
pub fn kind_from_errno(errno: i32) -> Kind {
    match errno.unsigned_abs() as i32 {
        libc::ENOENT => Kind::NotFound,
        libc::EPIPE => Kind::InvalidParameter,
        libc::EOVERFLOW => Kind::InvalidBufferSize,
        libc::ETIMEDOUT => Kind::Timeout,
        libc::ECONNRESET => Kind::Canceled,
        libc::ENODEV => Kind::DeviceRemoved,
        libc::EPROTO => Kind::Protocol,
        libc::EILSEQ => Kind::Protocol,
        libc::ENOSPC => Kind::BufferTooSmall,
        libc::ESHUTDOWN => Kind::ForcedClose,
        _ => Kind::Network,
    }
}

/// Linux errno constants used by [`kind_from_errno`] and by tests that
/// build synthetic RET_SUBMIT headers.
///
/// The core never links against libc for anything but these symbolic
/// values, so a tiny local module stands in for a dependency on the `libc`
/// crate: the numeric values are part of the USB/IP wire contract, not of
/// the host OS, and must not vary by target.
pub mod libc {
    pub const ENOENT: i32 = 2;
    pub const EPIPE: i32 = 32;
    pub const ENODEV: i32 = 19;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECONNRESET: i32 = 104;
    pub const EPROTO: i32 = 71;
    pub const EILSEQ: i32 = 84;
    pub const ENOSPC: i32 = 28;
    pub const EOVERFLOW: i32 = 75;
    pub const ESHUTDOWN: i32 = 108;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_fatal_kinds_are_not_retryable() {
        for k in [Kind::Protocol, Kind::Version, Kind::Abi] {
            assert!(k.is_wire_fatal());
            assert!(!k.is_retryable());
        }
    }

    #[test]
    fn errno_mapping_is_deterministic() {
        assert_eq!(kind_from_errno(-libc::ENOENT), Kind::NotFound);
        assert_eq!(kind_from_errno(-libc::ECONNRESET), Kind::Canceled);
        assert_eq!(kind_from_errno(-libc::ETIMEDOUT), Kind::Timeout);
        assert_eq!(kind_from_errno(-9999), Kind::Network);
    }

    #[test]
    fn display_matches_wire_taxonomy_names() {
        assert_eq!(Kind::BufferTooSmall.to_string(), "BUFFER_TOO_SMALL");
        assert_eq!(Kind::PortFull.to_string(), "PORTFULL");
    }
}
