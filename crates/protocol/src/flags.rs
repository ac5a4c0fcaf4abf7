//! OS transfer-flag ↔ Linux-style transfer-flag translation.
//!
//! The sender translates the local, OS-specific transfer-flag bitset to the
//! Linux-style bitset the USB/IP wire protocol expects (short-transfer-ok,
//! iso-ASAP, and so on). The mapping is a fixed bijection: deterministic and
//! reversible, so round-trip tests can assert it without depending on the
//! surrounding URB machinery. The concrete bit positions are private to
//! this module; callers only see [`to_linux_flags`] / [`from_linux_flags`].

/// Local (OS-side) transfer flag: short transfers complete without error.
pub const USBD_SHORT_TRANSFER_OK: u32 = 1 << 0;
/// Local (OS-side) transfer flag: this transfer is IN (device-to-host).
pub const USBD_TRANSFER_DIRECTION_IN: u32 = 1 << 1;
/// Local (OS-side) transfer flag: the default control pipe was used.
pub const USBD_DEFAULT_PIPE_TRANSFER: u32 = 1 << 2;
/// Local (OS-side) transfer flag: start an isochronous transfer as soon as
/// possible rather than at a caller-specified frame number. The wire
/// protocol has no frame-number field to carry the alternative, so every
/// isoch submission sets this.
pub const USBD_START_ISO_TRANSFER_ASAP: u32 = 1 << 3;

/// Linux-style (wire) transfer flag bit positions, per the USB/IP protocol.
const LINUX_URB_SHORT_NOT_OK: u32 = 1 << 0;
const LINUX_URB_ISO_ASAP: u32 = 1 << 1;
const LINUX_URB_NO_TRANSFER_DMA_MAP: u32 = 1 << 2;

/// Translates local transfer flags to the wire (Linux-style) bitset.
///
/// `dir_in` mirrors the caller's already-resolved transfer direction; the
/// `SHORT_NOT_OK` bit is the logical inverse of `USBD_SHORT_TRANSFER_OK`
/// (Linux flags absence of tolerance, not presence), matching upstream
/// USB/IP semantics.
pub fn to_linux_flags(flags: u32, dir_in: bool) -> u32 {
    let mut out = 0u32;
    if flags & USBD_SHORT_TRANSFER_OK == 0 {
        out |= LINUX_URB_SHORT_NOT_OK;
    }
    if dir_in {
        out |= LINUX_URB_ISO_ASAP;
    }
    if flags & USBD_DEFAULT_PIPE_TRANSFER != 0 {
        out |= LINUX_URB_NO_TRANSFER_DMA_MAP;
    }
    out
}

/// The inverse of [`to_linux_flags`], used by tests to assert the mapping
/// is a genuine bijection over the bits it touches.
pub fn from_linux_flags(linux_flags: u32) -> (u32, bool) {
    let mut out = 0u32;
    if linux_flags & LINUX_URB_SHORT_NOT_OK == 0 {
        out |= USBD_SHORT_TRANSFER_OK;
    }
    if linux_flags & LINUX_URB_NO_TRANSFER_DMA_MAP != 0 {
        out |= USBD_DEFAULT_PIPE_TRANSFER;
    }
    let dir_in = linux_flags & LINUX_URB_ISO_ASAP != 0;
    (out, dir_in)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_short_ok_and_default_pipe() {
        let local = USBD_SHORT_TRANSFER_OK | USBD_DEFAULT_PIPE_TRANSFER;
        let wire = to_linux_flags(local, true);
        let (back, dir_in) = from_linux_flags(wire);
        assert_eq!(back, local);
        assert!(dir_in);
    }

    #[test]
    fn short_not_ok_is_set_when_flag_absent() {
        let wire = to_linux_flags(0, false);
        assert_eq!(wire & LINUX_URB_SHORT_NOT_OK, LINUX_URB_SHORT_NOT_OK);
        assert_eq!(wire & LINUX_URB_ISO_ASAP, 0);
    }
}
