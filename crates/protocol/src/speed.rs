//! USB signaling speed and the full→high bInterval remap table.

use std::fmt;

/// Device signaling speed, as negotiated with the host emulation surface.
///
/// Ordered low to high; `Speed::Full` is the only value that triggers the
/// `bInterval` rewrite in [`remap_full_speed_binterval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Speed {
    Low = 1,
    Full = 2,
    High = 3,
    Super = 5,
    SuperPlus = 6,
}

impl Speed {
    pub fn from_wire(value: u8) -> Option<Speed> {
        match value {
            1 => Some(Speed::Low),
            2 => Some(Speed::Full),
            3 => Some(Speed::High),
            5 => Some(Speed::Super),
            6 => Some(Speed::SuperPlus),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Ports 1..usb2_ports accept speeds below this threshold.
    pub fn is_super_or_above(self) -> bool {
        self >= Speed::Super
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Speed::Low => "low",
            Speed::Full => "full",
            Speed::High => "high",
            Speed::Super => "super",
            Speed::SuperPlus => "super-plus",
        };
        f.write_str(s)
    }
}

/// Remaps a full-speed endpoint's `bInterval` (1ms frame units) into the
/// high-speed microframe-exponent encoding the host emulation surface
/// expects, per the monotone table in §4.5:
///
/// | original | emitted |
/// |---|---|
/// | 1 | 4 |
/// | 2-3 | 5 |
/// | 4-7 | 6 |
/// | 8-15 | 7 |
/// | 16-31 | 8 |
/// | 32-255 | 9 |
///
/// Only called for FULL-speed devices; HIGH/SUPER descriptors already carry
/// the microframe encoding and must not pass through this function.
pub fn remap_full_speed_binterval(binterval: u8) -> u8 {
    match binterval {
        0 => 0,
        1 => 4,
        2..=3 => 5,
        4..=7 => 6,
        8..=15 => 7,
        16..=31 => 8,
        _ => 9,
    }
}

const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
const ENDPOINT_DESCRIPTOR_MIN_LEN: u8 = 7;
const TRANSFER_TYPE_ISOCHRONOUS: u8 = 1;
const TRANSFER_TYPE_INTERRUPT: u8 = 3;

/// Walks a raw USB CONFIGURATION descriptor byte buffer (as returned by a
/// GET_DESCRIPTOR request) and rewrites the `bInterval` byte of every
/// isochronous or interrupt ENDPOINT sub-descriptor through
/// [`remap_full_speed_binterval`], in place.
///
/// Sub-descriptors are walked by their own `bLength`; a sub-descriptor with
/// `bLength == 0` or one that would run past the end of `data` stops the
/// walk early rather than looping or panicking — a malformed descriptor is
/// passed through as far as it can be parsed.
pub fn rewrite_full_speed_config_descriptor(data: &mut [u8]) {
    let mut offset = 0usize;
    while offset + 2 <= data.len() {
        let length = data[offset] as usize;
        if length == 0 || offset + length > data.len() {
            break;
        }
        let descriptor_type = data[offset + 1];
        if descriptor_type == DESCRIPTOR_TYPE_ENDPOINT && length >= ENDPOINT_DESCRIPTOR_MIN_LEN as usize {
            let transfer_type = data[offset + 3] & 0x03;
            if transfer_type == TRANSFER_TYPE_ISOCHRONOUS || transfer_type == TRANSFER_TYPE_INTERRUPT {
                let binterval = &mut data[offset + 6];
                *binterval = remap_full_speed_binterval(*binterval);
            }
        }
        offset += length;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binterval_table_is_exact() {
        let cases: &[(u8, u8)] = &[
            (1, 4),
            (2, 5),
            (3, 5),
            (4, 6),
            (7, 6),
            (8, 7),
            (15, 7),
            (16, 8),
            (31, 8),
            (32, 9),
            (255, 9),
        ];
        for &(input, expected) in cases {
            assert_eq!(remap_full_speed_binterval(input), expected, "input={input}");
        }
    }

    #[test]
    fn binterval_table_is_monotone() {
        let mut prev = 0u8;
        for b in 1..=255u8 {
            let mapped = remap_full_speed_binterval(b);
            assert!(mapped >= prev);
            prev = mapped;
        }
    }

    #[test]
    fn speed_ordering_matches_super_threshold() {
        assert!(!Speed::High.is_super_or_above());
        assert!(Speed::Super.is_super_or_above());
        assert!(Speed::SuperPlus.is_super_or_above());
    }

    #[test]
    fn config_descriptor_rewrite_remaps_iso_and_interrupt_bintervals() {
        // config(9) + interface(9) + iso endpoint(7, bInterval=1) + interrupt endpoint(7, bInterval=2)
        #[rustfmt::skip]
        let mut data = vec![
            9, 0x02, 0, 0, 1, 0, 0, 0, 0,
            9, 0x04, 0, 0, 2, 0, 0, 0, 0,
            7, 0x05, 0x81, 0x01, 0, 2, 1,
            7, 0x05, 0x82, 0x03, 0, 2, 2,
        ];
        rewrite_full_speed_config_descriptor(&mut data);
        assert_eq!(data[9 + 9 + 6], 4); // iso bInterval 1 -> 4
        assert_eq!(data[9 + 9 + 7 + 6], 5); // interrupt bInterval 2 -> 5
    }

    #[test]
    fn config_descriptor_rewrite_ignores_bulk_and_control_endpoints() {
        #[rustfmt::skip]
        let mut data = vec![
            7, 0x05, 0x81, 0x02, 0, 2, 1, // bulk, bInterval left untouched
        ];
        rewrite_full_speed_config_descriptor(&mut data);
        assert_eq!(data[6], 1);
    }

    #[test]
    fn config_descriptor_rewrite_stops_on_truncated_descriptor() {
        let mut data = vec![9, 0x02, 0, 0, 1, 0, 0, 0]; // bLength(9) exceeds remaining bytes
        rewrite_full_speed_config_descriptor(&mut data); // must not panic
        assert_eq!(data.len(), 8);
    }

    #[test]
    fn speed_wire_roundtrip() {
        for s in [Speed::Low, Speed::Full, Speed::High, Speed::Super, Speed::SuperPlus] {
            assert_eq!(Speed::from_wire(s.to_wire()), Some(s));
        }
        assert_eq!(Speed::from_wire(4), None);
    }
}
