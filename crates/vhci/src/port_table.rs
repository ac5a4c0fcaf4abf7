//! The controller's port table (C8): a fixed-size array of slots, split
//! into a USB2 sub-range (speeds below SUPER) and a USB3 sub-range (SUPER
//! and above), claimed and released under a single lock.
//!
//! Grounded in the original driver's port bitmap (`claim_rom_port`/
//! `release_rom_port`) — a linear scan for the first free slot in the
//! sub-range matching the device's speed, ports numbered from 1.

use std::sync::{Arc, Mutex};

use protocol::Speed;

/// One port slot: empty, or occupied by a device.
enum Slot<D> {
    Empty,
    Occupied(Arc<D>),
}

/// Fixed-size port array. `usb2_count` slots (indices `0..usb2_count`,
/// ports `1..=usb2_count`) accept speeds below SUPER; the remaining slots
/// accept SUPER and above.
pub struct PortTable<D> {
    slots: Mutex<Vec<Slot<D>>>,
    usb2_count: u16,
}

impl<D> PortTable<D> {
    pub fn new(usb2_count: u16, usb3_count: u16) -> Self {
        let total = usb2_count as usize + usb3_count as usize;
        let mut slots = Vec::with_capacity(total);
        slots.resize_with(total, || Slot::Empty);
        PortTable {
            slots: Mutex::new(slots),
            usb2_count,
        }
    }

    pub fn total_ports(&self) -> u16 {
        self.slots.lock().unwrap().len() as u16
    }

    /// Claims the first free port accepting `speed`. Returns the 1-based
    /// port number, or `None` if the matching sub-range is full
    /// ([`protocol::Kind::PortFull`] at the caller).
    pub fn claim(&self, speed: Speed, device: Arc<D>) -> Option<u16> {
        let (lo, hi) = self.range_for(speed);
        let mut slots = self.slots.lock().unwrap();
        for i in lo..hi {
            if matches!(slots[i], Slot::Empty) {
                slots[i] = Slot::Occupied(device);
                return Some(i as u16 + 1);
            }
        }
        None
    }

    /// Frees `port`, returning the device that occupied it, if any.
    pub fn reclaim(&self, port: u16) -> Option<Arc<D>> {
        let mut slots = self.slots.lock().unwrap();
        let i = (port as usize).checked_sub(1)?;
        let slot = slots.get_mut(i)?;
        match std::mem::replace(slot, Slot::Empty) {
            Slot::Occupied(d) => Some(d),
            Slot::Empty => None,
        }
    }

    pub fn get(&self, port: u16) -> Option<Arc<D>> {
        let slots = self.slots.lock().unwrap();
        let i = (port as usize).checked_sub(1)?;
        match slots.get(i)? {
            Slot::Occupied(d) => Some(d.clone()),
            Slot::Empty => None,
        }
    }

    /// Snapshots every occupied port, for `GET_IMPORTED_DEVICES` and for
    /// the controller's shutdown-time `detach_all`.
    pub fn occupied(&self) -> Vec<(u16, Arc<D>)> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Slot::Occupied(d) => Some((i as u16 + 1, d.clone())),
                Slot::Empty => None,
            })
            .collect()
    }

    fn range_for(&self, speed: Speed) -> (usize, usize) {
        let total = self.slots.lock().unwrap().len();
        if speed.is_super_or_above() {
            (self.usb2_count as usize, total)
        } else {
            (0, self.usb2_count as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_distinct_ports_within_range() {
        let table: PortTable<u32> = PortTable::new(2, 2);
        let p1 = table.claim(Speed::High, Arc::new(1)).unwrap();
        let p2 = table.claim(Speed::High, Arc::new(2)).unwrap();
        assert_ne!(p1, p2);
        assert!(p1 <= 2 && p2 <= 2);
    }

    #[test]
    fn usb2_and_usb3_ranges_are_disjoint() {
        let table: PortTable<u32> = PortTable::new(1, 1);
        let usb2_port = table.claim(Speed::Full, Arc::new(1)).unwrap();
        let usb3_port = table.claim(Speed::Super, Arc::new(2)).unwrap();
        assert_eq!(usb2_port, 1);
        assert_eq!(usb3_port, 2);
    }

    #[test]
    fn claim_fails_when_sub_range_full() {
        let table: PortTable<u32> = PortTable::new(1, 1);
        table.claim(Speed::Full, Arc::new(1)).unwrap();
        assert!(table.claim(Speed::Full, Arc::new(2)).is_none());
    }

    #[test]
    fn reclaim_frees_the_port_for_reuse() {
        let table: PortTable<u32> = PortTable::new(1, 0);
        let port = table.claim(Speed::Low, Arc::new(1)).unwrap();
        assert!(table.reclaim(port).is_some());
        assert!(table.claim(Speed::Low, Arc::new(2)).is_some());
    }

    #[test]
    fn occupied_lists_every_claimed_port() {
        let table: PortTable<u32> = PortTable::new(2, 0);
        table.claim(Speed::Low, Arc::new(10)).unwrap();
        table.claim(Speed::Low, Arc::new(20)).unwrap();
        assert_eq!(table.occupied().len(), 2);
    }
}
