//! Reattach supervisor (C9): schedules automatic reconnection attempts for
//! devices whose connection dropped, deduplicated by location and bounded
//! by a capacity cap, with exponential backoff between attempts.
//!
//! Grounded in the original driver's reattach state machine
//! (IDLE → SCHEDULED → ATTEMPT → DONE/SCHEDULED) and its
//! `next_delay(d, max) = min(max, floor(3d/2))` backoff formula (§4.9).
//! Boot-time loading of persisted devices goes through the same
//! SCHEDULED → ATTEMPT timer path as a post-failure reschedule (a "delayed"
//! first attempt, not an immediate one), so there is no separate code path
//! for it here.

use std::collections::HashMap;
use std::time::Duration;

use std::sync::Mutex;
use tokio::time::Instant;

use crate::config::ReattachSettings;
use crate::device::ImportedDeviceLocation;

enum State {
    Scheduled { due: Instant },
    Attempting,
}

struct Entry {
    location: ImportedDeviceLocation,
    state: State,
    delay: Duration,
    tries: u32,
}

/// Computes the next backoff delay: `min(max, floor(3*d/2))`.
pub fn next_delay(d: Duration, max: Duration) -> Duration {
    let grown = d + d / 2;
    grown.min(max)
}

/// Tracks every device awaiting a reattach attempt. One instance per
/// controller; capacity is fixed at `4 x port_count` per §4.9.
pub struct ReattachSupervisor {
    entries: Mutex<HashMap<u64, Entry>>,
    capacity: usize,
    max_tries: u32,
    init_delay: Duration,
    max_delay: Duration,
}

impl ReattachSupervisor {
    pub fn new(settings: &ReattachSettings, port_count: u16) -> Self {
        ReattachSupervisor {
            entries: Mutex::new(HashMap::new()),
            capacity: port_count as usize * 4,
            max_tries: settings.max_tries,
            init_delay: Duration::from_secs(settings.init_delay_secs as u64),
            max_delay: Duration::from_secs(settings.max_delay_secs as u64),
        }
    }

    /// Schedules a first reattach attempt for `location`, deduplicated by
    /// its location hash. Returns `false` if already scheduled/attempting
    /// or the capacity cap would be exceeded.
    pub fn schedule(&self, location: ImportedDeviceLocation) -> bool {
        let hash = location.location_hash();
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&hash) {
            return false;
        }
        if entries.len() >= self.capacity {
            return false;
        }
        entries.insert(
            hash,
            Entry {
                location,
                state: State::Scheduled { due: Instant::now() + self.init_delay },
                delay: self.init_delay,
                tries: 0,
            },
        );
        true
    }

    /// Transitions every entry whose delay has elapsed from SCHEDULED to
    /// ATTEMPT, returning their location hash and location for the caller
    /// to actually dial.
    pub fn due_for_attempt(&self) -> Vec<(u64, ImportedDeviceLocation)> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let mut ready = Vec::new();
        for (hash, entry) in entries.iter_mut() {
            if let State::Scheduled { due } = entry.state {
                if due <= now {
                    entry.state = State::Attempting;
                    ready.push((*hash, entry.location.clone()));
                }
            }
        }
        ready
    }

    /// The attempt for `hash` succeeded; the device is live again and no
    /// longer needs supervision (DONE).
    pub fn on_success(&self, hash: u64) {
        self.entries.lock().unwrap().remove(&hash);
    }

    /// The attempt for `hash` failed. Reschedules with a grown backoff
    /// unless the retry budget (`max_tries`, `0` = unlimited) is
    /// exhausted, in which case the entry is dropped (DONE). Returns
    /// whether another attempt was scheduled.
    pub fn on_failure(&self, hash: u64) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(&hash) else {
            return false;
        };
        entry.tries += 1;
        if self.max_tries != 0 && entry.tries >= self.max_tries {
            entries.remove(&hash);
            return false;
        }
        entry.delay = next_delay(entry.delay, self.max_delay);
        entry.state = State::Scheduled { due: Instant::now() + entry.delay };
        true
    }

    /// Cancels supervision for `hash` (e.g. the user explicitly plugged
    /// out the device while a reattach was pending).
    pub fn cancel(&self, hash: u64) {
        self.entries.lock().unwrap().remove(&hash);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ReattachSettings {
        ReattachSettings { max_tries: 3, init_delay_secs: 1, max_delay_secs: 10 }
    }

    fn loc(busid: &str) -> ImportedDeviceLocation {
        ImportedDeviceLocation { node_name: "host".into(), service_name: "3240".into(), busid: busid.into() }
    }

    #[test]
    fn backoff_grows_by_three_halves_and_clamps() {
        let d = Duration::from_secs(10);
        let max = Duration::from_secs(100);
        assert_eq!(next_delay(d, max), Duration::from_secs(15));
        assert_eq!(next_delay(Duration::from_secs(80), max), max);
    }

    #[test]
    fn schedule_dedups_by_location() {
        let sup = ReattachSupervisor::new(&settings(), 10);
        assert!(sup.schedule(loc("1-1")));
        assert!(!sup.schedule(loc("1-1")));
        assert_eq!(sup.len(), 1);
    }

    #[test]
    fn capacity_cap_is_four_times_port_count() {
        let sup = ReattachSupervisor::new(&settings(), 1);
        for i in 0..4 {
            assert!(sup.schedule(loc(&format!("1-{i}"))));
        }
        assert!(!sup.schedule(loc("1-99")));
    }

    #[test]
    fn failure_exhausts_retry_budget() {
        let sup = ReattachSupervisor::new(&settings(), 10);
        sup.schedule(loc("1-1"));
        let hash = loc("1-1").location_hash();
        assert!(sup.on_failure(hash));
        assert!(sup.on_failure(hash));
        assert!(!sup.on_failure(hash)); // third failure == max_tries, exhausted
        assert!(sup.is_empty());
    }

    #[test]
    fn success_removes_entry() {
        let sup = ReattachSupervisor::new(&settings(), 10);
        sup.schedule(loc("1-1"));
        let hash = loc("1-1").location_hash();
        sup.on_success(hash);
        assert!(sup.is_empty());
    }
}
