//! The locomotive roster: last-known state per address, refreshed
//! round-robin by the waveform pump when the command queue is empty.
//!
//! The round-robin cursor is a plain index into the sorted key list
//! recomputed on each call, not a live iterator pinned to the map --
//! that's what lets `forget`/`upsert` mutate the roster out from under
//! an in-progress refresh cycle without invalidating anything.

use std::{
    collections::BTreeMap,
    io,
    path::Path,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::packet::SpeedSteps;

/// Default function-group bytes: all function bits clear, instruction
/// prefix only.
const DEFAULT_FGROUP1: u8 = 0x80;
const DEFAULT_FGROUP2: u8 = 0xB0;
const DEFAULT_FGROUP3: u8 = 0xA0;

#[derive(Debug, Clone)]
pub struct RosterItem {
    pub address: u16,
    pub speed: u8,
    pub direction: bool,
    pub headlight: bool,
    pub fgroup1: u8,
    pub fgroup2: u8,
    pub fgroup3: u8,

    uptime_start: Option<u64>,
    uptime_accum_us: u64,
}

impl RosterItem {
    fn new(address: u16) -> Self {
        Self {
            address,
            speed: 0,
            direction: false,
            headlight: false,
            fgroup1: DEFAULT_FGROUP1,
            fgroup2: DEFAULT_FGROUP2,
            fgroup3: DEFAULT_FGROUP3,
            uptime_start: None,
            uptime_accum_us: 0,
        }
    }

    /// The sentinel returned by `next()` on an empty roster: address 0
    /// signals "nothing to refresh" to the waveform pump.
    fn sentinel() -> Self {
        Self::new(0)
    }
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

struct Inner {
    items: BTreeMap<u16, RosterItem>,
    cursor: usize,
}

pub struct Roster {
    inner: Mutex<Inner>,
}

impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}

impl Roster {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { items: BTreeMap::new(), cursor: 0 }) }
    }

    /// Returns the item for `address`, inserting a default one if it's
    /// new to the roster.
    pub fn get(&self, address: u16) -> RosterItem {
        let mut inner = self.inner.lock().unwrap();
        inner.items.entry(address).or_insert_with(|| RosterItem::new(address)).clone()
    }

    pub fn upsert(&self, item: RosterItem) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.insert(item.address, item);
    }

    /// Updates speed/direction and accounts uptime: starting a run
    /// (0 -> nonzero) stamps a start time; stopping (nonzero -> 0)
    /// accumulates elapsed time; a nonzero -> nonzero change re-stamps
    /// after accumulating the elapsed interval.
    pub fn update_speed(&self, address: u16, speed: u8, direction: bool) {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.items.entry(address).or_insert_with(|| RosterItem::new(address));
        let now = now_us();

        match (item.speed > 0, speed > 0) {
            (false, true) => item.uptime_start = Some(now),
            (true, true) => {
                if let Some(start) = item.uptime_start {
                    item.uptime_accum_us += now.saturating_sub(start);
                }
                item.uptime_start = Some(now);
            }
            (true, false) => {
                if let Some(start) = item.uptime_start.take() {
                    item.uptime_accum_us += now.saturating_sub(start);
                }
            }
            (false, false) => {}
        }

        item.speed = speed;
        item.direction = direction;
    }

    pub fn set_headlight(&self, address: u16, on: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.entry(address).or_insert_with(|| RosterItem::new(address)).headlight = on;
    }

    /// Twiddles one function bit within a group. `group` is 1, 2, or 3
    /// matching S-9.2.1's function groups.
    pub fn set_function_bit(&self, address: u16, group: u8, bit: u8, on: bool) {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.items.entry(address).or_insert_with(|| RosterItem::new(address));
        let field = match group {
            1 => &mut item.fgroup1,
            2 => &mut item.fgroup2,
            _ => &mut item.fgroup3,
        };
        if on {
            *field |= 1 << bit;
        } else {
            *field &= !(1 << bit);
        }
    }

    pub fn set_function_byte(&self, address: u16, group: u8, value: u8) {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.items.entry(address).or_insert_with(|| RosterItem::new(address));
        match group {
            1 => item.fgroup1 = value,
            2 => item.fgroup2 = value,
            _ => item.fgroup3 = value,
        }
    }

    /// Round-robin the next item to refresh. Advances the cursor by
    /// exactly one and wraps. Returns the zero-address sentinel if the
    /// roster is empty.
    pub fn next(&self) -> RosterItem {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.is_empty() {
            return RosterItem::sentinel();
        }
        let keys: Vec<u16> = inner.items.keys().copied().collect();
        inner.cursor %= keys.len();
        let addr = keys[inner.cursor];
        inner.cursor += 1;
        inner.items.get(&addr).unwrap().clone()
    }

    pub fn forget(&self, address: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.remove(&address);
        if !inner.items.is_empty() {
            inner.cursor %= inner.items.len();
        } else {
            inner.cursor = 0;
        }
    }

    pub fn forget_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.clear();
        inner.cursor = 0;
    }

    pub fn list(&self) -> Vec<RosterItem> {
        self.inner.lock().unwrap().items.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes `<uptimefilepath>/<timestamp>.txt` with one
    /// `address:seconds` line per roster entry, then zeroes every
    /// entry's accumulated uptime. Speed/direction/function state is
    /// left untouched -- the roster keeps running.
    pub fn write_and_reset_uptimes(&self, dir: &Path) -> io::Result<std::path::PathBuf> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_us();

        let mut lines = String::new();
        for item in inner.items.values_mut() {
            let mut accum = item.uptime_accum_us;
            if let Some(start) = item.uptime_start {
                accum += now.saturating_sub(start);
            }
            lines.push_str(&format!("{}:{}\n", item.address, accum / 1_000_000));
            item.uptime_accum_us = 0;
            if item.speed > 0 {
                item.uptime_start = Some(now);
            } else {
                item.uptime_start = None;
            }
        }

        let timestamp = chrono::Local::now().format("%Y-%m-%d_%H:%M:%S").to_string();
        let path = dir.join(format!("{timestamp}.txt"));
        std::fs::create_dir_all(dir)?;
        std::fs::write(&path, lines)?;
        Ok(path)
    }
}

/// Baseline vs. advanced encoding is a roster-wide setting, not
/// per-address; the dispatcher's `D SPEED28`/`D SPEED128` toggles it.
pub fn speed_steps_packet_kind(steps: SpeedSteps) -> &'static str {
    match steps {
        SpeedSteps::Step14 => "14",
        SpeedSteps::Step28 => "28",
        SpeedSteps::Step128 => "128",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forget_all_then_next_is_sentinel() {
        let r = Roster::new();
        r.get(3);
        r.forget_all();
        assert_eq!(r.next().address, 0);
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let r = Roster::new();
        let mut item = RosterItem::new(5);
        item.speed = 10;
        item.direction = true;
        r.upsert(item);
        let got = r.get(5);
        assert_eq!(got.speed, 10);
        assert!(got.direction);
    }

    #[test]
    fn update_speed_accumulates_uptime_on_stop() {
        let r = Roster::new();
        r.update_speed(7, 10, true);
        std::thread::sleep(std::time::Duration::from_millis(5));
        r.update_speed(7, 0, true);
        let item = r.get(7);
        assert!(item.uptime_accum_us > 0);
    }

    #[test]
    fn round_robin_visits_all_addresses_over_two_cycles() {
        let r = Roster::new();
        for addr in [1u16, 2, 3] {
            r.get(addr);
        }
        let mut seen = std::collections::HashSet::new();
        for _ in 0..6 {
            seen.insert(r.next().address);
        }
        assert_eq!(seen, [1, 2, 3].into_iter().collect());
    }

    #[test]
    fn forget_during_cycle_keeps_cursor_valid() {
        let r = Roster::new();
        for addr in [1u16, 2, 3] {
            r.get(addr);
        }
        r.next();
        r.forget(2);
        // Must not panic regardless of the removed key's position.
        for _ in 0..5 {
            r.next();
        }
    }
}
