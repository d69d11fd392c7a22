use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{bail, Result};

use crate::bitfield::{BitFieldArena, COUNTER_CAP, ELEMENT_WIDTH};
use crate::map::AccessMap;

/// How access counts are stored in the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// One saturating byte counter per slot.
    Path,
    /// One bit-field counter of `ELEMENT_WIDTH` bytes per slot.
    Baseline,
}

/// AFL-style path hashing: the slot of an access depends on the previous access.
#[derive(Debug, Default)]
pub struct LocationHasher {
    prev_loc: AtomicU32,
}

impl LocationHasher {
    pub fn hash(&self, loc: u32) -> u32 {
        let cur = loc ^ self.prev_loc.load(Ordering::Relaxed);
        self.prev_loc.store(loc >> 1, Ordering::Relaxed);
        cur
    }

    pub fn previous(&self) -> u32 {
        self.prev_loc.load(Ordering::Relaxed)
    }
}

/// Records PM accesses of instrumented call sites in the access map.
///
/// `id` is a compile-time random number per call site; it is reduced into the map, so any value
/// is valid.
pub struct AccessRecorder {
    map: AccessMap,
    encoding: Encoding,
    hasher: LocationHasher,
    /// Size of one half of the map, in bytes.
    half: u32,
    /// Index space for write locations.
    write_slots: u32,
    /// Index space for bit-field counters.
    element_slots: u32,
}

impl AccessRecorder {
    pub fn new(map: AccessMap, encoding: Encoding, reserved_slots: u32) -> Result<Self> {
        let len: u32 = match map.len().try_into() {
            Ok(len) => len,
            Err(_) => bail!("access map of {} bytes is too large", map.len()),
        };
        let half = len / 2;
        if half <= reserved_slots {
            bail!(
                "access map of {} bytes is too small for {} reserved slots",
                len,
                reserved_slots
            );
        }
        let elements = len / ELEMENT_WIDTH as u32;
        if encoding == Encoding::Baseline && elements <= reserved_slots {
            bail!(
                "access map of {} bytes holds only {} bit fields, {} are reserved",
                len,
                elements,
                reserved_slots
            );
        }
        Ok(AccessRecorder {
            map,
            encoding,
            hasher: LocationHasher::default(),
            half,
            write_slots: half - reserved_slots,
            element_slots: elements.saturating_sub(reserved_slots),
        })
    }

    pub fn map(&self) -> &AccessMap {
        &self.map
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn hasher(&self) -> &LocationHasher {
        &self.hasher
    }

    /// Record a read-only access.
    pub fn record_read(&self, id: u32) {
        self.update(id % self.half);
    }

    /// Record a write-only access.
    pub fn record_write(&self, id: u32) {
        self.update(id % self.write_slots + self.half);
    }

    /// Record an access that both reads and writes.
    pub fn record_read_write(&self, id: u32) {
        let loc = id % self.write_slots;
        self.update(loc);
        self.update(loc + self.half);
    }

    fn update(&self, loc: u32) {
        match self.encoding {
            Encoding::Path => {
                let slot = wrap(self.hasher.hash(loc), self.map.len());
                let counter = &self.map[slot];
                let value = counter.load(Ordering::Relaxed);
                if (value as usize) < COUNTER_CAP {
                    counter.store(value + 1, Ordering::Relaxed);
                }
            }
            Encoding::Baseline => {
                let elem = loc % self.element_slots;
                let arena = BitFieldArena::new(&self.map, ELEMENT_WIDTH);
                let slot = wrap(self.hasher.hash(elem), arena.len());
                if let Some(field) = arena.field(slot, false) {
                    field.advance();
                }
            }
        }
    }
}

/// Hashed slots stay below the next power of two of the index space; fold the rare overshoot of
/// non power of two maps back into range.
fn wrap(slot: u32, len: usize) -> usize {
    let slot = slot as usize;
    if slot < len {
        slot
    } else {
        slot % len
    }
}
