use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

use anyhow::{bail, Result};

enum Backing {
    /// Memory owned by the fuzzing harness.
    Shared { ptr: NonNull<AtomicU8>, len: usize },
    Owned(Box<[AtomicU8]>),
}

/// The access bitmap shared with the fuzzing harness. The lower half records reads, the upper
/// half records writes.
///
/// Slots are updated with relaxed loads and stores. Concurrent updates of the same slot may get
/// lost, which is acceptable for fuzzing feedback.
pub struct AccessMap {
    backing: Backing,
}

// safety: all accesses go through atomics, the pointer is never reallocated.
unsafe impl Send for AccessMap {}
unsafe impl Sync for AccessMap {}

impl AccessMap {
    /// Create a zeroed map owned by us, mostly useful for testing.
    pub fn new(len: usize) -> Self {
        AccessMap {
            backing: Backing::Owned((0..len).map(|_| AtomicU8::new(0)).collect()),
        }
    }

    /// Create a map from a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        AccessMap {
            backing: Backing::Owned(bytes.iter().map(|&b| AtomicU8::new(b)).collect()),
        }
    }

    /// Reference a map owned by someone else.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for the whole lifetime of the
    /// returned map. Other writers must not hold Rust references to that memory.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Result<Self> {
        let ptr = match NonNull::new(ptr as *mut AtomicU8) {
            Some(ptr) => ptr,
            None => bail!("access map pointer is null"),
        };
        Ok(AccessMap {
            backing: Backing::Shared { ptr, len },
        })
    }

    /// Copy the current content of the map.
    pub fn snapshot(&self) -> Vec<u8> {
        self.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }

    /// Does the map content differ from `other`?
    pub fn differs_from(&self, other: &[u8]) -> bool {
        self.len() != other.len()
            || self
                .iter()
                .zip(other)
                .any(|(a, b)| a.load(Ordering::Relaxed) != *b)
    }

    /// Copy the current content of the map into `dst`.
    pub fn copy_into(&self, dst: &mut [u8]) {
        for (d, s) in dst.iter_mut().zip(self.iter()) {
            *d = s.load(Ordering::Relaxed);
        }
    }
}

impl Deref for AccessMap {
    type Target = [AtomicU8];
    fn deref(&self) -> &[AtomicU8] {
        match &self.backing {
            // safety: see from_raw_parts(); AtomicU8 has the same layout as u8
            Backing::Shared { ptr, len } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), *len)
            },
            Backing::Owned(slots) => &slots[..],
        }
    }
}
