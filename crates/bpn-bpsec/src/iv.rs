//! Per-thread initialization-vector generation for BCB-AES-GCM.
//!
//! RFC 9173 §4.3.1: an IV value must never be reused for multiple
//! encryptions under the same key. Each generator keeps a 12-byte
//! (64-bit time part + 32-bit counter) and a 16-byte (64 + 64) counter
//! pair. The time parts are seeded from the operating system RNG at
//! construction, so a process restart re-seeds rather than repeating.
//! Generators are not shared across threads.

use rand::rngs::OsRng;
use rand::RngCore;

/// A monotonically incrementing IV source for one processing thread.
#[derive(Debug)]
#[must_use]
pub struct IvGenerator {
    iv12_time: u64,
    iv12_counter: u32,
    iv16_time: u64,
    iv16_counter: u64,
}

impl IvGenerator {
    pub fn new() -> Self {
        IvGenerator {
            iv12_time: OsRng.next_u64(),
            iv12_counter: 0,
            iv16_time: OsRng.next_u64(),
            iv16_counter: 0,
        }
    }

    /// Return the current IV bytes, then increment the underlying counter.
    ///
    /// The counter carries into the time part on wraparound, so values never
    /// repeat within a process lifetime.
    pub fn serialize_and_increment(&mut self, use_12_byte: bool) -> Vec<u8> {
        if use_12_byte {
            let mut iv = Vec::with_capacity(12);
            iv.extend_from_slice(&self.iv12_time.to_le_bytes());
            iv.extend_from_slice(&self.iv12_counter.to_le_bytes());
            let (counter, carried) = self.iv12_counter.overflowing_add(1);
            self.iv12_counter = counter;
            self.iv12_time = self.iv12_time.wrapping_add(carried as u64);
            iv
        } else {
            let mut iv = Vec::with_capacity(16);
            iv.extend_from_slice(&self.iv16_time.to_le_bytes());
            iv.extend_from_slice(&self.iv16_counter.to_le_bytes());
            let (counter, carried) = self.iv16_counter.overflowing_add(1);
            self.iv16_counter = counter;
            self.iv16_time = self.iv16_time.wrapping_add(carried as u64);
            iv
        }
    }
}

impl Default for IvGenerator {
    fn default() -> Self {
        Self::new()
    }
}
