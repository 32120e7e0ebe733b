//! Streaming CRC-16 used by the DIF wire format.
//!
//! The polynomial and initial value match the checksum block of the DIF
//! firmware, which shifts least-significant-bit first; the constants
//! below are its bit-reversed (right-shifting) representation and must
//! be preserved bit-exact (the canonical two-frame record carries the
//! trailer 0x4C1A). The engine is byte-streaming so the codec can fold
//! in bytes as they pass through without buffering whole records.

use once_cell::sync::Lazy;

const POLY: u16 = 0xB75A;
const INIT: u16 = 0xDF12;

static TABLE: Lazy<[u16; 256]> = Lazy::new(|| {
    let mut table = [0u16; 256];
    for (i, entry) in table.iter_mut().enumerate() {
        let mut crc = i as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLY
            } else {
                crc >> 1
            };
        }
        *entry = crc;
    }
    table
});

/// Streaming 16-bit checksum. Never fails; block size is one byte.
#[derive(Debug, Clone)]
pub struct Crc16 {
    sum: u16,
}

impl Crc16 {
    pub fn new() -> Self {
        Self { sum: INIT }
    }

    /// Restart the checksum for a fresh record.
    pub fn reset(&mut self) {
        self.sum = INIT;
    }

    /// Fold `data` into the running checksum.
    pub fn update(&mut self, data: &[u8]) {
        for &b in data {
            self.sum = (self.sum >> 8) ^ TABLE[((self.sum ^ b as u16) & 0xFF) as usize];
        }
    }

    /// Current 16-bit checksum value.
    pub fn sum16(&self) -> u16 {
        self.sum
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}
