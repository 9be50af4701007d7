//! 8-bit additive checksum.
//!
//! The packet checksum is the wrapping sum of every byte from the start
//! marker through the last payload byte. It only catches simple line
//! corruption; it is not a digest.

/// Compute the additive checksum of `data`.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Incremental form of [`checksum`], for bytes that arrive one at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checksum(u8);

impl Checksum {
    /// Start an empty sum.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Fold a single byte.
    pub fn push(&mut self, byte: u8) {
        self.0 = self.0.wrapping_add(byte);
    }

    /// Fold a slice of bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.0 = self.0.wrapping_add(checksum(data));
    }

    /// Current value.
    pub fn value(self) -> u8 {
        self.0
    }
}
