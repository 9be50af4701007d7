//! Flash device abstraction and the programming adapter.
//!
//! A [`FlashDevice`] only knows how to erase a page and program a single
//! 32-bit word. [`program_bytes`] turns an arbitrary payload into little-endian
//! word writes, padding a trailing partial word with the erased value, and
//! [`erase_range`] erases every page a write is about to touch.

use crate::error::{Error, FlashError, Result};
use log::trace;

/// Width of one program operation in bytes.
pub const WORD_SIZE: usize = 4;

/// Value of an erased flash byte.
pub const ERASED_BYTE: u8 = 0xFF;

/// Value of an erased flash word.
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

/// Default region base (start of APROM on the reference board).
pub const DEFAULT_BASE: u32 = 0x0000_0000;

/// Default region size (512 KiB).
pub const DEFAULT_SIZE: u32 = 512 * 1024;

/// Default erase page size.
pub const DEFAULT_PAGE_SIZE: u32 = 512;

/// On-chip flash as seen by the update sequencer.
pub trait FlashDevice {
    /// Erase granularity in bytes.
    fn page_size(&self) -> u32;

    /// Erase the page starting at `address`.
    fn erase_page(&mut self, address: u32) -> std::result::Result<(), FlashError>;

    /// Program one word at a word-aligned `address`.
    fn program_word(&mut self, address: u32, word: u32) -> std::result::Result<(), FlashError>;
}

impl<F: FlashDevice + ?Sized> FlashDevice for &mut F {
    fn page_size(&self) -> u32 {
        (**self).page_size()
    }

    fn erase_page(&mut self, address: u32) -> std::result::Result<(), FlashError> {
        (**self).erase_page(address)
    }

    fn program_word(&mut self, address: u32, word: u32) -> std::result::Result<(), FlashError> {
        (**self).program_word(address, word)
    }
}

/// The part of flash an image may be written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashRegion {
    /// First address of the region; page aligned.
    pub base: u32,
    /// Region size in bytes; a multiple of the page size.
    pub size: u32,
    /// Erase page size in bytes.
    pub page_size: u32,
}

impl Default for FlashRegion {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_SIZE, DEFAULT_PAGE_SIZE)
    }
}

impl FlashRegion {
    /// Describe a region.
    pub const fn new(base: u32, size: u32, page_size: u32) -> Self {
        Self {
            base,
            size,
            page_size,
        }
    }

    /// One past the last address of the region.
    pub fn end(&self) -> u32 {
        self.base.saturating_add(self.size)
    }

    /// Check the geometry is usable.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0
            || !self.page_size.is_power_of_two()
            || (self.page_size as usize) < WORD_SIZE
        {
            return Err(Error::Config(format!(
                "page size {} is not a power of two of at least {WORD_SIZE} bytes",
                self.page_size
            )));
        }
        if self.base % self.page_size != 0 {
            return Err(Error::Config(format!(
                "region base {:#010x} is not page aligned",
                self.base
            )));
        }
        if self.size == 0 || self.size % self.page_size != 0 {
            return Err(Error::Config(format!(
                "region size {} is not a non-zero multiple of the page size",
                self.size
            )));
        }
        if self.base.checked_add(self.size).is_none() {
            return Err(Error::Config(
                "region extends past the 32-bit address space".to_string(),
            ));
        }
        Ok(())
    }

    /// Ensure `len` bytes written at `address` (padded to whole words) stay
    /// inside the region.
    pub fn check(&self, address: u32, len: usize) -> std::result::Result<(), FlashError> {
        let padded = len.div_ceil(WORD_SIZE) * WORD_SIZE;
        let end = u64::from(address) + padded as u64;
        if address < self.base || end > u64::from(self.end()) {
            return Err(FlashError::OutOfRange { address });
        }
        Ok(())
    }

    /// Start of the page containing `address`.
    pub fn page_floor(&self, address: u32) -> u32 {
        address - (address - self.base) % self.page_size
    }
}

/// Program `data` at word-aligned `address` as little-endian words.
///
/// A trailing partial word is padded with [`ERASED_BYTE`]. Stops at the first
/// failing word.
pub fn program_bytes<F: FlashDevice + ?Sized>(
    flash: &mut F,
    address: u32,
    data: &[u8],
) -> std::result::Result<(), FlashError> {
    if address as usize % WORD_SIZE != 0 {
        return Err(FlashError::Misaligned { address });
    }

    let mut cursor = address;
    for chunk in data.chunks(WORD_SIZE) {
        let mut word = [ERASED_BYTE; WORD_SIZE];
        word[..chunk.len()].copy_from_slice(chunk);
        flash.program_word(cursor, u32::from_le_bytes(word))?;
        cursor = cursor
            .checked_add(WORD_SIZE as u32)
            .ok_or(FlashError::OutOfRange { address: cursor })?;
    }

    trace!("programmed {} bytes at {address:#010x}", data.len());
    Ok(())
}

/// Erase every page of `region` overlapping `[start, end)`.
///
/// Returns the address of the first page after the erased span, so a caller
/// writing sequentially can remember how far it has erased.
pub fn erase_range<F: FlashDevice + ?Sized>(
    flash: &mut F,
    region: &FlashRegion,
    start: u32,
    end: u32,
) -> std::result::Result<u32, FlashError> {
    if start < region.base || end > region.end() {
        return Err(FlashError::OutOfRange { address: start });
    }

    let mut page = region.page_floor(start);
    while page < end {
        trace!("erasing page {page:#010x}");
        flash.erase_page(page)?;
        page = match page.checked_add(region.page_size) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(page.max(start))
}
