//! Simulated collaborators for tests and host-side tooling.
//!
//! [`SimChannel`] replays a scripted byte stream against a simulated clock,
//! so timeout behavior can be checked without sleeping. [`MemFlash`] models
//! a NOR flash array in memory: pages erase to `0xFF` and a word can only be
//! programmed while erased.

use crate::error::{ChannelError, FlashError};
use crate::flash::{ERASED_BYTE, FlashDevice, FlashRegion, WORD_SIZE};
use log::trace;
use std::collections::VecDeque;
use std::io;
use std::time::Duration;

/// One step of a [`SimChannel`] script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// Bytes that become readable immediately, in order.
    Bytes(Vec<u8>),
    /// Silence on the line for this long.
    Gap(Duration),
}

/// Scripted [`ByteChannel`](crate::channel::ByteChannel) with a simulated
/// clock.
///
/// Reads consume the script front to back. A gap longer than the remaining
/// read budget advances the clock by the budget and reports a timeout; the
/// rest of the gap stays queued for the next read. Once the script is
/// exhausted every read fails with [`io::ErrorKind::UnexpectedEof`], which
/// callers see as a link failure.
#[derive(Debug, Default)]
pub struct SimChannel {
    script: VecDeque<SimEvent>,
    clock: Duration,
    written: Vec<u8>,
}

impl SimChannel {
    /// Create a channel that will replay `events`.
    pub fn new(events: impl IntoIterator<Item = SimEvent>) -> Self {
        Self {
            script: events.into_iter().collect(),
            clock: Duration::ZERO,
            written: Vec::new(),
        }
    }

    /// Everything written to the channel so far.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Whether every scripted event has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.script.is_empty()
    }
}

impl crate::channel::ByteChannel for SimChannel {
    fn read_byte(&mut self, timeout: Duration) -> Result<u8, ChannelError> {
        let mut remaining = timeout;

        loop {
            match self.script.front_mut() {
                None => return Err(ChannelError::Io(io::ErrorKind::UnexpectedEof)),
                Some(SimEvent::Bytes(bytes)) => {
                    if bytes.is_empty() {
                        self.script.pop_front();
                        continue;
                    }
                    let b = bytes.remove(0);
                    if bytes.is_empty() {
                        self.script.pop_front();
                    }
                    return Ok(b);
                },
                Some(SimEvent::Gap(gap)) => {
                    if *gap < remaining {
                        self.clock += *gap;
                        remaining -= *gap;
                        self.script.pop_front();
                    } else {
                        self.clock += remaining;
                        *gap -= remaining;
                        if gap.is_zero() {
                            self.script.pop_front();
                        }
                        return Err(ChannelError::Timeout);
                    }
                },
            }
        }
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), ChannelError> {
        self.written.push(byte);
        Ok(())
    }

    fn now(&self) -> Duration {
        self.clock
    }
}

/// In-memory NOR flash.
#[derive(Debug, Clone)]
pub struct MemFlash {
    region: FlashRegion,
    mem: Vec<u8>,
    erased_pages: Vec<u32>,
    words_programmed: usize,
    fail_program_at: Option<u32>,
    fail_erase_at: Option<u32>,
}

impl MemFlash {
    /// Create a fully erased flash covering `region`.
    pub fn new(region: FlashRegion) -> Self {
        Self {
            region,
            mem: vec![ERASED_BYTE; region.size as usize],
            erased_pages: Vec::new(),
            words_programmed: 0,
            fail_program_at: None,
            fail_erase_at: None,
        }
    }

    /// Fill the array with `byte`, as if it held a previous image.
    #[must_use]
    pub fn filled(mut self, byte: u8) -> Self {
        self.mem.fill(byte);
        self
    }

    /// Reject any program operation that touches the word at `address`.
    #[must_use]
    pub fn fail_program_at(mut self, address: u32) -> Self {
        self.fail_program_at = Some(address);
        self
    }

    /// Reject the erase of the page starting at `address`.
    #[must_use]
    pub fn fail_erase_at(mut self, address: u32) -> Self {
        self.fail_erase_at = Some(address);
        self
    }

    /// Region this flash covers.
    pub fn region(&self) -> FlashRegion {
        self.region
    }

    /// `len` bytes starting at absolute `address`, if inside the array.
    pub fn read(&self, address: u32, len: usize) -> Option<&[u8]> {
        let start = address.checked_sub(self.region.base)? as usize;
        self.mem.get(start..start.checked_add(len)?)
    }

    /// Page addresses erased so far, in order.
    pub fn erased_pages(&self) -> &[u32] {
        &self.erased_pages
    }

    /// Number of successful word programs.
    pub fn words_programmed(&self) -> usize {
        self.words_programmed
    }

    fn offset(&self, address: u32, len: usize) -> Result<usize, FlashError> {
        let start = address
            .checked_sub(self.region.base)
            .ok_or(FlashError::OutOfRange { address })? as usize;
        if start + len > self.mem.len() {
            return Err(FlashError::OutOfRange { address });
        }
        Ok(start)
    }
}

impl FlashDevice for MemFlash {
    fn page_size(&self) -> u32 {
        self.region.page_size
    }

    fn erase_page(&mut self, address: u32) -> Result<(), FlashError> {
        if address.wrapping_sub(self.region.base) % self.region.page_size != 0 {
            return Err(FlashError::Misaligned { address });
        }
        let start = self.offset(address, self.region.page_size as usize)?;
        if self.fail_erase_at == Some(address) {
            return Err(FlashError::Rejected { address });
        }
        trace!("erase page {address:#010x}");
        self.mem[start..start + self.region.page_size as usize].fill(ERASED_BYTE);
        self.erased_pages.push(address);
        Ok(())
    }

    fn program_word(&mut self, address: u32, word: u32) -> Result<(), FlashError> {
        if address as usize % WORD_SIZE != 0 {
            return Err(FlashError::Misaligned { address });
        }
        let start = self.offset(address, WORD_SIZE)?;
        if self.fail_program_at == Some(address) {
            return Err(FlashError::Rejected { address });
        }
        let cell = &mut self.mem[start..start + WORD_SIZE];
        if cell.iter().any(|&b| b != ERASED_BYTE) {
            return Err(FlashError::NotErased { address });
        }
        cell.copy_from_slice(&word.to_le_bytes());
        self.words_programmed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ByteChannel;

    fn region() -> FlashRegion {
        FlashRegion::new(0x1000, 1024, 256)
    }

    #[test]
    fn test_sim_channel_partial_gap() {
        let mut ch = SimChannel::new([
            SimEvent::Gap(Duration::from_millis(150)),
            SimEvent::Bytes(vec![0x42]),
        ]);

        assert_eq!(
            ch.read_byte(Duration::from_millis(100)),
            Err(ChannelError::Timeout)
        );
        assert_eq!(ch.now(), Duration::from_millis(100));
        assert_eq!(ch.read_byte(Duration::from_millis(100)), Ok(0x42));
        assert_eq!(ch.now(), Duration::from_millis(150));
    }

    #[test]
    fn test_sim_channel_exhausted_is_link_failure() {
        let mut ch = SimChannel::new([SimEvent::Bytes(vec![1])]);
        assert_eq!(ch.read_byte(Duration::from_millis(10)), Ok(1));
        assert!(ch.is_exhausted());
        assert_eq!(
            ch.read_byte(Duration::from_millis(10)),
            Err(ChannelError::Io(io::ErrorKind::UnexpectedEof))
        );
    }

    #[test]
    fn test_mem_flash_program_requires_erased_word() {
        let mut flash = MemFlash::new(region()).filled(0x00);
        assert_eq!(
            flash.program_word(0x1000, 0x1234_5678),
            Err(FlashError::NotErased { address: 0x1000 })
        );

        flash.erase_page(0x1000).unwrap();
        flash.program_word(0x1000, 0x1234_5678).unwrap();
        assert_eq!(flash.read(0x1000, 4).unwrap(), &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(flash.erased_pages(), &[0x1000]);
        assert_eq!(flash.words_programmed(), 1);
    }

    #[test]
    fn test_mem_flash_bounds_and_alignment() {
        let mut flash = MemFlash::new(region());
        assert_eq!(
            flash.program_word(0x0FFC, 0),
            Err(FlashError::OutOfRange { address: 0x0FFC })
        );
        assert_eq!(
            flash.program_word(0x1400, 0),
            Err(FlashError::OutOfRange { address: 0x1400 })
        );
        assert_eq!(
            flash.program_word(0x1002, 0),
            Err(FlashError::Misaligned { address: 0x1002 })
        );
        assert_eq!(
            flash.erase_page(0x1080),
            Err(FlashError::Misaligned { address: 0x1080 })
        );
    }

    #[test]
    fn test_mem_flash_failure_injection() {
        let mut flash = MemFlash::new(region()).fail_program_at(0x1104);
        flash.program_word(0x1100, 1).unwrap();
        assert_eq!(
            flash.program_word(0x1104, 2),
            Err(FlashError::Rejected { address: 0x1104 })
        );
        assert_eq!(flash.read(0x1104, 4).unwrap(), &[0xFF; 4]);
    }
}
