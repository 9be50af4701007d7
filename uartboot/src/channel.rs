//! Byte channel: the serial link as seen by the bootloader core.
//!
//! The core only ever needs "give me one byte within this budget" and "send
//! these bytes". Keeping the contract that small lets the same codec and
//! sequencer run against a real serial port ([`PortChannel`]), an in-process
//! pipe, or the scripted [`crate::sim::SimChannel`] used in tests.
//!
//! Every read carries an explicit [`Duration`]. Implementations must return
//! [`ChannelError::Timeout`] once the budget is spent instead of blocking
//! longer, and must report elapsed time through [`ByteChannel::now`] so
//! callers can split one budget across several reads.

use crate::error::ChannelError;
use crate::port::Port;
use log::trace;
use std::time::{Duration, Instant};

/// Blocking, timeout-bounded byte transport.
pub trait ByteChannel {
    /// Read one byte, waiting at most `timeout`.
    fn read_byte(&mut self, timeout: Duration) -> Result<u8, ChannelError>;

    /// Write one byte.
    fn write_byte(&mut self, byte: u8) -> Result<(), ChannelError>;

    /// Monotonic time since an arbitrary, fixed epoch.
    fn now(&self) -> Duration;

    /// Write a buffer.
    fn write_all(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        for &b in data {
            self.write_byte(b)?;
        }
        Ok(())
    }

    /// Fill `buf` within an overall `timeout`.
    ///
    /// Returns the number of bytes read; fewer than `buf.len()` means the
    /// budget ran out. Only transport failures are errors.
    fn read_block(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError> {
        let deadline = self.now() + timeout;
        let mut filled = 0;

        while filled < buf.len() {
            let remaining = deadline.saturating_sub(self.now());
            if remaining.is_zero() {
                break;
            }
            match self.read_byte(remaining) {
                Ok(b) => {
                    buf[filled] = b;
                    filled += 1;
                },
                Err(ChannelError::Timeout) => break,
                Err(e) => return Err(e),
            }
        }

        Ok(filled)
    }
}

impl<C: ByteChannel + ?Sized> ByteChannel for &mut C {
    fn read_byte(&mut self, timeout: Duration) -> Result<u8, ChannelError> {
        (**self).read_byte(timeout)
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), ChannelError> {
        (**self).write_byte(byte)
    }

    fn now(&self) -> Duration {
        (**self).now()
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        (**self).write_all(data)
    }

    fn read_block(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ChannelError> {
        (**self).read_block(buf, timeout)
    }
}

/// Shortest timeout handed to the port; some drivers treat zero as
/// "block forever".
const MIN_PORT_TIMEOUT: Duration = Duration::from_millis(1);

/// [`ByteChannel`] over a serial [`Port`].
pub struct PortChannel<P: Port> {
    port: P,
    epoch: Instant,
}

impl<P: Port> PortChannel<P> {
    /// Wrap an opened port.
    pub fn new(port: P) -> Self {
        Self {
            port,
            epoch: Instant::now(),
        }
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Consume the channel and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    fn apply_timeout(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        let timeout = timeout.max(MIN_PORT_TIMEOUT);
        if self.port.timeout() != timeout {
            self.port
                .set_timeout(timeout)
                .map_err(|_| ChannelError::Io(std::io::ErrorKind::Other))?;
        }
        Ok(())
    }
}

impl<P: Port> ByteChannel for PortChannel<P> {
    fn read_byte(&mut self, timeout: Duration) -> Result<u8, ChannelError> {
        self.apply_timeout(timeout)?;
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => {
                trace!("rx {:02X}", buf[0]);
                Ok(buf[0])
            },
            Ok(_) => Err(ChannelError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), ChannelError> {
        self.write_all(&[byte])
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        trace!("tx {data:02X?}");
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }
}
