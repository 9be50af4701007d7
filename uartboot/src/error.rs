//! Error types for uartboot.
//!
//! [`Error`] is the crate-wide error returned by host-facing operations
//! (opening ports, uploading images, running a session). The device-side
//! components report through smaller, copyable enums so a state machine can
//! match on them without allocating:
//!
//! - [`ChannelError`]: a single blocking read or write on the byte channel.
//! - [`PacketError`]: why the codec did not produce a valid packet.
//! - [`HandshakeError`]: why a handshake attempt did not grant update mode.
//! - [`FlashError`]: why the flash device rejected an erase or program.

use std::io;
use thiserror::Error;

/// Result type for uartboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for uartboot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Device not responding or not in bootloader mode.
    #[error("Device not found or not in bootloader mode")]
    DeviceNotFound,

    /// Handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Protocol error (unexpected status byte, retries exhausted).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device answered a packet with the fatal programming-error code.
    #[error("Device reported a flash programming failure at packet {sequence}")]
    Programming {
        /// Sequence number of the packet that could not be written.
        sequence: u16,
    },

    /// Local flash device error.
    #[error("Flash error: {0}")]
    Flash(#[from] FlashError),

    /// The byte channel failed below the protocol (port closed, unplugged).
    #[error("Link error: {0:?}")]
    Link(io::ErrorKind),

    /// Invalid firmware image.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation interrupted by the embedding application.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Failure of a single byte-channel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Nothing arrived within the timeout budget.
    #[error("read timed out")]
    Timeout,

    /// The underlying transport failed.
    #[error("channel I/O error: {0:?}")]
    Io(io::ErrorKind),
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            kind => Self::Io(kind),
        }
    }
}

/// Reasons the packet codec rejected an attempt.
///
/// Every variant except [`PacketError::Link`] is recoverable: the sequencer
/// answers with the packet-error code and waits for a retransmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    /// No start marker before the idle budget ran out.
    #[error("no start marker within the framing budget")]
    NoFraming,

    /// A header field, payload byte or checksum byte did not arrive in time.
    #[error("packet incomplete")]
    Incomplete,

    /// The declared payload length exceeds the receive buffer.
    #[error("declared payload length {declared} exceeds maximum")]
    Oversized {
        /// Length announced by the header.
        declared: u16,
    },

    /// The trailing checksum does not match the received bytes.
    #[error("checksum mismatch: computed {expected:#04x}, received {received:#04x}")]
    ChecksumMismatch {
        /// Checksum computed over the received bytes.
        expected: u8,
        /// Checksum byte sent by the host.
        received: u8,
    },

    /// The channel itself failed; not recoverable by retransmission.
    #[error("link failure: {0:?}")]
    Link(io::ErrorKind),
}

/// Reasons a handshake attempt did not grant update mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// A token did not arrive within the token timeout.
    #[error("handshake token timed out")]
    Timeout,

    /// A byte arrived but was not the expected token.
    #[error("expected token {expected:#04x}, received {received:#04x}")]
    UnexpectedToken {
        /// Token the negotiator was waiting for.
        expected: u8,
        /// Byte that actually arrived.
        received: u8,
    },

    /// The channel failed.
    #[error("link failure: {0:?}")]
    Link(io::ErrorKind),
}

/// Flash device failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlashError {
    /// Address outside the configured flash region.
    #[error("address {address:#010x} outside flash region")]
    OutOfRange {
        /// Offending address.
        address: u32,
    },

    /// Address not aligned to a word or page boundary.
    #[error("address {address:#010x} is misaligned")]
    Misaligned {
        /// Offending address.
        address: u32,
    },

    /// Target word was not in the erased state before programming.
    #[error("word at {address:#010x} is not erased")]
    NotErased {
        /// Offending address.
        address: u32,
    },

    /// The flash controller reported a failure.
    #[error("flash controller rejected operation at {address:#010x}")]
    Rejected {
        /// Offending address.
        address: u32,
    },
}
