//! Wire protocol: constants, checksum, packet framing and handshake.
//!
//! ## Frame Format
//!
//! ```text
//! +--------+--------+--------+----------------+--------+
//! | Marker |  Seq   |  Len   |    Payload     |  Sum   |
//! +--------+--------+--------+----------------+--------+
//! |   1    | 2 (BE) | 2 (BE) |   Len bytes    |   1    |
//! +--------+--------+--------+----------------+--------+
//! |  0xAA  | advis. | 0..256 | image bytes    | 8-bit  |
//! +--------+--------+--------+----------------+--------+
//! ```
//!
//! The host opens a session with the two handshake tokens and the device
//! answers each packet with a single status byte.

pub mod checksum;
pub mod codec;
pub mod handshake;
pub mod packet;

pub use checksum::{Checksum, checksum};
pub use codec::{CodecTimeouts, receive_packet};
pub use handshake::{HandshakeState, Negotiator, send_handshake};
pub use packet::Packet;

/// First handshake token (host to device).
pub const HANDSHAKE_TOKEN_1: u8 = 0x55;

/// Second handshake token (host to device).
pub const HANDSHAKE_TOKEN_2: u8 = 0x5A;

/// Handshake acknowledge (device to host).
pub const HANDSHAKE_ACK: u8 = 0xAA;

/// Start-of-packet marker.
pub const START_MARKER: u8 = 0xAA;

/// Per-packet acknowledge (device to host).
pub const PACKET_ACK: u8 = 0xAA;

/// Packet rejected, host should retransmit.
pub const PACKET_ERROR: u8 = 0xFF;

/// Flash programming failed, session is over.
pub const PROGRAMMING_ERROR: u8 = 0xFE;

/// Largest payload a packet may carry. A shorter non-empty payload marks
/// the final packet of an image.
pub const MAX_PAYLOAD: usize = 256;

/// Bytes preceding the payload: marker, sequence number, length.
pub const HEADER_LEN: usize = 5;

/// Default line rate.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Device status byte received by the host after a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Packet written.
    Ack,
    /// Packet rejected, retransmit.
    PacketError,
    /// Flash write failed, the device stopped.
    ProgrammingError,
    /// Any other byte (line noise, application output).
    Unknown(u8),
}

impl From<u8> for Status {
    fn from(byte: u8) -> Self {
        match byte {
            PACKET_ACK => Self::Ack,
            PACKET_ERROR => Self::PacketError,
            PROGRAMMING_ERROR => Self::ProgrammingError,
            other => Self::Unknown(other),
        }
    }
}

impl Status {
    /// Wire value of this status.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Ack => PACKET_ACK,
            Self::PacketError => PACKET_ERROR,
            Self::ProgrammingError => PROGRAMMING_ERROR,
            Self::Unknown(b) => b,
        }
    }
}
