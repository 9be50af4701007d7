//! Update packet.

use crate::error::PacketError;
use crate::protocol::{Checksum, HEADER_LEN, MAX_PAYLOAD, START_MARKER};
use byteorder::{BigEndian, WriteBytesExt};
use std::fmt;

/// A single update packet.
///
/// The payload lives in a fixed `MAX_PAYLOAD` buffer owned by the packet, so
/// receiving never allocates and a packet can be moved out of the codec
/// without copying through the heap.
#[derive(Clone)]
pub struct Packet {
    sequence: u16,
    len: u16,
    payload: [u8; MAX_PAYLOAD],
}

impl Packet {
    /// Build a packet carrying `payload`.
    pub fn new(sequence: u16, payload: &[u8]) -> Result<Self, PacketError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(PacketError::Oversized {
                declared: u16::try_from(payload.len()).unwrap_or(u16::MAX),
            });
        }
        let mut buf = [0u8; MAX_PAYLOAD];
        buf[..payload.len()].copy_from_slice(payload);
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_PAYLOAD
        let len = payload.len() as u16;
        Ok(Self {
            sequence,
            len,
            payload: buf,
        })
    }

    /// Assemble a packet from a filled buffer. `len` must not exceed
    /// `MAX_PAYLOAD`.
    pub(crate) fn from_buffer(sequence: u16, len: u16, payload: [u8; MAX_PAYLOAD]) -> Self {
        debug_assert!(usize::from(len) <= MAX_PAYLOAD);
        Self {
            sequence,
            len,
            payload,
        }
    }

    /// Advisory sequence number.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len()]
    }

    /// Whether this packet ends the image: non-empty and shorter than
    /// `MAX_PAYLOAD`.
    pub fn is_final(&self) -> bool {
        !self.is_empty() && self.len() < MAX_PAYLOAD
    }

    /// Marker, sequence number and length as sent on the wire.
    pub fn header(&self) -> [u8; HEADER_LEN] {
        let [seq_hi, seq_lo] = self.sequence.to_be_bytes();
        let [len_hi, len_lo] = self.len.to_be_bytes();
        [START_MARKER, seq_hi, seq_lo, len_hi, len_lo]
    }

    /// Checksum over header and payload.
    pub fn checksum(&self) -> u8 {
        let mut sum = Checksum::new();
        sum.update(&self.header());
        sum.update(self.payload());
        sum.value()
    }

    /// Encode the complete frame.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.len() + 1);
        buf.push(START_MARKER);
        buf.write_u16::<BigEndian>(self.sequence).unwrap();
        buf.write_u16::<BigEndian>(self.len).unwrap();
        buf.extend_from_slice(self.payload());
        buf.push(self.checksum());
        buf
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence && self.payload() == other.payload()
    }
}

impl Eq for Packet {}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("sequence", &self.sequence)
            .field("len", &self.len)
            .field("checksum", &format_args!("{:#04x}", self.checksum()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::checksum;

    #[test]
    fn test_encode_layout() {
        let packet = Packet::new(0x0102, &[0x10, 0x20, 0x30]).unwrap();
        let frame = packet.encode();

        assert_eq!(frame.len(), HEADER_LEN + 3 + 1);
        assert_eq!(&frame[..5], &[0xAA, 0x01, 0x02, 0x00, 0x03]);
        assert_eq!(&frame[5..8], &[0x10, 0x20, 0x30]);
        assert_eq!(frame[8], checksum(&frame[..8]));
    }

    #[test]
    fn test_full_packet_length_field() {
        let packet = Packet::new(7, &[0x5A; MAX_PAYLOAD]).unwrap();
        let frame = packet.encode();

        assert_eq!(&frame[3..5], &[0x01, 0x00]);
        assert_eq!(frame.len(), HEADER_LEN + MAX_PAYLOAD + 1);
        assert!(!packet.is_final());
    }

    #[test]
    fn test_new_rejects_oversized_payload() {
        let err = Packet::new(1, &[0u8; MAX_PAYLOAD + 1]).unwrap_err();
        assert_eq!(err, PacketError::Oversized { declared: 257 });
    }

    #[test]
    fn test_is_final() {
        assert!(Packet::new(1, &[1; 10]).unwrap().is_final());
        assert!(Packet::new(1, &[1; 255]).unwrap().is_final());
        assert!(!Packet::new(1, &[1; 256]).unwrap().is_final());
        assert!(!Packet::new(1, &[]).unwrap().is_final());
    }

    #[test]
    fn test_equality_ignores_unused_buffer() {
        let a = Packet::new(3, &[1, 2, 3]).unwrap();
        let mut buf = [0xEE; MAX_PAYLOAD];
        buf[..3].copy_from_slice(&[1, 2, 3]);
        let b = Packet::from_buffer(3, 3, buf);
        assert_eq!(a, b);
    }
}
