//! Packet receiver.
//!
//! [`receive_packet`] pulls one frame off a [`ByteChannel`]: it hunts for the
//! start marker, reads the header fields, the payload and the checksum, and
//! verifies the checksum before handing the packet out. Every read is bounded
//! by one of the [`CodecTimeouts`] budgets, so a stalled or silent host always
//! surfaces as a [`PacketError`] instead of a hang.

use crate::channel::ByteChannel;
use crate::error::{ChannelError, PacketError};
use crate::protocol::{Checksum, MAX_PAYLOAD, Packet, START_MARKER};
use log::{debug, trace};
use std::time::Duration;

/// Read budgets used while receiving one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecTimeouts {
    /// Wait per poll while hunting for the start marker.
    pub marker_poll: Duration,
    /// Consecutive empty polls tolerated before giving up on framing.
    pub max_idle_polls: u32,
    /// Wait for each header byte and the checksum byte.
    pub field: Duration,
    /// Overall budget for the whole payload.
    pub payload: Duration,
}

impl Default for CodecTimeouts {
    fn default() -> Self {
        Self {
            marker_poll: Duration::from_millis(50),
            max_idle_polls: 20,
            field: Duration::from_millis(100),
            payload: Duration::from_millis(1000),
        }
    }
}

impl CodecTimeouts {
    /// Longest a [`receive_packet`] call can take once framing is found.
    pub fn frame_budget(&self) -> Duration {
        self.field * 5 + self.payload
    }
}

fn read_field<C: ByteChannel + ?Sized>(
    channel: &mut C,
    timeout: Duration,
    sum: &mut Checksum,
) -> Result<u8, PacketError> {
    let b = read_unsummed(channel, timeout)?;
    sum.push(b);
    Ok(b)
}

fn read_unsummed<C: ByteChannel + ?Sized>(
    channel: &mut C,
    timeout: Duration,
) -> Result<u8, PacketError> {
    match channel.read_byte(timeout) {
        Ok(b) => Ok(b),
        Err(ChannelError::Timeout) => Err(PacketError::Incomplete),
        Err(ChannelError::Io(kind)) => Err(PacketError::Link(kind)),
    }
}

fn wait_for_marker<C: ByteChannel + ?Sized>(
    channel: &mut C,
    timeouts: &CodecTimeouts,
) -> Result<(), PacketError> {
    let mut idle_polls = 0u32;

    loop {
        match channel.read_byte(timeouts.marker_poll) {
            Ok(START_MARKER) => return Ok(()),
            Ok(other) => {
                trace!("discarding {other:#04x} before start marker");
                idle_polls = 0;
            },
            Err(ChannelError::Timeout) => {
                idle_polls += 1;
                if idle_polls > timeouts.max_idle_polls {
                    return Err(PacketError::NoFraming);
                }
            },
            Err(ChannelError::Io(kind)) => return Err(PacketError::Link(kind)),
        }
    }
}

/// Receive and validate one packet.
pub fn receive_packet<C: ByteChannel + ?Sized>(
    channel: &mut C,
    timeouts: &CodecTimeouts,
) -> Result<Packet, PacketError> {
    wait_for_marker(channel, timeouts)?;

    let mut sum = Checksum::new();
    sum.push(START_MARKER);

    let seq_hi = read_field(channel, timeouts.field, &mut sum)?;
    let seq_lo = read_field(channel, timeouts.field, &mut sum)?;
    let len_hi = read_field(channel, timeouts.field, &mut sum)?;
    let len_lo = read_field(channel, timeouts.field, &mut sum)?;
    let sequence = u16::from_be_bytes([seq_hi, seq_lo]);
    let len = u16::from_be_bytes([len_hi, len_lo]);

    if usize::from(len) > MAX_PAYLOAD {
        debug!("packet {sequence} declares {len} bytes, dropping");
        return Err(PacketError::Oversized { declared: len });
    }

    let mut payload = [0u8; MAX_PAYLOAD];
    let body = &mut payload[..usize::from(len)];
    let got = channel
        .read_block(body, timeouts.payload)
        .map_err(|e| match e {
            ChannelError::Timeout => PacketError::Incomplete,
            ChannelError::Io(kind) => PacketError::Link(kind),
        })?;
    if got < body.len() {
        debug!("packet {sequence}: payload short, {got} of {len} bytes");
        return Err(PacketError::Incomplete);
    }
    sum.update(body);

    let received = read_unsummed(channel, timeouts.field)?;
    let expected = sum.value();
    if expected != received {
        debug!("packet {sequence}: checksum {received:#04x}, computed {expected:#04x}");
        return Err(PacketError::ChecksumMismatch { expected, received });
    }

    trace!("packet {sequence}: {len} bytes, checksum ok");
    Ok(Packet::from_buffer(sequence, len, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimChannel, SimEvent};
    use std::io;

    fn frame(seq: u16, payload: &[u8]) -> Vec<u8> {
        Packet::new(seq, payload).unwrap().encode()
    }

    #[test]
    fn test_receive_round_trip() {
        let payload: Vec<u8> = (0..=255).collect();
        let mut ch = SimChannel::new([SimEvent::Bytes(frame(42, &payload))]);

        let packet = receive_packet(&mut ch, &CodecTimeouts::default()).unwrap();
        assert_eq!(packet.sequence(), 42);
        assert_eq!(packet.payload(), payload.as_slice());
        assert!(ch.written().is_empty());
    }

    #[test]
    fn test_skips_noise_before_marker() {
        let mut bytes = vec![0x00, 0x13, 0x55];
        bytes.extend(frame(1, &[9, 8, 7]));
        let mut ch = SimChannel::new([SimEvent::Bytes(bytes)]);

        let packet = receive_packet(&mut ch, &CodecTimeouts::default()).unwrap();
        assert_eq!(packet.payload(), &[9, 8, 7]);
    }

    #[test]
    fn test_empty_packet_is_decoded() {
        let mut ch = SimChannel::new([SimEvent::Bytes(frame(5, &[]))]);
        let packet = receive_packet(&mut ch, &CodecTimeouts::default()).unwrap();
        assert!(packet.is_empty());
    }

    #[test]
    fn test_oversized_length_rejected_before_payload() {
        // marker, seq 0x0001, len 0x0101 (257), then bytes that must stay unread
        let mut ch = SimChannel::new([SimEvent::Bytes(vec![
            0xAA, 0x00, 0x01, 0x01, 0x01, 0x11, 0x22,
        ])]);

        let err = receive_packet(&mut ch, &CodecTimeouts::default()).unwrap_err();
        assert_eq!(err, PacketError::Oversized { declared: 257 });
        assert!(!ch.is_exhausted());
    }

    #[test]
    fn test_timeout_in_header_is_incomplete_within_budget() {
        let timeouts = CodecTimeouts::default();
        let mut ch = SimChannel::new([
            SimEvent::Bytes(vec![0xAA, 0x00]),
            SimEvent::Gap(Duration::from_secs(60)),
        ]);

        let err = receive_packet(&mut ch, &timeouts).unwrap_err();
        assert_eq!(err, PacketError::Incomplete);
        assert_eq!(ch.now(), timeouts.field);
        assert!(ch.now() <= timeouts.frame_budget());
    }

    #[test]
    fn test_short_payload_is_incomplete() {
        let timeouts = CodecTimeouts::default();
        let mut bytes = frame(3, &[1; 100]);
        bytes.truncate(5 + 40);
        let mut ch = SimChannel::new([
            SimEvent::Bytes(bytes),
            SimEvent::Gap(Duration::from_secs(60)),
        ]);

        let err = receive_packet(&mut ch, &timeouts).unwrap_err();
        assert_eq!(err, PacketError::Incomplete);
        assert_eq!(ch.now(), timeouts.payload);
    }

    #[test]
    fn test_missing_checksum_is_incomplete() {
        let mut bytes = frame(3, &[1, 2, 3]);
        bytes.pop();
        let mut ch = SimChannel::new([
            SimEvent::Bytes(bytes),
            SimEvent::Gap(Duration::from_secs(1)),
        ]);

        let err = receive_packet(&mut ch, &CodecTimeouts::default()).unwrap_err();
        assert_eq!(err, PacketError::Incomplete);
    }

    #[test]
    fn test_corrupted_payload_is_checksum_mismatch() {
        let mut bytes = frame(3, &[1, 2, 3]);
        let expected_sum = bytes[8];
        bytes[6] ^= 0x40;
        let mut ch = SimChannel::new([SimEvent::Bytes(bytes)]);

        let err = receive_packet(&mut ch, &CodecTimeouts::default()).unwrap_err();
        assert_eq!(
            err,
            PacketError::ChecksumMismatch {
                expected: expected_sum.wrapping_add(0x40),
                received: expected_sum,
            }
        );
    }

    #[test]
    fn test_silence_is_no_framing_after_idle_polls() {
        let timeouts = CodecTimeouts::default();
        let mut ch = SimChannel::new([SimEvent::Gap(Duration::from_secs(60))]);

        let err = receive_packet(&mut ch, &timeouts).unwrap_err();
        assert_eq!(err, PacketError::NoFraming);
        assert_eq!(
            ch.now(),
            timeouts.marker_poll * (timeouts.max_idle_polls + 1)
        );
    }

    #[test]
    fn test_noise_resets_idle_count() {
        let timeouts = CodecTimeouts {
            max_idle_polls: 2,
            ..CodecTimeouts::default()
        };
        let mut bytes = vec![0x01];
        bytes.extend(frame(9, &[4]));
        let mut ch = SimChannel::new([
            SimEvent::Gap(Duration::from_millis(120)),
            SimEvent::Bytes(vec![0x01]),
            SimEvent::Gap(Duration::from_millis(120)),
            SimEvent::Bytes(bytes),
        ]);

        let packet = receive_packet(&mut ch, &timeouts).unwrap();
        assert_eq!(packet.sequence(), 9);
    }

    #[test]
    fn test_link_failure_is_reported() {
        let mut ch = SimChannel::new([SimEvent::Bytes(vec![0xAA, 0x00])]);
        let err = receive_packet(&mut ch, &CodecTimeouts::default()).unwrap_err();
        assert_eq!(err, PacketError::Link(io::ErrorKind::UnexpectedEof));
    }
}
