//! Handshake: the two-token exchange that puts the device into update mode.
//!
//! ```text
//! Host                    Device
//!  |  0x55                  |  AwaitingFirstToken
//!  |----------------------->|
//!  |  0x5A                  |  AwaitingSecondToken
//!  |----------------------->|
//!  |                  0xAA  |  Granted
//!  |<-----------------------|
//! ```
//!
//! Any timeout or unexpected byte sends the device back to
//! `AwaitingFirstToken`; the host simply tries again.

use crate::channel::ByteChannel;
use crate::error::{ChannelError, Error, HandshakeError, Result};
use crate::protocol::{HANDSHAKE_ACK, HANDSHAKE_TOKEN_1, HANDSHAKE_TOKEN_2};
use log::{debug, trace};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Default wait for each handshake token.
pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Device-side handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Waiting for `0x55`.
    #[default]
    AwaitingFirstToken,
    /// `0x55` seen, waiting for `0x5A`.
    AwaitingSecondToken,
    /// Both tokens seen and acknowledged.
    Granted,
}

/// Device-side handshake state machine.
#[derive(Debug, Clone)]
pub struct Negotiator {
    state: HandshakeState,
    token_timeout: Duration,
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TIMEOUT)
    }
}

impl Negotiator {
    /// Create a negotiator waiting at most `token_timeout` per token.
    pub fn new(token_timeout: Duration) -> Self {
        Self {
            state: HandshakeState::AwaitingFirstToken,
            token_timeout,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Per-token timeout.
    pub fn token_timeout(&self) -> Duration {
        self.token_timeout
    }

    /// Run one handshake attempt.
    ///
    /// On success the ack byte has been written and the state is
    /// [`HandshakeState::Granted`]. On failure the state is back at
    /// [`HandshakeState::AwaitingFirstToken`] and nothing was written.
    pub fn attempt<C: ByteChannel + ?Sized>(
        &mut self,
        channel: &mut C,
    ) -> std::result::Result<(), HandshakeError> {
        self.state = HandshakeState::AwaitingFirstToken;
        let result = self.negotiate(channel);
        if result.is_err() {
            self.state = HandshakeState::AwaitingFirstToken;
        }
        result
    }

    fn negotiate<C: ByteChannel + ?Sized>(
        &mut self,
        channel: &mut C,
    ) -> std::result::Result<(), HandshakeError> {
        self.expect(channel, HANDSHAKE_TOKEN_1)?;
        self.state = HandshakeState::AwaitingSecondToken;

        self.expect(channel, HANDSHAKE_TOKEN_2)?;

        channel.write_byte(HANDSHAKE_ACK).map_err(link_error)?;
        self.state = HandshakeState::Granted;
        debug!("Handshake granted");
        Ok(())
    }

    fn expect<C: ByteChannel + ?Sized>(
        &self,
        channel: &mut C,
        token: u8,
    ) -> std::result::Result<(), HandshakeError> {
        match channel.read_byte(self.token_timeout) {
            Ok(b) if b == token => {
                trace!("handshake token {b:#04x}");
                Ok(())
            },
            Ok(received) => Err(HandshakeError::UnexpectedToken {
                expected: token,
                received,
            }),
            Err(e) => Err(link_error(e)),
        }
    }
}

fn link_error(e: ChannelError) -> HandshakeError {
    match e {
        ChannelError::Timeout => HandshakeError::Timeout,
        ChannelError::Io(kind) => HandshakeError::Link(kind),
    }
}

/// Host side: send both tokens and wait up to `timeout` for the ack.
///
/// Bytes other than the ack (boot banners, line noise) are skipped.
pub fn send_handshake<P: Read + Write + ?Sized>(port: &mut P, timeout: Duration) -> Result<()> {
    port.write_all(&[HANDSHAKE_TOKEN_1, HANDSHAKE_TOKEN_2])?;
    port.flush()?;

    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 1];
    loop {
        match port.read(&mut buf) {
            Ok(1) if buf[0] == HANDSHAKE_ACK => {
                debug!("Handshake acknowledged");
                return Ok(());
            },
            Ok(1) => trace!("ignoring {:#04x} while waiting for handshake ack", buf[0]),
            Ok(_) => {},
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {},
            Err(e) => return Err(e.into()),
        }

        if Instant::now() >= deadline {
            return Err(Error::Timeout(format!(
                "no handshake ack within {}ms",
                timeout.as_millis()
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimChannel, SimEvent};
    use std::collections::VecDeque;

    #[test]
    fn test_valid_tokens_write_one_ack() {
        let mut ch = SimChannel::new([SimEvent::Bytes(vec![0x55, 0x5A])]);
        let mut negotiator = Negotiator::default();

        negotiator.attempt(&mut ch).unwrap();
        assert_eq!(negotiator.state(), HandshakeState::Granted);
        assert_eq!(ch.written(), &[0xAA]);
    }

    #[test]
    fn test_wrong_second_token_resets() {
        let mut ch = SimChannel::new([SimEvent::Bytes(vec![0x55, 0x99])]);
        let mut negotiator = Negotiator::default();

        let err = negotiator.attempt(&mut ch).unwrap_err();
        assert_eq!(
            err,
            HandshakeError::UnexpectedToken {
                expected: 0x5A,
                received: 0x99
            }
        );
        assert_eq!(negotiator.state(), HandshakeState::AwaitingFirstToken);
        assert!(ch.written().is_empty());
    }

    #[test]
    fn test_wrong_first_token() {
        let mut ch = SimChannel::new([SimEvent::Bytes(vec![0x5A])]);
        let mut negotiator = Negotiator::default();

        assert_eq!(
            negotiator.attempt(&mut ch),
            Err(HandshakeError::UnexpectedToken {
                expected: 0x55,
                received: 0x5A
            })
        );
    }

    #[test]
    fn test_timeout_between_tokens() {
        let mut ch = SimChannel::new([
            SimEvent::Bytes(vec![0x55]),
            SimEvent::Gap(Duration::from_secs(5)),
            SimEvent::Bytes(vec![0x5A]),
        ]);
        let mut negotiator = Negotiator::new(Duration::from_millis(200));

        assert_eq!(negotiator.attempt(&mut ch), Err(HandshakeError::Timeout));
        assert_eq!(negotiator.state(), HandshakeState::AwaitingFirstToken);
        assert_eq!(ch.now(), Duration::from_millis(200));
    }

    #[test]
    fn test_retry_after_failure_succeeds() {
        let mut ch = SimChannel::new([SimEvent::Bytes(vec![0x55, 0x00, 0x55, 0x5A])]);
        let mut negotiator = Negotiator::default();

        assert!(negotiator.attempt(&mut ch).is_err());
        negotiator.attempt(&mut ch).unwrap();
        assert_eq!(ch.written(), &[0xAA]);
    }

    /// Serial double: replies are queued up front, writes are recorded.
    struct MockSerial {
        read_buf: VecDeque<u8>,
        write_buf: Vec<u8>,
    }

    impl MockSerial {
        fn new(replies: &[u8]) -> Self {
            Self {
                read_buf: replies.iter().copied().collect(),
                write_buf: Vec::new(),
            }
        }
    }

    impl Read for MockSerial {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.read_buf.pop_front() {
                Some(b) => {
                    buf[0] = b;
                    Ok(1)
                },
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "no data")),
            }
        }
    }

    impl Write for MockSerial {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.write_buf.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_send_handshake_skips_noise() {
        let mut port = MockSerial::new(&[0x00, 0x42, 0xAA]);
        send_handshake(&mut port, Duration::from_millis(50)).unwrap();
        assert_eq!(port.write_buf, vec![0x55, 0x5A]);
    }

    #[test]
    fn test_send_handshake_times_out() {
        let mut port = MockSerial::new(&[]);
        let err = send_handshake(&mut port, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
