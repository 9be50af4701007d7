//! Cancellation through the interrupt checker.
//!
//! Kept in its own test binary: the checker is process-global and stays set.

use std::io::{self, Read, Write};
use std::time::Duration;

use uartboot::sim::{MemFlash, SimChannel, SimEvent};
use uartboot::{
    Error, FlashRegion, Packet, SessionConfig, SessionState, UpdateSession, Uploader,
};

struct SilentPort {
    written: Vec<u8>,
}

impl Read for SilentPort {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }
}

impl Write for SilentPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn interrupt_stops_session_and_uploader() {
    uartboot::set_interrupt_checker(|| true);
    assert!(uartboot::is_interrupted_requested());

    let region = FlashRegion::new(0, 4096, 512);
    let mut session = UpdateSession::new(
        SimChannel::new([SimEvent::Gap(Duration::from_secs(3600))]),
        MemFlash::new(region),
        SessionConfig::for_region(region),
    )
    .unwrap();
    assert!(matches!(session.run(), Err(Error::Cancelled)));
    assert_eq!(session.state(), SessionState::WaitHandshake);
    assert!(session.channel().written().is_empty());

    let mut port = SilentPort {
        written: Vec::new(),
    };
    let mut uploader = Uploader::new(&mut port);
    assert!(matches!(uploader.handshake(), Err(Error::Cancelled)));

    let packet = Packet::new(1, &[1, 2, 3]).unwrap();
    assert!(matches!(uploader.send_packet(&packet), Err(Error::Cancelled)));
    assert!(port.written.is_empty());
}
