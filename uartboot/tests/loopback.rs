//! Host uploader against the device-side session over an in-process link.

use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use uartboot::sim::MemFlash;
use uartboot::{
    ByteChannel, ChannelError, FirmwareImage, FlashRegion, SessionConfig, SessionOutcome,
    UpdateSession, UploadConfig, Uploader,
};

/// Device end of the link.
struct DeviceEnd {
    rx: Receiver<u8>,
    tx: Sender<u8>,
    epoch: Instant,
}

impl ByteChannel for DeviceEnd {
    fn read_byte(&mut self, timeout: Duration) -> Result<u8, ChannelError> {
        match self.rx.recv_timeout(timeout) {
            Ok(b) => Ok(b),
            Err(RecvTimeoutError::Timeout) => Err(ChannelError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ChannelError::Io(io::ErrorKind::BrokenPipe))
            },
        }
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), ChannelError> {
        self.tx
            .send(byte)
            .map_err(|_| ChannelError::Io(io::ErrorKind::BrokenPipe))
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Host end of the link. Can corrupt one write to exercise retransmission.
struct HostEnd {
    rx: Receiver<u8>,
    tx: Sender<u8>,
    writes: usize,
    corrupt_write: Option<usize>,
}

impl Read for HostEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.rx.recv_timeout(Duration::from_millis(10)) {
            Ok(b) => {
                buf[0] = b;
                Ok(1)
            },
            Err(RecvTimeoutError::Timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
            },
            Err(RecvTimeoutError::Disconnected) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"))
            },
        }
    }
}

impl Write for HostEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let corrupt = self.corrupt_write == Some(self.writes);
        self.writes += 1;

        for (i, &b) in buf.iter().enumerate() {
            let b = if corrupt && i == 10 { b ^ 0x5A } else { b };
            self.tx
                .send(b)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device gone"))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn link(corrupt_write: Option<usize>) -> (HostEnd, DeviceEnd) {
    let (host_tx, device_rx) = mpsc::channel();
    let (device_tx, host_rx) = mpsc::channel();
    (
        HostEnd {
            rx: host_rx,
            tx: host_tx,
            writes: 0,
            corrupt_write,
        },
        DeviceEnd {
            rx: device_rx,
            tx: device_tx,
            epoch: Instant::now(),
        },
    )
}

fn test_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn run_update(
    data: &[u8],
    corrupt_write: Option<usize>,
    pad_tail: bool,
) -> (uartboot::UploadReport, SessionOutcome, MemFlash) {
    let region = FlashRegion::new(0x0000_4000, 16 * 1024, 512);
    let (mut host, device) = link(corrupt_write);

    let device_thread = thread::spawn(move || {
        let mut session = UpdateSession::new(
            device,
            MemFlash::new(region).filled(0x00),
            SessionConfig::for_region(region),
        )
        .unwrap();
        let outcome = session.run().unwrap();
        let (_, flash) = session.into_parts();
        (outcome, flash)
    });

    let image = FirmwareImage::from_bytes(data.to_vec()).unwrap();
    let config = UploadConfig {
        pad_tail,
        ..UploadConfig::default()
    };
    let report = Uploader::with_config(&mut host, config)
        .upload(&image, |_, _| {})
        .unwrap();

    let (outcome, flash) = device_thread.join().unwrap();
    (report, outcome, flash)
}

#[test]
fn upload_programs_image_at_region_base() {
    let data = test_image(1500);
    let (report, outcome, flash) = run_update(&data, None, true);

    assert_eq!(report.packets, 6);
    assert_eq!(report.retransmissions, 0);
    assert!(matches!(outcome, SessionOutcome::Done { entry: 0x4000, .. }));
    assert_eq!(outcome.report().bytes_written, 1500);
    assert_eq!(flash.read(0x4000, data.len()).unwrap(), data.as_slice());
}

#[test]
fn corrupted_packet_is_retransmitted() {
    // write 0 is the handshake, write 2 is the second packet
    let data = test_image(700);
    let (report, outcome, flash) = run_update(&data, Some(2), true);

    assert_eq!(report.retransmissions, 1);
    assert_eq!(outcome.report().packet_errors, 1);
    assert_eq!(outcome.report().packets_written, 3);
    assert_eq!(flash.read(0x4000, data.len()).unwrap(), data.as_slice());
}

#[test]
fn exact_multiple_image_ends_with_padding_byte() {
    let data = test_image(1024);
    let (report, outcome, flash) = run_update(&data, None, true);

    assert!(report.padded);
    assert_eq!(report.packets, 5);
    assert!(matches!(outcome, SessionOutcome::Done { .. }));
    assert_eq!(flash.read(0x4000, 1024).unwrap(), data.as_slice());
    assert_eq!(flash.read(0x4000 + 1024, 4).unwrap(), &[0xFF; 4]);
}
