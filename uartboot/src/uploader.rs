//! Host side of the update protocol.
//!
//! The [`Uploader`] opens a session with the handshake, then sends the image
//! one packet at a time and waits for the device's status byte after each:
//!
//! - `0xAA`: written, move on.
//! - `0xFF`: rejected, retransmit the same packet.
//! - `0xFE`: flash programming failed, abort.
//!
//! A missing or unrecognized status is treated like `0xFF`.

use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::protocol::handshake::DEFAULT_TOKEN_TIMEOUT;
use crate::protocol::{Packet, Status, send_handshake};
use log::{debug, info, trace, warn};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Uploader configuration options.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Wait for the status byte after each packet.
    pub ack_timeout: Duration,
    /// Retransmissions per packet before giving up. Zero sends each packet
    /// once.
    pub max_retries: u32,
    /// Handshake attempts before giving up. At least one is always made.
    pub handshake_attempts: u32,
    /// Wait for the handshake ack on each attempt.
    pub handshake_timeout: Duration,
    /// Pad images whose length is a multiple of the packet size.
    pub pad_tail: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(1000),
            max_retries: 10,
            handshake_attempts: 10,
            handshake_timeout: DEFAULT_TOKEN_TIMEOUT,
            pad_tail: true,
        }
    }
}

/// Summary of a finished upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UploadReport {
    /// Packets acknowledged by the device.
    pub packets: usize,
    /// Image bytes sent, including tail padding.
    pub bytes: usize,
    /// Packets sent more than once.
    pub retransmissions: usize,
    /// Whether a padding byte was appended.
    pub padded: bool,
}

/// Upload handler.
pub struct Uploader<'a, P: Read + Write + ?Sized> {
    port: &'a mut P,
    config: UploadConfig,
    retransmissions: usize,
}

impl<'a, P: Read + Write + ?Sized> Uploader<'a, P> {
    /// Create an uploader with default configuration.
    pub fn new(port: &'a mut P) -> Self {
        Self::with_config(port, UploadConfig::default())
    }

    /// Create an uploader with custom configuration.
    pub fn with_config(port: &'a mut P, config: UploadConfig) -> Self {
        Self {
            port,
            config,
            retransmissions: 0,
        }
    }

    /// Current configuration.
    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Wait up to `ack_timeout` for one status byte.
    fn read_status(&mut self) -> Result<Option<u8>> {
        let deadline = Instant::now() + self.config.ack_timeout;
        let mut buf = [0u8; 1];

        loop {
            match self.port.read(&mut buf) {
                Ok(1) => return Ok(Some(buf[0])),
                Ok(_) => {},
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {},
                Err(e) => return Err(Error::Io(e)),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Put the device into update mode.
    pub fn handshake(&mut self) -> Result<()> {
        let attempts = self.config.handshake_attempts.max(1);
        for attempt in 1..=attempts {
            if crate::is_interrupted_requested() {
                return Err(Error::Cancelled);
            }

            debug!("Handshake attempt {attempt}/{attempts}");
            match send_handshake(self.port, self.config.handshake_timeout) {
                Ok(()) => {
                    info!("Device entered update mode");
                    return Ok(());
                },
                Err(Error::Timeout(_)) => {},
                Err(e) => return Err(e),
            }
        }

        Err(Error::HandshakeFailed(format!(
            "no acknowledgement after {attempts} attempts"
        )))
    }

    /// Send one packet until the device acknowledges it.
    pub fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let frame = packet.encode();

        for attempt in 0..=self.config.max_retries {
            if crate::is_interrupted_requested() {
                return Err(Error::Cancelled);
            }
            if attempt > 0 {
                self.retransmissions += 1;
            }

            trace!("Sending packet {} (retry {attempt})", packet.sequence());
            self.port.write_all(&frame)?;
            self.port.flush()?;

            match self.read_status()?.map(Status::from) {
                Some(Status::Ack) => {
                    trace!("Packet {} acknowledged", packet.sequence());
                    return Ok(());
                },
                Some(Status::ProgrammingError) => {
                    return Err(Error::Programming {
                        sequence: packet.sequence(),
                    });
                },
                Some(Status::PacketError) => {
                    debug!("Packet {} rejected, retransmitting", packet.sequence());
                },
                Some(Status::Unknown(b)) => {
                    debug!("Unexpected status 0x{b:02X} for packet {}", packet.sequence());
                },
                None => {
                    debug!("No status for packet {}, retransmitting", packet.sequence());
                },
            }
        }

        Err(Error::Protocol(format!(
            "packet {} not acknowledged after {} retries",
            packet.sequence(),
            self.config.max_retries
        )))
    }

    /// Send every packet of an already handshaken session.
    ///
    /// `progress` receives (bytes acknowledged, total bytes).
    pub fn send_image<F>(&mut self, image: &FirmwareImage, mut progress: F) -> Result<UploadReport>
    where
        F: FnMut(usize, usize),
    {
        let padded_image;
        let image = if image.needs_tail_padding() {
            if self.config.pad_tail {
                padded_image = image.clone().with_tail_padding();
                &padded_image
            } else {
                warn!(
                    "Image length {} is a multiple of the packet size and padding is off; \
                     the device will not see a final packet",
                    image.len()
                );
                image
            }
        } else {
            image
        };

        let total = image.len();
        let mut sent = 0;
        let mut packets = 0;
        self.retransmissions = 0;

        for packet in image.packets() {
            self.send_packet(&packet)?;
            sent += packet.len();
            packets += 1;
            progress(sent, total);
        }

        info!(
            "Upload complete: {packets} packets, {sent} bytes, {} retransmissions",
            self.retransmissions
        );
        Ok(UploadReport {
            packets,
            bytes: sent,
            retransmissions: self.retransmissions,
            padded: image.is_padded(),
        })
    }

    /// Handshake, then send the whole image.
    pub fn upload<F>(&mut self, image: &FirmwareImage, progress: F) -> Result<UploadReport>
    where
        F: FnMut(usize, usize),
    {
        debug!(
            "Starting upload: {} bytes in {} packets",
            image.len(),
            image.packet_count()
        );
        self.handshake()?;
        self.send_image(image, progress)
    }
}
