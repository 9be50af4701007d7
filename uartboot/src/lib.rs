//! # uartboot
//!
//! A UART firmware-update protocol for microcontroller bootloaders, with both
//! ends of the link in one crate.
//!
//! The device side waits for a two-byte handshake, receives checksummed
//! packets of up to 256 bytes, programs each one into flash and finally hands
//! control to the new application:
//!
//! - [`protocol`]: wire constants, checksum, packet framing, handshake
//! - [`session`]: the update sequencer ([`UpdateSession`])
//! - [`flash`]: the flash device trait and the word-programming adapter
//! - [`channel`]: the byte channel trait the core reads from
//!
//! The host side ([`uploader`]) splits a raw image into packets, sends them
//! and retransmits whatever the device rejects.
//!
//! ## Features
//!
//! - `native` (default): serial ports through the `serialport` crate
//! - `serde`: serialization for reports and flash regions
//!
//! ## Example
//!
//! ```rust
//! use uartboot::sim::{MemFlash, SimChannel, SimEvent};
//! use uartboot::{FlashRegion, Packet, SessionConfig, SessionOutcome, UpdateSession};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let region = FlashRegion::new(0, 4096, 512);
//!     let mut wire = vec![0x55, 0x5A];
//!     wire.extend(Packet::new(1, b"hello")?.encode());
//!
//!     let mut session = UpdateSession::new(
//!         SimChannel::new([SimEvent::Bytes(wire)]),
//!         MemFlash::new(region),
//!         SessionConfig::for_region(region),
//!     )?;
//!
//!     let outcome = session.run()?;
//!     assert!(matches!(outcome, SessionOutcome::Done { entry: 0, .. }));
//!     assert_eq!(session.flash().read(0, 5), Some(&b"hello"[..]));
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod channel;
pub mod device;
pub mod error;
pub mod flash;
pub mod host;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod uploader;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    channel::{ByteChannel, PortChannel},
    device::{DetectedPort, DeviceKind},
    error::{ChannelError, Error, FlashError, HandshakeError, PacketError, Result},
    flash::{FlashDevice, FlashRegion},
    host::{auto_detect_port, discover_ports},
    image::FirmwareImage,
    port::{Port, SerialConfig},
    protocol::{CodecTimeouts, HandshakeState, Negotiator, Packet, Status, receive_packet},
    session::{
        FlashCursor, Handoff, SessionConfig, SessionFailure, SessionOutcome, SessionReport,
        SessionState, UpdateSession, bootloader_main,
    },
    uploader::{UploadConfig, UploadReport, Uploader},
};
