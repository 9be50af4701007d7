//! Update sequencer: the bootloader's top-level state machine.
//!
//! ```text
//!  WaitHandshake --granted--> Receiving --valid packet--> Programming
//!                               ^   |                        |   |
//!                               |   +--packet error (0xFF)   |   +--flash error (0xFE)--> Failed
//!                               |                            |
//!                               +-------full packet (0xAA)---+
//!                                                            |
//!                                   short packet (0xAA) ---> Done
//! ```
//!
//! The session owns the byte channel, the flash device and the
//! [`FlashCursor`]. Each [`UpdateSession::step`] performs one transition, so
//! tests and host tools can drive the machine a state at a time;
//! [`UpdateSession::run`] loops until a terminal state.

use crate::channel::ByteChannel;
use crate::error::{ChannelError, Error, FlashError, HandshakeError, PacketError, Result};
use crate::flash::{FlashDevice, FlashRegion, WORD_SIZE, erase_range, program_bytes};
use crate::protocol::handshake::DEFAULT_TOKEN_TIMEOUT;
use crate::protocol::{
    CodecTimeouts, Negotiator, PACKET_ACK, PACKET_ERROR, PROGRAMMING_ERROR, Packet,
    receive_packet,
};
use log::{debug, error, info, trace, warn};
use std::fmt;
use std::time::Duration;

/// Sequencer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the host handshake.
    WaitHandshake,
    /// Waiting for the next packet.
    Receiving,
    /// Writing a received packet to flash.
    Programming,
    /// Final packet written; ready to start the application.
    Done,
    /// Flash programming failed; the session is over.
    Failed,
}

impl SessionState {
    /// Whether the session has finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WaitHandshake => "wait-handshake",
            Self::Receiving => "receiving",
            Self::Programming => "programming",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Next flash address to write. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlashCursor {
    address: u32,
}

impl FlashCursor {
    /// Cursor positioned at `base`.
    pub fn new(base: u32) -> Self {
        Self { address: base }
    }

    /// Current address.
    pub fn address(self) -> u32 {
        self.address
    }

    fn advance(&mut self, len: usize) {
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_PAYLOAD
        let len = len as u32;
        self.address = self.address.saturating_add(len);
    }
}

/// Session parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Where the image goes.
    pub region: FlashRegion,
    /// Application entry handed to [`Handoff::jump_to_application`].
    pub entry: u32,
    /// Packet receive budgets.
    pub codec: CodecTimeouts,
    /// Wait per handshake token.
    pub handshake_timeout: Duration,
    /// Erase each page the first time the image reaches it.
    pub erase_before_write: bool,
    /// Consecutive packet errors tolerated before giving up.
    /// `None` keeps answering `0xFF` forever. An idle line
    /// ([`PacketError::NoFraming`]) is not counted.
    pub max_packet_errors: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::for_region(FlashRegion::default())
    }
}

impl SessionConfig {
    /// Defaults for `region`, with the entry at its base.
    pub fn for_region(region: FlashRegion) -> Self {
        Self {
            region,
            entry: region.base,
            codec: CodecTimeouts::default(),
            handshake_timeout: DEFAULT_TOKEN_TIMEOUT,
            erase_before_write: true,
            max_packet_errors: None,
        }
    }

    /// Check region geometry and entry point.
    pub fn validate(&self) -> Result<()> {
        self.region.validate()?;
        if self.entry < self.region.base || self.entry >= self.region.end() {
            return Err(Error::Config(format!(
                "entry {:#010x} outside flash region {:#010x}..{:#010x}",
                self.entry,
                self.region.base,
                self.region.end()
            )));
        }
        if self.max_packet_errors == Some(0) {
            return Err(Error::Config(
                "max_packet_errors must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters collected over a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionReport {
    /// Packets written to flash.
    pub packets_written: u32,
    /// Payload bytes written to flash.
    pub bytes_written: u32,
    /// Packets answered with the packet-error code.
    pub packet_errors: u32,
    /// Cursor address when the session ended.
    pub final_cursor: u32,
}

/// Why a session ended in [`SessionState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionFailure {
    /// The flash device rejected the write.
    #[error("flash programming failed: {0}")]
    Flash(#[from] FlashError),

    /// Too many consecutive bad packets.
    #[error("gave up after {0} consecutive packet errors")]
    PacketErrors(u32),
}

/// How a finished session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Image complete; start the application at `entry`.
    Done {
        /// Application entry point.
        entry: u32,
        /// Session counters.
        report: SessionReport,
    },
    /// Programming failed; the device must not run the partial image.
    Failed {
        /// What went wrong.
        cause: SessionFailure,
        /// Session counters.
        report: SessionReport,
    },
}

impl SessionOutcome {
    /// Session counters.
    pub fn report(&self) -> &SessionReport {
        match self {
            Self::Done { report, .. } | Self::Failed { report, .. } => report,
        }
    }
}

/// Transfer of control out of the bootloader.
pub trait Handoff {
    /// Start the application at `entry`. Never returns.
    fn jump_to_application(&mut self, entry: u32) -> !;

    /// Stop after a failed update. Never returns.
    fn halt(&mut self) -> !;
}

/// One bootloader update session.
pub struct UpdateSession<C: ByteChannel, F: FlashDevice> {
    channel: C,
    flash: F,
    config: SessionConfig,
    negotiator: Negotiator,
    state: SessionState,
    cursor: FlashCursor,
    erased_until: u32,
    pending: Option<Packet>,
    expected_sequence: Option<u16>,
    consecutive_errors: u32,
    report: SessionReport,
    failure: Option<SessionFailure>,
}

impl<C: ByteChannel, F: FlashDevice> UpdateSession<C, F> {
    /// Create a session waiting for the handshake.
    pub fn new(channel: C, flash: F, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        if flash.page_size() != config.region.page_size {
            return Err(Error::Config(format!(
                "flash page size {} does not match region page size {}",
                flash.page_size(),
                config.region.page_size
            )));
        }

        let base = config.region.base;
        Ok(Self {
            channel,
            flash,
            negotiator: Negotiator::new(config.handshake_timeout),
            config,
            state: SessionState::WaitHandshake,
            cursor: FlashCursor::new(base),
            erased_until: base,
            pending: None,
            expected_sequence: None,
            consecutive_errors: 0,
            report: SessionReport {
                final_cursor: base,
                ..SessionReport::default()
            },
            failure: None,
        })
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current flash cursor.
    pub fn cursor(&self) -> FlashCursor {
        self.cursor
    }

    /// Counters so far.
    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    /// Session parameters.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The flash device.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// The byte channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Release the channel and flash device.
    pub fn into_parts(self) -> (C, F) {
        (self.channel, self.flash)
    }

    /// Perform one state transition and return the new state.
    ///
    /// Terminal states are sticky. Errors are returned only for failures the
    /// protocol cannot answer: a broken channel or a cancellation request.
    pub fn step(&mut self) -> Result<SessionState> {
        match self.state {
            SessionState::WaitHandshake => self.wait_handshake()?,
            SessionState::Receiving => self.receive()?,
            SessionState::Programming => self.program()?,
            SessionState::Done | SessionState::Failed => {},
        }
        Ok(self.state)
    }

    /// Drive the session to completion.
    pub fn run(&mut self) -> Result<SessionOutcome> {
        info!(
            "Bootloader session started, image base {:#010x}",
            self.config.region.base
        );
        loop {
            if self.step()?.is_terminal() {
                break;
            }
        }

        Ok(self.outcome())
    }

    /// Outcome of a finished session, as returned by [`run`](Self::run).
    ///
    /// Only meaningful once [`state`](Self::state) is terminal.
    pub fn outcome(&self) -> SessionOutcome {
        match self.failure {
            Some(cause) => SessionOutcome::Failed {
                cause,
                report: self.report,
            },
            None => SessionOutcome::Done {
                entry: self.config.entry,
                report: self.report,
            },
        }
    }

    /// Hand control on: the application after [`SessionState::Done`],
    /// [`Handoff::halt`] otherwise.
    pub fn launch<H: Handoff + ?Sized>(self, handoff: &mut H) -> ! {
        if self.state == SessionState::Done {
            info!("Starting application at {:#010x}", self.config.entry);
            handoff.jump_to_application(self.config.entry)
        }
        error!("Update not completed ({}), halting", self.state);
        handoff.halt()
    }

    fn wait_handshake(&mut self) -> Result<()> {
        if crate::is_interrupted_requested() {
            return Err(Error::Cancelled);
        }

        match self.negotiator.attempt(&mut self.channel) {
            Ok(()) => {
                info!("Handshake complete, receiving image");
                self.state = SessionState::Receiving;
            },
            Err(HandshakeError::Link(kind)) => return Err(Error::Link(kind)),
            Err(e) => trace!("handshake attempt failed: {e}"),
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<()> {
        if crate::is_interrupted_requested() {
            return Err(Error::Cancelled);
        }

        match receive_packet(&mut self.channel, &self.config.codec) {
            Ok(packet) if packet.is_empty() => {
                debug!("packet {} has no payload", packet.sequence());
                self.reject(PacketError::Incomplete)
            },
            Ok(packet) => {
                self.check_sequence(packet.sequence());
                debug!(
                    "packet {}: {} bytes for {:#010x}",
                    packet.sequence(),
                    packet.len(),
                    self.cursor.address()
                );
                self.pending = Some(packet);
                self.state = SessionState::Programming;
                Ok(())
            },
            Err(PacketError::Link(kind)) => Err(Error::Link(kind)),
            Err(e) => self.reject(e),
        }
    }

    fn reject(&mut self, reason: PacketError) -> Result<()> {
        self.report.packet_errors += 1;
        let idle = matches!(reason, PacketError::NoFraming);
        if !idle {
            self.consecutive_errors += 1;
        }

        if let (false, Some(limit)) = (idle, self.config.max_packet_errors) {
            if self.consecutive_errors >= limit {
                error!("{} consecutive packet errors, giving up", self.consecutive_errors);
                self.fail(SessionFailure::PacketErrors(self.consecutive_errors));
                return self.send_status(PROGRAMMING_ERROR);
            }
        }

        if idle {
            trace!("no packet: {reason}");
        } else {
            warn!("Rejecting packet: {reason}");
        }
        self.send_status(PACKET_ERROR)
    }

    fn check_sequence(&mut self, sequence: u16) {
        if let Some(expected) = self.expected_sequence {
            if sequence != expected {
                warn!("Packet sequence {sequence}, expected {expected}");
            }
        }
    }

    fn program(&mut self) -> Result<()> {
        let Some(packet) = self.pending.take() else {
            self.state = SessionState::Receiving;
            return Ok(());
        };

        let address = self.cursor.address();
        match self.write_payload(address, packet.payload()) {
            Ok(()) => {
                self.cursor.advance(packet.len());
                self.consecutive_errors = 0;
                self.expected_sequence = Some(packet.sequence().wrapping_add(1));
                self.report.packets_written += 1;
                #[allow(clippy::cast_possible_truncation)] // bounded by MAX_PAYLOAD
                let written = packet.len() as u32;
                self.report.bytes_written += written;
                self.report.final_cursor = self.cursor.address();

                self.send_status(PACKET_ACK)?;
                if packet.is_final() {
                    info!(
                        "Image complete: {} packets, {} bytes",
                        self.report.packets_written, self.report.bytes_written
                    );
                    self.state = SessionState::Done;
                } else {
                    self.state = SessionState::Receiving;
                }
            },
            Err(e) => {
                error!(
                    "Programming packet {} at {address:#010x} failed: {e}",
                    packet.sequence()
                );
                self.fail(SessionFailure::Flash(e));
                self.send_status(PROGRAMMING_ERROR)?;
            },
        }
        Ok(())
    }

    fn write_payload(&mut self, address: u32, payload: &[u8]) -> std::result::Result<(), FlashError> {
        let region = self.config.region;
        region.check(address, payload.len())?;

        if self.config.erase_before_write {
            #[allow(clippy::cast_possible_truncation)] // checked against the region above
            let end = address + (payload.len().div_ceil(WORD_SIZE) * WORD_SIZE) as u32;
            if end > self.erased_until {
                let start = self.erased_until.max(region.page_floor(address));
                self.erased_until = erase_range(&mut self.flash, &region, start, end)?;
            }
        }

        program_bytes(&mut self.flash, address, payload)
    }

    fn fail(&mut self, cause: SessionFailure) {
        self.failure = Some(cause);
        self.state = SessionState::Failed;
    }

    fn send_status(&mut self, status: u8) -> Result<()> {
        trace!("status {status:#04x}");
        self.channel.write_byte(status).map_err(|e| match e {
            ChannelError::Timeout => Error::Timeout("status byte write".to_string()),
            ChannelError::Io(kind) => Error::Link(kind),
        })
    }
}

/// Bootloader entry: run one session, then start the application or halt.
///
/// Never returns. A configuration error or broken channel halts the device.
pub fn bootloader_main<C, F, H>(channel: C, flash: F, handoff: &mut H, config: SessionConfig) -> !
where
    C: ByteChannel,
    F: FlashDevice,
    H: Handoff + ?Sized,
{
    let mut session = match UpdateSession::new(channel, flash, config) {
        Ok(session) => session,
        Err(e) => {
            error!("Invalid bootloader configuration: {e}");
            handoff.halt()
        },
    };

    match session.run() {
        Ok(SessionOutcome::Failed { cause, .. }) => error!("Update failed: {cause}"),
        Ok(SessionOutcome::Done { .. }) => {},
        Err(e) => error!("Session aborted: {e}"),
    }
    session.launch(handoff)
}
