//! Serve command implementation.
//!
//! Runs the device half of the protocol on a host serial port against an
//! in-memory flash, so an uploader (this tool on another port, or a vendor
//! tool) can be exercised without a board. On success the programmed bytes
//! are written to `--output`.

use anyhow::{Context, Result};
use console::style;
use log::debug;
use std::fs;
use std::path::Path;
use uartboot::sim::MemFlash;
use uartboot::{
    FlashRegion, Port, PortChannel, SessionConfig, SessionOutcome, SessionReport, UpdateSession,
};

use crate::config::Config;
use crate::{Cli, CliError, get_port, glyph, open_port, resolve_baud};

/// Session settings from `[device]`, the command-line values already merged in.
fn session_config(config: &Config, max_packet_errors: Option<u32>) -> Result<SessionConfig> {
    let region = config.region()?;
    let mut session = SessionConfig::for_region(region);
    if let Some(entry) = config.device.entry {
        session.entry = entry;
    }
    session.max_packet_errors = max_packet_errors;
    session.validate()?;
    Ok(session)
}

/// The bytes a finished session programmed, starting at the region base.
fn programmed_image<'a>(
    flash: &'a MemFlash,
    region: FlashRegion,
    report: &SessionReport,
) -> Result<&'a [u8]> {
    flash
        .read(region.base, report.bytes_written as usize)
        .context("Programmed range lies outside the flash region")
}

/// Serve command implementation.
pub(crate) fn cmd_serve(
    cli: &Cli,
    config: &mut Config,
    output: Option<&Path>,
    max_packet_errors: Option<u32>,
    json: bool,
) -> Result<()> {
    let session_config = session_config(config, max_packet_errors)?;
    let region = session_config.region;

    let port_name = get_port(cli, config)?;
    let baud = resolve_baud(cli, config);
    let port =
        open_port(&port_name, baud).with_context(|| format!("Failed to open {port_name}"))?;

    if !cli.quiet {
        eprintln!(
            "{} Serving bootloader on {port_name} at {baud} baud: region 0x{:08X}..0x{:08X}, {} byte pages",
            style(glyph("🔌", "*")).cyan(),
            region.base,
            region.end(),
            region.page_size
        );
        eprintln!(
            "{} Waiting for handshake (Ctrl-C to stop)...",
            style(glyph("⏳", "*")).yellow()
        );
    }

    let mut session = UpdateSession::new(
        PortChannel::new(port),
        MemFlash::new(region),
        session_config,
    )?;
    let result = session.run();
    let (channel, flash) = session.into_parts();
    let mut port = channel.into_port();
    if let Err(e) = port.close() {
        debug!("Closing {port_name} failed: {e}");
    }

    let outcome = result.context("Bootloader session aborted")?;
    if json {
        println!("{}", serde_json::to_string_pretty(outcome.report())?);
    }

    match outcome {
        SessionOutcome::Done { entry, report } => {
            if let Some(path) = output {
                let image = programmed_image(&flash, region, &report)?;
                fs::write(path, image)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                if !cli.quiet {
                    eprintln!(
                        "{} Wrote {} bytes to {}",
                        style(glyph("💾", "*")).cyan(),
                        image.len(),
                        path.display()
                    );
                }
            }
            if !cli.quiet {
                eprintln!(
                    "{} Update complete: {} packets, {} bytes, {} packet errors; entry 0x{entry:08X}",
                    style("✓").green(),
                    report.packets_written,
                    report.bytes_written,
                    report.packet_errors
                );
            }
            Ok(())
        },
        SessionOutcome::Failed { cause, report } => Err(CliError::Programming(format!(
            "Update failed after {} packets at 0x{:08X}: {cause}",
            report.packets_written, report.final_cursor
        ))
        .into()),
    }
}
