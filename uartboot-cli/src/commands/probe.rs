//! Probe command implementation.

use anyhow::{Context, Result};
use console::style;
use log::debug;
use uartboot::{Port, Uploader};

use super::ensure_not_interrupted;
use crate::config::Config;
use crate::{Cli, get_port, glyph, open_port, resolve_baud};

/// Send the handshake until the bootloader acknowledges it.
///
/// A board that answers stays in update mode waiting for packets; reset it
/// (or use `upload --reset`) before uploading.
pub(crate) fn cmd_probe(cli: &Cli, config: &mut Config, attempts: Option<u32>) -> Result<()> {
    let port_name = get_port(cli, config)?;
    let baud = resolve_baud(cli, config);

    let mut upload_config = config.upload_config();
    if let Some(attempts) = attempts {
        upload_config.handshake_attempts = attempts;
    }

    if !cli.quiet {
        eprintln!(
            "{} Probing {port_name} at {baud} baud ({} attempts)",
            style(glyph("🔌", "*")).cyan(),
            upload_config.handshake_attempts
        );
    }

    let mut port =
        open_port(&port_name, baud).with_context(|| format!("Failed to open {port_name}"))?;
    let result = ensure_not_interrupted().and_then(|()| {
        Uploader::with_config(&mut port, upload_config)
            .handshake()
            .with_context(|| format!("No bootloader answered on {port_name}"))
    });
    if let Err(e) = port.close() {
        debug!("Closing {port_name} failed: {e}");
    }
    result?;

    if !cli.quiet {
        eprintln!(
            "{} Bootloader on {port_name} acknowledged the handshake",
            style("✓").green()
        );
    }
    Ok(())
}
