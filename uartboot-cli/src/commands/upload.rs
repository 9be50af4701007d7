//! Upload command implementation.

use anyhow::{Context, Result};
use console::style;
use log::{debug, warn};
use std::path::Path;
use std::thread;
use std::time::Duration;
use uartboot::flash::DEFAULT_BASE;
use uartboot::{FirmwareImage, NativePort, Port, UploadConfig, UploadReport, Uploader};

use super::ensure_not_interrupted;
use crate::config::Config;
use crate::{Cli, get_port, glyph, open_port, progress_bar, resolve_baud};

/// How long reset is held low.
const RESET_PULSE: Duration = Duration::from_millis(100);

/// Time for the bootloader to start listening after reset.
const RESET_SETTLE: Duration = Duration::from_millis(50);

/// Arguments of `uartboot upload`.
pub(crate) struct UploadArgs<'a> {
    pub(crate) image: &'a Path,
    pub(crate) no_pad: bool,
    pub(crate) retries: Option<u32>,
    pub(crate) reset: bool,
    pub(crate) base: Option<u32>,
    pub(crate) json: bool,
}

/// Upload command implementation.
pub(crate) fn cmd_upload(cli: &Cli, config: &mut Config, args: &UploadArgs<'_>) -> Result<()> {
    let image = FirmwareImage::from_file(args.image)
        .with_context(|| format!("Failed to load image {}", args.image.display()))?;

    let base = args.base.or(config.device.base).unwrap_or(DEFAULT_BASE);
    if !cli.quiet {
        eprintln!(
            "{} Loaded {} ({} bytes, {} packets) for 0x{base:08X}",
            style(glyph("📦", "*")).cyan(),
            args.image.display(),
            image.len(),
            image.packet_count()
        );
    }
    if let Some(size) = config.device.size {
        if image.len() > size as usize {
            warn!(
                "Image is {} bytes but the device region holds {size}; the bootloader will reject the tail",
                image.len()
            );
        }
    }

    let upload_config = upload_config(config, args);

    let port_name = get_port(cli, config)?;
    let baud = resolve_baud(cli, config);
    if !cli.quiet {
        eprintln!(
            "{} Using port {port_name} at {baud} baud",
            style(glyph("🔌", "*")).cyan()
        );
    }

    let mut port =
        open_port(&port_name, baud).with_context(|| format!("Failed to open {port_name}"))?;
    let result = transfer(cli, &mut port, &image, upload_config, args.reset);
    if let Err(e) = port.close() {
        debug!("Closing {port_name} failed: {e}");
    }
    let report = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    if !cli.quiet {
        eprintln!(
            "{} Uploaded {} bytes in {} packets ({} retransmissions{})",
            style("✓").green(),
            report.bytes,
            report.packets,
            report.retransmissions,
            if report.padded { ", tail padded" } else { "" }
        );
    }

    Ok(())
}

/// File config with the command-line overrides applied.
fn upload_config(config: &Config, args: &UploadArgs<'_>) -> UploadConfig {
    let mut upload_config = config.upload_config();
    if args.no_pad {
        upload_config.pad_tail = false;
    }
    if let Some(retries) = args.retries {
        upload_config.max_retries = retries;
    }
    upload_config
}

fn transfer(
    cli: &Cli,
    port: &mut NativePort,
    image: &FirmwareImage,
    upload_config: UploadConfig,
    reset: bool,
) -> Result<UploadReport> {
    if reset {
        reset_board(port).context("Failed to reset the board")?;
    }
    ensure_not_interrupted()?;

    if !cli.quiet {
        eprintln!("{} Waiting for the bootloader...", style(glyph("⏳", "*")).yellow());
    }
    let mut uploader = Uploader::with_config(port, upload_config);
    uploader
        .handshake()
        .context("Device did not enter update mode")?;
    if !cli.quiet {
        eprintln!("{} Device is in update mode", style("✓").green());
    }

    let pb = progress_bar(cli.quiet);
    let result = uploader.send_image(image, |sent, total| {
        pb.set_position(percent(sent, total));
    });

    match result {
        Ok(report) => {
            pb.finish_with_message("done");
            Ok(report)
        },
        Err(e) => {
            pb.abandon();
            Err(anyhow::Error::new(e).context("Upload failed"))
        },
    }
}

/// Pulse RTS with DTR released, the usual wiring of reset on USB-UART bridges.
fn reset_board(port: &mut NativePort) -> uartboot::Result<()> {
    debug!("Pulsing RTS to reset the board");
    port.set_dtr(false)?;
    port.set_rts(true)?;
    thread::sleep(RESET_PULSE);
    port.set_rts(false)?;
    thread::sleep(RESET_SETTLE);
    port.clear_buffers()
}

fn percent(sent: usize, total: usize) -> u64 {
    if total == 0 {
        return 100;
    }
    u64::try_from(sent.min(total) * 100 / total).unwrap_or(100)
}
