//! uartboot CLI - firmware updates through the uartboot UART bootloader.
//!
//! ## Features
//!
//! - Upload raw firmware images with retransmission and a progress bar
//! - Probe whether a board answers the update handshake
//! - Serve the device side of the protocol on a serial port for bench testing
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uartboot::{NativePort, Port, SerialConfig};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Default baud rate when neither flag, env nor config sets one.
pub(crate) const DEFAULT_BAUD: u32 = 115_200;

/// Read timeout of an opened port; the protocol layers apply their own budgets on top.
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// `emoji` when fancy output is on, `plain` otherwise.
pub(crate) fn glyph(emoji: &'static str, plain: &'static str) -> &'static str {
    if use_fancy_output() { emoji } else { plain }
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// CLI-level failure classes. Each maps to a process exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or an ambiguous choice the user must resolve (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Unreadable or inconsistent configuration (exit 3).
    #[error("{0}")]
    Config(String),
    /// Flash programming failed (exit 5).
    #[error("{0}")]
    Programming(String),
    /// Interrupted by the user (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::Programming(_) => 5,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Exit code for a library error.
fn library_exit_code(err: &uartboot::Error) -> Option<u8> {
    use uartboot::Error;

    match err {
        Error::Config(_) => Some(3),
        Error::DeviceNotFound | Error::HandshakeFailed(_) | Error::Timeout(_) => Some(4),
        Error::Serial(e) => match e.kind() {
            serialport::ErrorKind::NoDevice
            | serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => Some(4),
            _ => None,
        },
        Error::Programming { .. } | Error::Flash(_) => Some(5),
        Error::Cancelled => Some(130),
        _ => None,
    }
}

/// Map an error chain to the documented exit codes, falling back to 1.
pub(crate) fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return cli_err.exit_code();
        }
        if let Some(code) = cause
            .downcast_ref::<uartboot::Error>()
            .and_then(library_exit_code)
        {
            return code;
        }
    }
    1
}

/// uartboot - firmware updates over a UART bootloader.
///
/// Environment variables:
///   UARTBOOT_PORT              - Default serial port
///   UARTBOOT_BAUD              - Default baud rate (default: 115200)
///   UARTBOOT_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "uartboot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use.
    #[arg(short, long, global = true, env = "UARTBOOT_PORT")]
    port: Option<String>,

    /// Baud rate (default: 115200).
    #[arg(short, long, global = true, env = "UARTBOOT_BAUD")]
    baud: Option<u32>,

    /// Verbose output (-v, -vv, -vvv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Never prompt; fail when a choice is ambiguous.
    #[arg(long, global = true, env = "UARTBOOT_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a config file layered over the discovered ones.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a raw firmware image to a board waiting in the bootloader.
    Upload {
        /// Path to the raw binary image.
        image: PathBuf,

        /// Do not append a padding byte to images that are a multiple of 256 bytes.
        #[arg(long)]
        no_pad: bool,

        /// Retransmissions allowed per packet (0 sends each packet once).
        #[arg(long)]
        retries: Option<u32>,

        /// Pulse DTR/RTS before the handshake to reset the board.
        #[arg(long)]
        reset: bool,

        /// Flash address the bootloader programs from (informational).
        #[arg(long, value_parser = parse_hex_u32)]
        base: Option<u32>,

        /// Print the upload report as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Check whether a board answers the update handshake.
    Probe {
        /// Handshake attempts before giving up.
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        attempts: Option<u32>,
    },

    /// Run the device side of the protocol on a serial port.
    Serve {
        /// Write the programmed image here once the update completes.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Region base address.
        #[arg(long, value_parser = parse_hex_u32)]
        base: Option<u32>,

        /// Region size in bytes (hex).
        #[arg(long, value_parser = parse_hex_u32)]
        size: Option<u32>,

        /// Erase page size in bytes (hex).
        #[arg(long, value_parser = parse_hex_u32)]
        page_size: Option<u32>,

        /// Application entry point (defaults to the region base).
        #[arg(long, value_parser = parse_hex_u32)]
        entry: Option<u32>,

        /// Fail the session after this many consecutive bad packets (idle time is not counted).
        #[arg(long)]
        max_packet_errors: Option<u32>,

        /// Print the session report as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install completions into the shell's completion directory.
        #[arg(long)]
        install: bool,
    },
}

/// Parse a hexadecimal address such as `0x4000`, `4000` or `0x00_40_00`.
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "uartboot v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        warn!("Could not install Ctrl-C handler: {e}");
    }
    uartboot::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = match &cli.config_path {
        Some(path) => Config::load_with_override(path)?,
        None => Config::load(),
    };

    match &cli.command {
        Commands::Upload {
            image,
            no_pad,
            retries,
            reset,
            base,
            json,
        } => commands::upload::cmd_upload(
            cli,
            &mut config,
            &commands::upload::UploadArgs {
                image,
                no_pad: *no_pad,
                retries: *retries,
                reset: *reset,
                base: *base,
                json: *json,
            },
        ),
        Commands::Probe { attempts } => commands::probe::cmd_probe(cli, &mut config, *attempts),
        Commands::Serve {
            output,
            base,
            size,
            page_size,
            entry,
            max_packet_errors,
            json,
        } => {
            if let Some(value) = base {
                config.device.base = Some(*value);
            }
            if let Some(value) = size {
                config.device.size = Some(*value);
            }
            if let Some(value) = page_size {
                config.device.page_size = Some(*value);
            }
            if let Some(value) = entry {
                config.device.entry = Some(*value);
            }
            commands::serve::cmd_serve(
                cli,
                &mut config,
                output.as_deref(),
                *max_packet_errors,
                *json,
            )
        },
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(&config, *json);
            Ok(())
        },
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell, e.g. `uartboot completions bash`, \
                         or use --install"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Get serial port from CLI args, config, or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive && cli.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

/// Effective baud rate: flag or env, then config, then the default.
pub(crate) fn resolve_baud(cli: &Cli, config: &Config) -> u32 {
    cli.baud.or(config.port.baud).unwrap_or(DEFAULT_BAUD)
}

/// Open a port with the default 8N1 settings.
pub(crate) fn open_port(name: &str, baud: u32) -> Result<NativePort> {
    let serial = SerialConfig::new(name, baud).with_timeout(PORT_READ_TIMEOUT);
    let mut port = NativePort::open(&serial)?;
    port.clear_buffers()?;
    Ok(port)
}

/// Percentage progress bar on stderr, hidden when quiet or not a terminal.
pub(crate) fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_upload() {
        let cli = Cli::try_parse_from(["uartboot", "upload", "app.bin"]).unwrap();
        match cli.command {
            Commands::Upload {
                image,
                no_pad,
                retries,
                reset,
                base,
                json,
            } => {
                assert_eq!(image, PathBuf::from("app.bin"));
                assert!(!no_pad);
                assert!(retries.is_none());
                assert!(!reset);
                assert!(base.is_none());
                assert!(!json);
            },
            _ => panic!("Expected Upload command"),
        }
    }

    #[test]
    fn test_cli_parse_upload_with_all_options() {
        let cli = Cli::try_parse_from([
            "uartboot",
            "-p",
            "/dev/ttyACM0",
            "-b",
            "57600",
            "upload",
            "app.bin",
            "--no-pad",
            "--retries",
            "3",
            "--reset",
            "--base",
            "0x4000",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(cli.baud, Some(57600));
        match cli.command {
            Commands::Upload {
                no_pad,
                retries,
                reset,
                base,
                json,
                ..
            } => {
                assert!(no_pad);
                assert_eq!(retries, Some(3));
                assert!(reset);
                assert_eq!(base, Some(0x4000));
                assert!(json);
            },
            _ => panic!("Expected Upload command"),
        }
    }

    #[test]
    fn test_glyph_plain_without_tty() {
        STDERR_IS_TTY.store(false, Ordering::Relaxed);
        assert_eq!(glyph("📦", "*"), "*");
        assert!(progress_bar(false).is_hidden());
    }

    #[test]
    fn test_cli_parse_probe() {
        let cli = Cli::try_parse_from(["uartboot", "probe", "--attempts", "2"]).unwrap();
        assert!(matches!(cli.command, Commands::Probe { attempts: Some(2) }));
    }

    #[test]
    fn test_cli_probe_rejects_zero_attempts() {
        let err = Cli::try_parse_from(["uartboot", "probe", "--attempts", "0"])
            .err()
            .unwrap();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_upload_accepts_zero_retries() {
        let cli = Cli::try_parse_from(["uartboot", "upload", "app.bin", "--retries", "0"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Upload {
                retries: Some(0),
                ..
            }
        ));
    }

    #[test]
    fn test_cli_parse_serve() {
        let cli = Cli::try_parse_from([
            "uartboot",
            "serve",
            "--output",
            "out.bin",
            "--base",
            "0x2000",
            "--size",
            "0x10000",
            "--page-size",
            "0x800",
            "--max-packet-errors",
            "8",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve {
                output,
                base,
                size,
                page_size,
                entry,
                max_packet_errors,
                json,
            } => {
                assert_eq!(output, Some(PathBuf::from("out.bin")));
                assert_eq!(base, Some(0x2000));
                assert_eq!(size, Some(0x10000));
                assert_eq!(page_size, Some(0x800));
                assert!(entry.is_none());
                assert_eq!(max_packet_errors, Some(8));
                assert!(!json);
            },
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_list_ports_json() {
        let cli = Cli::try_parse_from(["uartboot", "list-ports", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::ListPorts { json: true }));
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["uartboot", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions {
                shell: Some(Shell::Zsh),
                install: false
            }
        ));
    }

    #[test]
    fn test_cli_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "uartboot",
            "probe",
            "-vv",
            "-q",
            "--non-interactive",
            "--config",
            "board.toml",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.quiet);
        assert!(cli.non_interactive);
        assert_eq!(cli.config_path, Some(PathBuf::from("board.toml")));
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["uartboot"]).is_err());
    }

    #[test]
    fn test_cli_upload_requires_image() {
        assert!(Cli::try_parse_from(["uartboot", "upload"]).is_err());
    }

    #[test]
    fn test_resolve_baud_precedence() {
        let mut config = Config::default();
        let cli = Cli::try_parse_from(["uartboot", "probe"]).unwrap();
        if cli.baud.is_none() {
            assert_eq!(resolve_baud(&cli, &config), DEFAULT_BAUD);
            config.port.baud = Some(9600);
            assert_eq!(resolve_baud(&cli, &config), 9600);
        }

        let cli = Cli::try_parse_from(["uartboot", "-b", "230400", "probe"]).unwrap();
        assert_eq!(resolve_baud(&cli, &config), 230_400);
    }

    #[test]
    fn test_parse_hex_u32_with_prefix() {
        assert_eq!(parse_hex_u32("0x4000"), Ok(0x4000));
        assert_eq!(parse_hex_u32("0X4000"), Ok(0x4000));
    }

    #[test]
    fn test_parse_hex_u32_without_prefix() {
        assert_eq!(parse_hex_u32("80000"), Ok(0x80000));
    }

    #[test]
    fn test_parse_hex_u32_with_underscores_and_whitespace() {
        assert_eq!(parse_hex_u32("0x00_00_40_00"), Ok(0x4000));
        assert_eq!(parse_hex_u32("  0x200  "), Ok(0x200));
    }

    #[test]
    fn test_parse_hex_u32_invalid() {
        assert!(parse_hex_u32("0xZZ").is_err());
        assert!(parse_hex_u32("0x1_0000_0000").is_err());
    }

    #[test]
    fn test_exit_codes_for_cli_errors() {
        let cases = [
            (CliError::Usage(String::new()), 2),
            (CliError::Config(String::new()), 3),
            (CliError::Programming(String::new()), 5),
            (CliError::Cancelled(String::new()), 130),
        ];
        for (err, code) in cases {
            assert_eq!(exit_code_for(&err.into()), code);
        }
    }

    #[test]
    fn test_exit_codes_for_library_errors() {
        use uartboot::Error;

        let code = |e: Error| exit_code_for(&anyhow::Error::from(e));
        assert_eq!(code(Error::DeviceNotFound), 4);
        assert_eq!(code(Error::HandshakeFailed("silent".into())), 4);
        assert_eq!(code(Error::Timeout("ack".into())), 4);
        assert_eq!(code(Error::Programming { sequence: 3 }), 5);
        assert_eq!(code(Error::Cancelled), 130);
        assert_eq!(code(Error::Config("page size".into())), 3);
        assert_eq!(code(Error::Protocol("retries".into())), 1);
        assert_eq!(code(Error::InvalidImage("empty".into())), 1);
    }

    #[test]
    fn test_exit_code_sees_through_context() {
        let err = anyhow::Error::from(uartboot::Error::Programming { sequence: 1 })
            .context("Upload failed");
        assert_eq!(exit_code_for(&err), 5);

        let err = anyhow::anyhow!("plain failure");
        assert_eq!(exit_code_for(&err), 1);
    }
}
