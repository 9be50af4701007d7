//! Configuration file support for uartboot.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (UARTBOOT_*)
//! 3. File given with `--config`
//! 4. Local config file (./uartboot.toml)
//! 5. Global config file (~/.config/uartboot/config.toml)
//!
//! ```toml
//! [port]
//! serial = "/dev/ttyACM0"
//! baud = 115200
//!
//! [upload]
//! retries = 10
//! ack_timeout_ms = 1000
//!
//! [device]
//! base = 0x0
//! size = 0x80000
//! page_size = 512
//! ```

use crate::CliError;
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uartboot::flash::{DEFAULT_BASE, DEFAULT_PAGE_SIZE, DEFAULT_SIZE};
use uartboot::{FlashRegion, UploadConfig};

/// Name of the local config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "uartboot.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// `[port]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
    /// Extra USB bridges treated as known during port selection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// `[upload]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadSection {
    /// Retransmissions allowed per packet (0 sends each packet once).
    pub retries: Option<u32>,
    /// How long to wait for a status byte, in milliseconds.
    pub ack_timeout_ms: Option<u64>,
    /// Handshake attempts before giving up. 0 is treated as 1.
    pub handshake_attempts: Option<u32>,
    /// Pad images whose length is a multiple of the packet size.
    pub pad_tail: Option<bool>,
}

/// `[device]` section: geometry of the simulated target used by `serve`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSection {
    /// First address of the application region.
    pub base: Option<u32>,
    /// Size of the application region in bytes.
    pub size: Option<u32>,
    /// Erase page size in bytes.
    pub page_size: Option<u32>,
    /// Entry point handed to the application jump.
    pub entry: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Uploader tuning.
    #[serde(default)]
    pub upload: UploadSection,
    /// Target flash geometry.
    #[serde(default)]
    pub device: DeviceSection,
}

impl Config {
    /// Load configuration from the global and local config files.
    ///
    /// Files that cannot be read or parsed are reported and skipped.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load the usual sources, then layer an explicitly requested file on top.
    ///
    /// Unlike the discovered files, an explicit file must exist and parse.
    pub fn load_with_override(path: &Path) -> anyhow::Result<Self> {
        let mut config = Self::load();
        config.merge(Self::load_from_path(path)?);
        Ok(config)
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Cannot read config file {}: {e}", path.display()))
        })?;
        let config = toml::from_str(&content).map_err(|e| {
            CliError::Config(format!("Invalid config file {}: {e}", path.display()))
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a discovered file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "uartboot").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Values set in `other` win.
    fn merge(&mut self, other: Self) {
        if other.port.serial.is_some() {
            self.port.serial = other.port.serial;
        }
        if other.port.baud.is_some() {
            self.port.baud = other.port.baud;
        }
        for device in other.port.usb_device {
            if !self.port.usb_device.contains(&device) {
                self.port.usb_device.push(device);
            }
        }

        let upload = other.upload;
        self.upload.retries = upload.retries.or(self.upload.retries);
        self.upload.ack_timeout_ms = upload.ack_timeout_ms.or(self.upload.ack_timeout_ms);
        self.upload.handshake_attempts = upload
            .handshake_attempts
            .or(self.upload.handshake_attempts);
        self.upload.pad_tail = upload.pad_tail.or(self.upload.pad_tail);

        let device = other.device;
        self.device.base = device.base.or(self.device.base);
        self.device.size = device.size.or(self.device.size);
        self.device.page_size = device.page_size.or(self.device.page_size);
        self.device.entry = device.entry.or(self.device.entry);
    }

    /// Uploader settings with file values applied over the defaults.
    pub fn upload_config(&self) -> UploadConfig {
        let mut config = UploadConfig::default();
        if let Some(retries) = self.upload.retries {
            config.max_retries = retries;
        }
        if let Some(ms) = self.upload.ack_timeout_ms {
            config.ack_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = self.upload.handshake_attempts {
            config.handshake_attempts = attempts;
        }
        if let Some(pad) = self.upload.pad_tail {
            config.pad_tail = pad;
        }
        config
    }

    /// Flash region described by `[device]`, defaults filled in.
    pub fn region(&self) -> anyhow::Result<FlashRegion> {
        let region = FlashRegion::new(
            self.device.base.unwrap_or(DEFAULT_BASE),
            self.device.size.unwrap_or(DEFAULT_SIZE),
            self.device.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        );
        region
            .validate()
            .map_err(|e| CliError::Config(e.to_string()))?;
        Ok(region)
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };
        if self.port.usb_device.contains(&device) {
            return Ok(());
        }

        let path = if Path::new(LOCAL_CONFIG_FILE).exists() {
            PathBuf::from(LOCAL_CONFIG_FILE)
        } else if let Some(global_path) = Self::global_config_path() {
            if let Some(dir) = global_path.parent() {
                fs::create_dir_all(dir)?;
            }
            global_path
        } else {
            PathBuf::from(LOCAL_CONFIG_FILE)
        };

        // Rewrite only the file being extended so values from other sources
        // are not copied into it.
        let mut on_disk = Self::load_from_file(&path).unwrap_or_default();
        on_disk.port.usb_device.push(device.clone());
        fs::write(&path, toml::to_string_pretty(&on_disk)?)?;

        self.port.usb_device.push(device);
        info!("Saved USB device to {}", path.display());
        Ok(())
    }
}
