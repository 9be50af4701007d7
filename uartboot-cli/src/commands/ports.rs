//! List-ports command implementation.

use console::style;
use uartboot::{DetectedPort, auto_detect_port, discover_ports};

use crate::config::Config;

/// JSON description of one port.
fn port_json(port: &DetectedPort, config: &Config) -> serde_json::Value {
    let configured = match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config
            .port
            .usb_device
            .iter()
            .any(|d| d.matches(vid, pid)),
        _ => false,
    };

    serde_json::json!({
        "name": port.name,
        "device": port.device.name(),
        "known": port.device.is_known() || configured,
        "vid": port.vid,
        "pid": port.pid,
        "manufacturer": port.manufacturer,
        "product": port.product,
        "serial": port.serial,
    })
}

/// List serial ports; `json` prints an array to stdout instead of the styled list.
pub(crate) fn cmd_list_ports(config: &Config, json: bool) {
    let detected = discover_ports();

    if json {
        let ports: Vec<serde_json::Value> =
            detected.iter().map(|p| port_json(p, config)).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).unwrap_or_else(|_| "[]".to_string())
        );
        return;
    }

    eprintln!("{}", style("Serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return;
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };

        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };

        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{device_type}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan(),
        );
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }
}
