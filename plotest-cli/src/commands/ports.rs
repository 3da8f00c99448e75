//! `list-ports`: serial ports a physical target could be attached to.

use anyhow::Result;
use console::style;
use log::warn;
use plotest::PortInfo;

fn discover() -> Vec<PortInfo> {
    #[cfg(feature = "native")]
    {
        plotest::host::discover_ports().unwrap_or_else(|e| {
            warn!("Failed to enumerate serial ports: {e}");
            Vec::new()
        })
    }
    #[cfg(not(feature = "native"))]
    {
        warn!("Built without serial port support");
        Vec::new()
    }
}

fn to_json(ports: &[PortInfo]) -> serde_json::Value {
    ports
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.name,
                "vid": p.vid,
                "pid": p.pid,
                "manufacturer": p.manufacturer,
                "product": p.product,
                "serial": p.serial_number,
            })
        })
        .collect()
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = discover();

    if json {
        println!("{}", serde_json::to_string_pretty(&to_json(&ports))?);
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("none found").dim());
    }
    for port in &ports {
        let vid_pid = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();
        eprintln!(
            "  {} {}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan()
        );
    }
    Ok(())
}
