//! Interactive console port selection for physical targets.
//!
//! - A single detected port is used directly
//! - Several ports are offered in a dialoguer menu
//! - Non-interactive mode never prompts and needs exactly one port

use {
    crate::CliError,
    anyhow::Result,
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::info,
    plotest::PortInfo,
    std::{cmp::Ordering, io::IsTerminal},
};

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Pick the console port of a physical target among the host's ports.
pub fn select_serial_port(non_interactive: bool) -> Result<String> {
    let ports = plotest::host::discover_ports()?;
    if non_interactive {
        return select_non_interactive_port(ports);
    }

    match ports
        .len()
        .cmp(&1)
    {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(ports)
        },
        Ordering::Equal => pick_only(ports),
        Ordering::Less => Err(usage_err("no serial ports found; pass --port")),
    }
}

fn select_non_interactive_port(ports: Vec<PortInfo>) -> Result<String> {
    match ports
        .len()
        .cmp(&1)
    {
        Ordering::Equal => pick_only(ports),
        Ordering::Greater => Err(usage_err(
            "several serial ports found; pass --port in non-interactive mode",
        )),
        Ordering::Less => Err(usage_err("no serial ports found; pass --port")),
    }
}

fn pick_only(ports: Vec<PortInfo>) -> Result<String> {
    let Some(port) = ports
        .into_iter()
        .next()
    else {
        return Err(usage_err("no serial ports found; pass --port"));
    };
    info!("Auto-selected port: {}", port.name);
    Ok(port.name)
}

pub(crate) fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "interactive selection needs a terminal; pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("port selection cancelled".to_string()).into()
            } else {
                usage_err("port selection prompt failed")
            }
        },
    }
}

/// Menu line for a port: name, USB ids and product.
pub(crate) fn port_label(port: &PortInfo) -> String {
    let ids = match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
        _ => String::new(),
    };
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();
    format!("{}{ids}{product}", port.name)
}

fn select_port_interactive(ports: Vec<PortInfo>) -> Result<String> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&port_label(p), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the target's console port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .into_iter()
            .nth(index)
            .map(|p| p.name)
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("port selection cancelled".to_string()).into()),
    }
}
