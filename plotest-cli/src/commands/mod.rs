//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod ports;
pub(crate) mod run;

use std::fs::File;

use anyhow::{Context, Result};
use log::debug;
use plotest::Target;

use crate::config::{Config, TargetEntry};
use crate::{Cli, CliError};

/// Console port of a physical target: command line, then config, then the user.
fn resolve_port(cli: &Cli, entry: &TargetEntry) -> Result<String> {
    if let Some(port) = cli
        .port
        .as_ref()
        .or(entry.port.as_ref())
    {
        debug!("Using port {port}");
        return Ok(port.clone());
    }
    select_port(cli)
}

#[cfg(feature = "native")]
fn select_port(cli: &Cli) -> Result<String> {
    crate::serial::select_serial_port(cli.non_interactive)
}

#[cfg(not(feature = "native"))]
fn select_port(_cli: &Cli) -> Result<String> {
    Err(CliError::Usage("no serial port given; pass --port".to_string()).into())
}

/// Open the selected target with the reboot strategy of the selected host.
pub(crate) fn open_target(cli: &Cli, config: &Config) -> Result<Target> {
    let (name, entry) = config.target(cli.target.as_deref())?;
    let port = if entry.is_emulated() {
        None
    } else {
        Some(resolve_port(cli, entry)?)
    };
    let target_config = entry.to_config(name, port)?;
    let host = config
        .host(cli.host.as_deref(), target_config.is_emulated())?
        .with_interactive(!cli.non_interactive);
    debug!("Host: {}", host.kind);

    let rebooter = plotest::host::rebooter_for(&host, &target_config)?;
    let mut target =
        Target::open(target_config, rebooter).with_context(|| format!("Failed to open target {name}"))?;

    if let Some(path) = &cli.session_log {
        let file = File::create(path).map_err(|e| {
            CliError::Usage(format!("cannot create session log {}: {e}", path.display()))
        })?;
        target
            .session()
            .set_log(Some(Box::new(file)));
    }
    Ok(target)
}
