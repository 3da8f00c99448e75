//! Host machines the harness runs on, and the reboot strategy each implies.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use log::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
#[cfg(feature = "native")]
use crate::port::{NativePortEnumerator, PortEnumerator, PortInfo};
use crate::power::{DebuggerRebooter, EmulatorRebooter, GpioRebooter, InteractiveRebooter, RebootTimings, Rebootable, SysfsGpio};
#[cfg(feature = "native")]
use crate::power::{ModemControl, ModemSignal};
use crate::target::TargetConfig;

/// Kind of machine driving the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum HostKind {
    /// Raspberry Pi with the board's power, reset and boot lines on GPIO.
    Rpi,
    /// Workstation; resets through a debug probe, modem lines or a person.
    Pc,
    /// Emulators only.
    Emulator,
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpi => f.write_str("rpi"),
            Self::Pc => f.write_str("pc"),
            Self::Emulator => f.write_str("emulator"),
        }
    }
}

impl FromStr for HostKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rpi" => Ok(Self::Rpi),
            "pc" => Ok(Self::Pc),
            "emulator" => Ok(Self::Emulator),
            other => Err(Error::Config(format!("unknown host `{other}`"))),
        }
    }
}

/// GPIO numbers of a board's control lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct GpioLines {
    /// Power enable.
    pub power: Option<u32>,
    /// Reset, asserted while held.
    pub reset: Option<u32>,
    /// Boot source select; asserted selects serial download.
    pub boot: Option<u32>,
    /// Lines are driven inverted.
    pub active_low: bool,
}

/// Everything needed to pick a reboot strategy on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Host kind.
    pub kind: HostKind,
    /// Raspberry Pi lines.
    pub gpio: GpioLines,
    /// PC: serial adapter with DTR wired to power and RTS to reset.
    pub modem: Option<String>,
    /// PC: openocd arguments for a debug probe reset.
    pub debugger: Option<Vec<String>>,
    /// Settle delays of line driven reboots.
    pub timings: RebootTimings,
    /// How long a person gets to reset the board.
    pub interactive_timeout: Duration,
    /// Whether a person may be asked to reset the board.
    pub interactive: bool,
}

impl HostConfig {
    /// Host of `kind` with nothing wired.
    pub fn new(kind: HostKind) -> Self {
        Self {
            kind,
            gpio: GpioLines::default(),
            modem: None,
            debugger: None,
            timings: RebootTimings::default(),
            interactive_timeout: crate::power::interactive::CONFIRM_TIMEOUT,
            interactive: true,
        }
    }

    /// Set the GPIO lines.
    #[must_use]
    pub fn with_gpio(mut self, gpio: GpioLines) -> Self {
        self.gpio = gpio;
        self
    }

    /// Reset through the modem lines of `adapter`.
    #[must_use]
    pub fn with_modem(mut self, adapter: impl Into<String>) -> Self {
        self.modem = Some(adapter.into());
        self
    }

    /// Reset through openocd started with `args`.
    #[must_use]
    pub fn with_debugger(mut self, args: Vec<String>) -> Self {
        self.debugger = Some(args);
        self
    }

    /// Set the line settle delays.
    #[must_use]
    pub fn with_timings(mut self, timings: RebootTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Set the interactive reset timeout.
    #[must_use]
    pub fn with_interactive_timeout(mut self, timeout: Duration) -> Self {
        self.interactive_timeout = timeout;
        self
    }

    /// Allow or forbid asking a person to reset the board.
    #[must_use]
    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }
}

/// Check that `host` can drive `target` at all.
pub fn check_pairing(host: &HostConfig, target: &TargetConfig) -> Result<()> {
    match (host.kind, target.is_emulated()) {
        (HostKind::Emulator, false) => Err(Error::Config(format!(
            "target {} is a physical board and cannot run on the emulator host",
            target.name
        ))),
        (HostKind::Rpi | HostKind::Pc, true) => Err(Error::Config(format!(
            "target {} is emulated and needs the emulator host, not {}",
            target.name, host.kind
        ))),
        _ => Ok(()),
    }
}

/// Reboot strategy for `target` on `host`.
pub fn rebooter_for(host: &HostConfig, target: &TargetConfig) -> Result<Box<dyn Rebootable>> {
    check_pairing(host, target)?;
    match host.kind {
        HostKind::Emulator => Ok(Box::new(EmulatorRebooter)),
        HostKind::Rpi => {
            let lines = host.gpio;
            let Some(power) = lines.power else {
                return Err(Error::Config("rpi host without a power GPIO".to_string()));
            };
            let open = |n: u32| -> Result<Box<dyn crate::power::OutputLine>> {
                Ok(Box::new(SysfsGpio::open(n)?.with_active_low(lines.active_low)))
            };
            let mut rebooter = GpioRebooter::new(open(power)?).with_timings(host.timings);
            if let Some(reset) = lines.reset {
                rebooter = rebooter.with_reset(open(reset)?);
            }
            if let Some(boot) = lines.boot {
                rebooter = rebooter.with_boot_select(open(boot)?);
            }
            Ok(Box::new(rebooter))
        },
        HostKind::Pc => {
            if let Some(args) = &host.debugger {
                debug!("Using debug probe reset");
                return Ok(Box::new(DebuggerRebooter::openocd(args.clone())));
            }
            #[cfg(feature = "native")]
            {
                if let Some(adapter) = &host.modem {
                    debug!("Using modem line reset on {adapter}");
                    let control = ModemControl::open(adapter)?;
                    let rebooter = GpioRebooter::new(Box::new(control.line(ModemSignal::Dtr)))
                        .with_reset(Box::new(control.line(ModemSignal::Rts)))
                        .with_timings(host.timings);
                    return Ok(Box::new(rebooter));
                }
            }
            if !host.interactive {
                return Err(Error::Config(format!(
                    "target {} needs a manual reset on this pc host, which non-interactive mode forbids; \
                     configure a debugger or modem adapter",
                    target.name
                )));
            }
            Ok(Box::new(
                InteractiveRebooter::stdio()?.with_timeout(host.interactive_timeout),
            ))
        },
    }
}

/// Serial ports present on this host.
#[cfg(feature = "native")]
pub fn discover_ports() -> Result<Vec<PortInfo>> {
    NativePortEnumerator::list_ports()
}
