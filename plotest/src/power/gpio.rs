//! Power, reset and boot-select lines driven from the host.

#[cfg(feature = "native")]
use std::sync::{Arc, Mutex, PoisonError};
use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info};

use super::{RebootOptions, Rebootable};
use crate::error::{Error, Result};
use crate::session::DeviceSession;

/// Default sysfs GPIO root.
pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// How long udev gets to create a freshly exported GPIO directory.
const EXPORT_TIMEOUT: Duration = Duration::from_secs(1);

/// A single host controlled output.
///
/// `set(true)` means the line's function is active: power on, reset held,
/// flash boot source selected.
pub trait OutputLine: Send {
    /// Drive the line.
    fn set(&mut self, active: bool) -> Result<()>;

    /// Name used in logs and errors.
    fn name(&self) -> String;
}

/// Linux sysfs GPIO output.
#[derive(Debug)]
pub struct SysfsGpio {
    number: u32,
    value: PathBuf,
    active_low: bool,
}

impl SysfsGpio {
    /// Export GPIO `number` and configure it as an output.
    pub fn open(number: u32) -> Result<Self> {
        Self::open_in(Path::new(SYSFS_GPIO_ROOT), number)
    }

    /// Like [`SysfsGpio::open`] below a different sysfs root.
    pub fn open_in(root: &Path, number: u32) -> Result<Self> {
        let dir = root.join(format!("gpio{number}"));
        if !dir.exists() {
            debug!("Exporting gpio{number}");
            fs::write(root.join("export"), number.to_string())?;
            let start = Instant::now();
            while !dir.join("direction").exists() {
                if start.elapsed() >= EXPORT_TIMEOUT {
                    return Err(Error::Config(format!(
                        "gpio{number} did not show up after export"
                    )));
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
        fs::write(dir.join("direction"), "out")?;
        Ok(Self {
            number,
            value: dir.join("value"),
            active_low: false,
        })
    }

    /// Invert the electrical level.
    #[must_use]
    pub fn with_active_low(mut self, active_low: bool) -> Self {
        self.active_low = active_low;
        self
    }
}

impl OutputLine for SysfsGpio {
    fn set(&mut self, active: bool) -> Result<()> {
        let level = if active != self.active_low { "1" } else { "0" };
        fs::write(&self.value, level)?;
        Ok(())
    }

    fn name(&self) -> String {
        format!("gpio{}", self.number)
    }
}

/// Modem control signal of a serial adapter.
#[cfg(feature = "native")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemSignal {
    /// Data Terminal Ready.
    Dtr,
    /// Request To Send.
    Rts,
}

/// Serial adapter whose modem lines are wired to the board.
#[cfg(feature = "native")]
#[derive(Clone)]
pub struct ModemControl {
    port: Arc<Mutex<Box<dyn serialport::SerialPort>>>,
    name: String,
}

#[cfg(feature = "native")]
impl ModemControl {
    /// Open the adapter at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let port = serialport::new(path, 115_200).open()?;
        Ok(Self {
            port: Arc::new(Mutex::new(port)),
            name: path.to_string(),
        })
    }

    /// One of the adapter's lines.
    pub fn line(&self, signal: ModemSignal) -> ModemLine {
        ModemLine {
            control: self.clone(),
            signal,
            active_low: false,
        }
    }
}

/// A DTR or RTS line used as an output.
#[cfg(feature = "native")]
pub struct ModemLine {
    control: ModemControl,
    signal: ModemSignal,
    active_low: bool,
}

#[cfg(feature = "native")]
impl ModemLine {
    /// Invert the logical level.
    #[must_use]
    pub fn with_active_low(mut self, active_low: bool) -> Self {
        self.active_low = active_low;
        self
    }
}

#[cfg(feature = "native")]
impl OutputLine for ModemLine {
    fn set(&mut self, active: bool) -> Result<()> {
        let level = active != self.active_low;
        let mut port = self
            .control
            .port
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match self.signal {
            ModemSignal::Dtr => port.write_data_terminal_ready(level)?,
            ModemSignal::Rts => port.write_request_to_send(level)?,
        }
        Ok(())
    }

    fn name(&self) -> String {
        format!("{}:{:?}", self.control.name, self.signal)
    }
}

/// Settle delays of a GPIO reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebootTimings {
    /// Time the board stays unpowered.
    pub power_off: Duration,
    /// Time given to the board after power returns or reset is released.
    pub power_on: Duration,
    /// Length of the reset pulse.
    pub reset_pulse: Duration,
}

impl Default for RebootTimings {
    fn default() -> Self {
        Self {
            power_off: Duration::from_millis(500),
            power_on: Duration::from_millis(500),
            reset_pulse: Duration::from_millis(50),
        }
    }
}

/// Reboots a board through host controlled lines.
pub struct GpioRebooter {
    power: Box<dyn OutputLine>,
    reset: Option<Box<dyn OutputLine>>,
    boot: Option<Box<dyn OutputLine>>,
    timings: RebootTimings,
}

impl GpioRebooter {
    /// Rebooter with only a power line.
    pub fn new(power: Box<dyn OutputLine>) -> Self {
        Self {
            power,
            reset: None,
            boot: None,
            timings: RebootTimings::default(),
        }
    }

    /// Add a reset line for soft reboots.
    #[must_use]
    pub fn with_reset(mut self, line: Box<dyn OutputLine>) -> Self {
        self.reset = Some(line);
        self
    }

    /// Add a boot source select line.
    #[must_use]
    pub fn with_boot_select(mut self, line: Box<dyn OutputLine>) -> Self {
        self.boot = Some(line);
        self
    }

    /// Override the settle delays.
    #[must_use]
    pub fn with_timings(mut self, timings: RebootTimings) -> Self {
        self.timings = timings;
        self
    }

    fn power_cycle(&mut self, session: &mut DeviceSession) -> Result<()> {
        drive(self.power.as_mut(), false)?;
        thread::sleep(self.timings.power_off);
        session.clear_buffer()?;
        drive(self.power.as_mut(), true)?;
        thread::sleep(self.timings.power_on);
        Ok(())
    }

    fn pulse_reset(&mut self, session: &mut DeviceSession) -> Result<()> {
        let Some(reset) = self.reset.as_mut() else {
            debug!("No reset line, cycling power instead");
            return self.power_cycle(session);
        };
        drive(reset.as_mut(), true)?;
        thread::sleep(self.timings.reset_pulse);
        session.clear_buffer()?;
        drive(reset.as_mut(), false)?;
        thread::sleep(self.timings.power_on);
        Ok(())
    }
}

impl Rebootable for GpioRebooter {
    fn reboot(&mut self, session: &mut DeviceSession, options: RebootOptions) -> Result<()> {
        info!(
            "Rebooting {} ({}, {} boot)",
            session.name(),
            if options.hard { "power cycle" } else { "reset" },
            if options.flash { "flash" } else { "normal" },
        );
        if let Some(boot) = self.boot.as_mut() {
            drive(boot.as_mut(), options.flash)?;
        } else if options.flash {
            return Err(Error::Reboot(
                "no boot select line, cannot boot into flash mode".to_string(),
            ));
        }

        if options.hard {
            self.power_cycle(session)
        } else {
            self.pulse_reset(session)
        }
    }

    fn name(&self) -> &'static str {
        "gpio"
    }
}

fn drive(line: &mut dyn OutputLine, active: bool) -> Result<()> {
    line.set(active)
        .map_err(|e| Error::Reboot(format!("driving {} failed: {e}", line.name())))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::port::mock::{Probe, ScriptedPort};

    /// Records `<name>=<level>@<buffer clears so far>`.
    struct RecordingLine {
        name: &'static str,
        events: Arc<Mutex<Vec<String>>>,
        probe: Probe,
    }

    impl OutputLine for RecordingLine {
        fn set(&mut self, active: bool) -> Result<()> {
            self.events.lock().unwrap().push(format!(
                "{}={}@{}",
                self.name,
                u8::from(active),
                self.probe.clears()
            ));
            Ok(())
        }

        fn name(&self) -> String {
            self.name.to_string()
        }
    }

    struct FailingLine;

    impl OutputLine for FailingLine {
        fn set(&mut self, _active: bool) -> Result<()> {
            Err(Error::Io(std::io::Error::other("permission denied")))
        }

        fn name(&self) -> String {
            "gpio9".to_string()
        }
    }

    fn zero() -> RebootTimings {
        RebootTimings {
            power_off: Duration::ZERO,
            power_on: Duration::ZERO,
            reset_pulse: Duration::ZERO,
        }
    }

    fn rig(with_reset: bool) -> (GpioRebooter, DeviceSession, Arc<Mutex<Vec<String>>>) {
        let port = ScriptedPort::new().with_output("noise from the previous boot");
        let probe = port.probe();
        let events = Arc::new(Mutex::new(Vec::new()));
        let line = |name| {
            Box::new(RecordingLine {
                name,
                events: Arc::clone(&events),
                probe: probe.clone(),
            }) as Box<dyn OutputLine>
        };
        let mut rebooter = GpioRebooter::new(line("power"))
            .with_boot_select(line("boot"))
            .with_timings(zero());
        if with_reset {
            rebooter = rebooter.with_reset(line("reset"));
        }
        (rebooter, DeviceSession::new(Box::new(port)), events)
    }

    #[test]
    fn test_hard_reboot_sequence() {
        let (mut rebooter, mut session, events) = rig(true);
        rebooter
            .reboot(&mut session, RebootOptions::FLASH)
            .unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            ["boot=1@0", "power=0@0", "power=1@1"]
        );
        assert!(session.buffered().is_empty());
    }

    #[test]
    fn test_soft_reboot_pulses_reset() {
        let (mut rebooter, mut session, events) = rig(true);
        rebooter
            .reboot(&mut session, RebootOptions::SOFT)
            .unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            ["boot=0@0", "reset=1@0", "reset=0@1"]
        );
    }

    #[test]
    fn test_soft_reboot_without_reset_line_cycles_power() {
        let (mut rebooter, mut session, events) = rig(false);
        rebooter
            .reboot(&mut session, RebootOptions::SOFT)
            .unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            ["boot=0@0", "power=0@0", "power=1@1"]
        );
    }

    #[test]
    fn test_line_failure_is_fatal() {
        let mut rebooter = GpioRebooter::new(Box::new(FailingLine)).with_timings(zero());
        let mut session = DeviceSession::new(Box::new(ScriptedPort::new()));
        let err = rebooter
            .reboot(&mut session, RebootOptions::HARD)
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("gpio9"));
    }

    #[test]
    fn test_flash_boot_needs_boot_select() {
        let mut rebooter = GpioRebooter::new(Box::new(FailingLine));
        let mut session = DeviceSession::new(Box::new(ScriptedPort::new()));
        let err = rebooter
            .reboot(&mut session, RebootOptions::FLASH)
            .unwrap_err();
        assert!(matches!(err, Error::Reboot(_)));
    }

    #[test]
    fn test_sysfs_gpio_levels() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("gpio17");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("direction"), "in").unwrap();

        let mut gpio = SysfsGpio::open_in(root.path(), 17).unwrap();
        assert_eq!(fs::read_to_string(dir.join("direction")).unwrap(), "out");
        assert_eq!(gpio.name(), "gpio17");
        gpio.set(true).unwrap();
        assert_eq!(fs::read_to_string(dir.join("value")).unwrap(), "1");

        let mut inverted = SysfsGpio::open_in(root.path(), 17)
            .unwrap()
            .with_active_low(true);
        inverted.set(true).unwrap();
        assert_eq!(fs::read_to_string(dir.join("value")).unwrap(), "0");
    }

    #[test]
    fn test_sysfs_export_timeout() {
        let root = tempfile::tempdir().unwrap();
        let err = SysfsGpio::open_in(root.path(), 4).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(fs::read_to_string(root.path().join("export")).unwrap(), "4");
    }
}
