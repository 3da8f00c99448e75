//! Rebooting the device under test.
//!
//! A reboot is parameterised by two choices: which boot source the device
//! comes up from (`flash` selects the serial download path that lands in
//! plo) and whether power is cycled (`hard`) or only the reset line pulsed.
//! How that is done depends on the host:
//!
//! | Strategy               | Host                               |
//! |------------------------|------------------------------------|
//! | [`GpioRebooter`]       | board wired to GPIO or modem lines |
//! | [`InteractiveRebooter`]| a human at the bench               |
//! | [`DebuggerRebooter`]   | debug probe driven by openocd      |
//! | [`EmulatorRebooter`]   | emulator behind a process session  |
//!
//! Strategies only borrow the [`DeviceSession`]; they clear its buffer at
//! the reset edge so that output produced while nobody was listening does
//! not satisfy the next expectation.

pub mod debugger;
pub mod gpio;
pub mod interactive;

pub use debugger::DebuggerRebooter;
#[cfg(feature = "native")]
pub use gpio::{ModemControl, ModemLine, ModemSignal};
pub use gpio::{GpioRebooter, OutputLine, RebootTimings, SysfsGpio};
pub use interactive::InteractiveRebooter;

use {
    crate::{error::Result, session::DeviceSession},
    log::info,
};

/// What kind of reboot to perform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebootOptions {
    /// Boot into the bootloader's serial download mode.
    pub flash: bool,
    /// Cycle power instead of pulsing reset.
    pub hard: bool,
}

impl RebootOptions {
    /// Normal boot, reset line only.
    pub const SOFT: Self = Self {
        flash: false,
        hard: false,
    };

    /// Normal boot with a power cycle.
    pub const HARD: Self = Self {
        flash: false,
        hard: true,
    };

    /// Power cycle into flash mode.
    pub const FLASH: Self = Self {
        flash: true,
        hard: true,
    };
}

/// Capability to reboot a device.
pub trait Rebootable {
    /// Reboot the device behind `session`.
    fn reboot(&mut self, session: &mut DeviceSession, options: RebootOptions) -> Result<()>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Reboots an emulated target by restarting its process.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmulatorRebooter;

impl Rebootable for EmulatorRebooter {
    fn reboot(&mut self, session: &mut DeviceSession, options: RebootOptions) -> Result<()> {
        info!("Restarting emulator ({options:?})");
        session.reopen()
    }

    fn name(&self) -> &'static str {
        "emulator"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::port::mock::ScriptedPort;

    #[test]
    fn test_emulator_reboot_reopens_session() {
        let port = ScriptedPort::new()
            .with_output("previous run")
            .on_reopen("Waiting for input");
        let probe = port.probe();
        let mut session = DeviceSession::new(Box::new(port));

        EmulatorRebooter
            .reboot(&mut session, RebootOptions::HARD)
            .unwrap();

        assert_eq!(probe.reopens(), 1);
        let m = session
            .expect_exact("Waiting for input", Duration::from_secs(1))
            .unwrap();
        assert!(m.before.is_empty());
    }
}
