//! Core reset through a debug probe.

use std::time::Duration;

use log::info;

use super::{RebootOptions, Rebootable};
use crate::error::{Error, Result};
use crate::service::{BackgroundService, ServiceSpec};
use crate::session::DeviceSession;

/// Resets the core with a one-shot openocd run.
pub struct DebuggerRebooter {
    spec: ServiceSpec,
    exit_timeout: Duration,
}

impl DebuggerRebooter {
    /// openocd with `config` arguments followed by `init; reset run; shutdown`.
    pub fn openocd<I, S>(config: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args: Vec<String> = config
            .into_iter()
            .map(Into::into)
            .collect();
        args.extend(
            ["-c", "init", "-c", "reset run", "-c", "shutdown"]
                .map(String::from),
        );
        Self::new(ServiceSpec::openocd(args))
    }

    /// Any helper that resets the core and then exits on its own.
    pub fn new(spec: ServiceSpec) -> Self {
        Self {
            spec,
            exit_timeout: Duration::from_secs(10),
        }
    }

    /// Bound on the helper's own exit after it reported readiness.
    #[must_use]
    pub fn with_exit_timeout(mut self, timeout: Duration) -> Self {
        self.exit_timeout = timeout;
        self
    }
}

impl Rebootable for DebuggerRebooter {
    fn reboot(&mut self, session: &mut DeviceSession, options: RebootOptions) -> Result<()> {
        if options.flash {
            return Err(Error::Reboot(
                "a debugger reset cannot select the flash boot source".to_string(),
            ));
        }
        info!("Resetting core through {}", self.spec.program);
        session.clear_buffer()?;
        let exit_timeout = self.exit_timeout;
        BackgroundService::scoped(&self.spec, |probe| {
            probe.wait_exit(exit_timeout)?;
            Ok(())
        })
        .map_err(|e| Error::Reboot(format!("debugger reset failed: {e}")))
    }

    fn name(&self) -> &'static str {
        "debugger"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::ScriptedPort;
    use crate::service::OPENOCD_MARKER;

    fn fake_openocd(script: &str) -> DebuggerRebooter {
        DebuggerRebooter::new(
            ServiceSpec::new("sh", OPENOCD_MARKER)
                .with_args(["-c", script])
                .with_ready_timeout(Duration::from_secs(5)),
        )
        .with_exit_timeout(Duration::from_secs(2))
    }

    #[test]
    fn test_openocd_command_line() {
        let rebooter = DebuggerRebooter::openocd(["-f", "interface/stlink.cfg"]);
        assert_eq!(rebooter.spec.program, "openocd");
        assert_eq!(
            rebooter.spec.args,
            ["-f", "interface/stlink.cfg", "-c", "init", "-c", "reset run", "-c", "shutdown"]
        );
    }

    #[test]
    fn test_reset_succeeds_when_probe_exits_cleanly() {
        let port = ScriptedPort::new();
        let probe = port.probe();
        let mut session = DeviceSession::new(Box::new(port));
        let mut rebooter = fake_openocd(&format!("echo '{OPENOCD_MARKER}'; exit 0"));
        rebooter
            .reboot(&mut session, RebootOptions::HARD)
            .unwrap();
        assert_eq!(probe.clears(), 1);
    }

    #[test]
    fn test_probe_failure_is_fatal() {
        let mut session = DeviceSession::new(Box::new(ScriptedPort::new()));
        let mut rebooter = fake_openocd(&format!("echo '{OPENOCD_MARKER}'; exit 1"));
        let err = rebooter
            .reboot(&mut session, RebootOptions::SOFT)
            .unwrap_err();
        assert!(matches!(err, Error::Reboot(_)));
    }

    #[test]
    fn test_flash_mode_rejected() {
        let mut session = DeviceSession::new(Box::new(ScriptedPort::new()));
        let mut rebooter = fake_openocd("true");
        assert!(
            rebooter
                .reboot(&mut session, RebootOptions::FLASH)
                .is_err()
        );
    }
}
