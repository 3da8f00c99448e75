//! # plotest
//!
//! Hardware-in-the-loop test harness for boards that boot through the `plo`
//! bootloader, and for their emulated counterparts.
//!
//! The crate is layered bottom-up:
//!
//! - [`port`]: byte transports (serial line, emulator process)
//! - [`session`]: a console session with pattern expectations
//! - [`protocol::plo`]: the bootloader's command protocol
//! - [`service`]: helper processes such as phoenixd or openocd
//! - [`power`]: reboot strategies
//! - [`target`]: device configuration with its flash and preload strategies
//! - [`harness`]: per-test stage pipeline
//! - [`runner`]: flashing once, then every test with reboot avoidance
//!
//! ## Features
//!
//! - `native` (default): serial ports and modem control lines via `serialport`
//! - `serde`: serialization of the plain configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use plotest::{
//!     ExpectBody, HostConfig, HostKind, LogReporter, ProcessConfig, RunContext, ShellOptions,
//!     Target, TargetConfig, TargetKind, TestOptions, TestRunner,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let qemu = ProcessConfig::new("qemu-system-i386").with_args(["-nographic"]);
//!     let config = TargetConfig::new("ia32-generic-qemu", TargetKind::Emulated(qemu));
//!     let host = HostConfig::new(HostKind::Emulator);
//!     let rebooter = plotest::host::rebooter_for(&host, &config)?;
//!     let target = Target::open(config, rebooter)?;
//!
//!     let mut tests = vec![
//!         TestOptions::new("uname", ExpectBody::command("uname").expect("Phoenix"))
//!             .with_shell(ShellOptions::default())
//!             .with_timeout(Duration::from_secs(10)),
//!     ];
//!     let mut runner = TestRunner::new(target, RunContext::new().with_flash(false));
//!     let summary = runner.run(&mut tests, &mut LogReporter)?;
//!     println!("{} passed, {} failed", summary.passed, summary.failed);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::OnceLock;

pub mod error;
pub mod harness;
pub mod host;
pub mod image;
pub mod port;
pub mod power;
pub mod protocol;
pub mod runner;
pub mod service;
pub mod session;
pub mod target;

type InterruptCheck = Box<dyn Fn() -> bool + Send + Sync>;

static INTERRUPT: OnceLock<InterruptCheck> = OnceLock::new();

/// Install the process-wide stop request check, polled between tests.
///
/// Only the first installed check is kept.
pub fn set_interrupt_checker<F>(check: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    if INTERRUPT.set(Box::new(check)).is_err() {
        log::debug!("Interrupt check already installed");
    }
}

/// True once the embedding program asked the run to stop.
#[must_use]
pub fn interrupt_requested() -> bool {
    INTERRUPT.get().is_some_and(|check| check())
}

#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    error::{Error, Result},
    harness::{ExpectBody, FailureStage, ShellOptions, Status, TestBody, TestOptions, TestResult},
    host::{HostConfig, HostKind},
    image::{AppLoadSpec, CleanmarkerGeometry, FlashImage, FlashImageSpec, JffsFlashImageSpec},
    port::{Port, PortEnumerator, PortInfo, ProcessConfig, SerialConfig},
    power::{RebootOptions, Rebootable},
    protocol::plo::{PloClient, PloCommand},
    runner::{LogReporter, Reporter, RunContext, Summary, TestRunner, next_should_reboot},
    service::{BackgroundService, ServiceSpec},
    session::{DeviceSession, MatchResult, Pattern},
    target::{Target, TargetConfig, TargetKind},
};

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    static STOP: AtomicBool = AtomicBool::new(false);

    #[test]
    fn test_interrupt_check_follows_installed_flag() {
        set_interrupt_checker(|| STOP.load(Ordering::Relaxed));
        assert!(!interrupt_requested());

        STOP.store(true, Ordering::Relaxed);
        assert!(interrupt_requested());
        STOP.store(false, Ordering::Relaxed);
    }
}
