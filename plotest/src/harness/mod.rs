//! Per-test harness: options in, [`TestResult`] out.
//!
//! A test is described declaratively by [`TestOptions`]. For every test a
//! fresh [`Pipeline`] is built from those options and the target's
//! capabilities, then driven stage by stage until it finishes or a stage
//! stops it.

pub mod body;
pub mod pipeline;

pub use body::{ExpectBody, TestBody};
pub use pipeline::{Flow, HarnessStage, Pipeline};

use std::fmt;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::image::AppLoadSpec;

/// Outcome of a test or sub-test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum Status {
    /// Passed.
    Ok,
    /// Failed.
    Fail,
    /// Not run.
    Skip,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::Fail => f.write_str("FAIL"),
            Self::Skip => f.write_str("SKIP"),
        }
    }
}

/// Where a failed test broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum FailureStage {
    /// Preparing the device: reboot, bootloader, shell entry.
    Flash,
    /// Running the test itself.
    Run,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flash => f.write_str("FLASH"),
            Self::Run => f.write_str("RUN"),
        }
    }
}

/// Named leaf outcome inside one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubResult {
    /// Sub-test name.
    pub name: String,
    /// Its outcome.
    pub status: Status,
    /// Failure details.
    pub message: String,
}

/// Accumulated outcome of one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    /// Overall outcome.
    pub status: Status,
    /// Failure or skip reason.
    pub message: String,
    /// Stage a failure happened in; `None` for composition failures.
    pub stage: Option<FailureStage>,
    /// Leaf outcomes in the order they were reported.
    pub subresults: Vec<SubResult>,
}

impl Default for TestResult {
    fn default() -> Self {
        Self {
            status: Status::Ok,
            message: String::new(),
            stage: None,
            subresults: Vec::new(),
        }
    }
}

impl TestResult {
    /// A passing result.
    pub fn new() -> Self {
        Self::default()
    }

    /// A skipped result.
    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: Status::Skip,
            message: message.into(),
            ..Self::default()
        }
    }

    /// A failed result.
    pub fn failed(stage: Option<FailureStage>, message: impl Into<String>) -> Self {
        Self {
            status: Status::Fail,
            message: message.into(),
            stage,
            ..Self::default()
        }
    }

    /// Mark as failed in `stage`.
    pub fn fail(&mut self, stage: FailureStage, message: impl Into<String>) {
        self.status = Status::Fail;
        self.stage = Some(stage);
        self.message = message.into();
    }

    /// Record a sub-test.
    pub fn add_subresult(&mut self, name: impl Into<String>, status: Status, message: impl Into<String>) {
        self.subresults.push(SubResult {
            name: name.into(),
            status,
            message: message.into(),
        });
    }

    /// Fail a still passing result when any of its sub-tests failed.
    pub fn fold_subresults(&mut self) {
        if self.status != Status::Ok {
            return;
        }
        let failed: Vec<&str> = self
            .subresults
            .iter()
            .filter(|s| s.status == Status::Fail)
            .map(|s| s.name.as_str())
            .collect();
        if !failed.is_empty() {
            let message = format!("failed: {}", failed.join(", "));
            self.fail(FailureStage::Run, message);
        }
    }

    /// Whether the test failed.
    pub fn is_fail(&self) -> bool {
        self.status == Status::Fail
    }
}

/// Bootloader step of a test.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootloaderOptions {
    /// Applications registered before the OS boots.
    pub apps: Vec<AppLoadSpec>,
}

/// Shell entry step of a test; `None` fields fall back to the target's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOptions {
    /// Prompt override.
    pub prompt: Option<String>,
    /// Boot timeout override.
    pub bootup_timeout: Option<Duration>,
}

/// Declarative description of one test.
pub struct TestOptions {
    /// Test name.
    pub name: String,
    /// Reboot before the test. Recomputed by the runner between tests.
    pub should_reboot: bool,
    /// Enter the bootloader (and preload applications) first.
    pub bootloader: Option<BootloaderOptions>,
    /// Wait for the OS shell before the body.
    pub shell: Option<ShellOptions>,
    /// The test itself.
    pub body: Box<dyn TestBody>,
    /// Report as skipped without touching the device.
    pub ignore: bool,
    /// Bound on each wait of the body and of the closing prompt.
    pub timeout: Duration,
    /// Silence kernel messages while the body runs.
    pub suppress_kernel_log: bool,
}

impl TestOptions {
    /// Test `name` running `body` after a reboot.
    pub fn new(name: impl Into<String>, body: impl TestBody + 'static) -> Self {
        Self {
            name: name.into(),
            should_reboot: true,
            bootloader: None,
            shell: None,
            body: Box::new(body),
            ignore: false,
            timeout: Duration::from_secs(30),
            suppress_kernel_log: false,
        }
    }

    /// Preload `apps` from the bootloader.
    #[must_use]
    pub fn with_bootloader(mut self, apps: Vec<AppLoadSpec>) -> Self {
        self.bootloader = Some(BootloaderOptions { apps });
        self
    }

    /// Enter the shell before the body.
    #[must_use]
    pub fn with_shell(mut self, shell: ShellOptions) -> Self {
        self.shell = Some(shell);
        self
    }

    /// Set the initial reboot flag.
    #[must_use]
    pub fn with_should_reboot(mut self, should_reboot: bool) -> Self {
        self.should_reboot = should_reboot;
        self
    }

    /// Set the body timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Silence kernel messages around the body.
    #[must_use]
    pub fn with_kernel_log_suppressed(mut self) -> Self {
        self.suppress_kernel_log = true;
        self
    }

    /// Mark the test as ignored.
    #[must_use]
    pub fn ignored(mut self) -> Self {
        self.ignore = true;
        self
    }

    /// Whether the test needs the bootloader, and with it a fresh boot.
    pub fn needs_app_load(&self) -> bool {
        self.bootloader
            .is_some()
    }
}

impl fmt::Debug for TestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestOptions")
            .field("name", &self.name)
            .field("should_reboot", &self.should_reboot)
            .field("bootloader", &self.bootloader)
            .field("shell", &self.shell)
            .field("ignore", &self.ignore)
            .field("timeout", &self.timeout)
            .field("suppress_kernel_log", &self.suppress_kernel_log)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DeviceSession;

    fn noop(_: &mut DeviceSession, _: Duration, _: &mut TestResult) -> crate::Result<()> {
        Ok(())
    }

    #[test]
    fn test_status_tokens() {
        assert_eq!(Status::Ok.to_string(), "OK");
        assert_eq!(Status::Fail.to_string(), "FAIL");
        assert_eq!(Status::Skip.to_string(), "SKIP");
        assert_eq!(FailureStage::Flash.to_string(), "FLASH");
    }

    #[test]
    fn test_fold_subresults() {
        let mut result = TestResult::new();
        result.add_subresult("a", Status::Ok, "");
        result.add_subresult("b", Status::Fail, "expected 1");
        result.add_subresult("c", Status::Fail, "expected 2");
        result.fold_subresults();
        assert!(result.is_fail());
        assert_eq!(result.stage, Some(FailureStage::Run));
        assert_eq!(result.message, "failed: b, c");
    }

    #[test]
    fn test_fold_keeps_earlier_failure() {
        let mut result = TestResult::failed(Some(FailureStage::Flash), "no prompt");
        result.add_subresult("a", Status::Fail, "");
        result.fold_subresults();
        assert_eq!(result.message, "no prompt");
        assert_eq!(result.stage, Some(FailureStage::Flash));
    }

    #[test]
    fn test_options_defaults() {
        let options = TestOptions::new("echo", noop);
        assert!(options.should_reboot);
        assert!(!options.needs_app_load());
        assert!(!options.ignore);

        let options = options.with_bootloader(Vec::new()).ignored();
        assert!(options.needs_app_load());
        assert!(options.ignore);
    }
}
