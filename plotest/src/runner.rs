//! Test orchestration.
//!
//! A run has two phases. The device image is flashed once, and any failure
//! there aborts the run. Then every test is executed in order through a
//! freshly built [`Pipeline`], its outcome reported and tallied, and the
//! reboot flag of the following test computed with [`next_should_reboot`].

use log::{info, warn};

use crate::error::{Error, Result};
use crate::harness::{Pipeline, Status, TestOptions, TestResult};
use crate::target::Target;

/// Run-wide switches handed down from the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunContext {
    /// Reboot before every test.
    pub nightly: bool,
    /// Flash the device image before the tests.
    pub flash: bool,
    /// Run the tests.
    pub test: bool,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            nightly: false,
            flash: true,
            test: true,
        }
    }
}

impl RunContext {
    /// Flash, then test, no nightly mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set nightly mode.
    #[must_use]
    pub fn with_nightly(mut self, nightly: bool) -> Self {
        self.nightly = nightly;
        self
    }

    /// Enable or disable the flashing phase.
    #[must_use]
    pub fn with_flash(mut self, flash: bool) -> Self {
        self.flash = flash;
        self
    }

    /// Enable or disable the test phase.
    #[must_use]
    pub fn with_test(mut self, test: bool) -> Self {
        self.test = test;
        self
    }
}

/// Tally of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    /// Tests that passed.
    pub passed: usize,
    /// Tests that failed.
    pub failed: usize,
    /// Tests that were skipped.
    pub skipped: usize,
}

impl Summary {
    /// Count one outcome.
    pub fn record(&mut self, status: Status) {
        match status {
            Status::Ok => self.passed += 1,
            Status::Fail => self.failed += 1,
            Status::Skip => self.skipped += 1,
        }
    }

    /// Number of tests seen.
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped
    }

    /// A run succeeds iff no test failed.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Receives run events.
pub trait Reporter {
    /// Flashing progress: `(step, done, total)`.
    fn flash_progress(&mut self, _step: &str, _done: u64, _total: u64) {}

    /// A test is about to run.
    fn test_started(&mut self, _name: &str) {}

    /// A test finished.
    fn test_finished(&mut self, name: &str, result: &TestResult);

    /// The run finished.
    fn summary(&mut self, _summary: &Summary) {}
}

/// Reports through the `log` facade.
#[derive(Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn test_started(&mut self, name: &str) {
        info!("Running {name}");
    }

    fn test_finished(&mut self, name: &str, result: &TestResult) {
        match result.status {
            Status::Fail => {
                let stage = result
                    .stage
                    .map_or_else(String::new, |s| format!(" [{s}]"));
                warn!("{name}: FAIL{stage} {}", result.message);
            },
            Status::Skip => info!("{name}: SKIP {}", result.message),
            Status::Ok => info!("{name}: OK"),
        }
    }

    fn summary(&mut self, summary: &Summary) {
        info!(
            "{} passed, {} failed, {} skipped",
            summary.passed, summary.failed, summary.skipped
        );
    }
}

/// Whether the test after one that ended with `status` must reboot first.
///
/// A skipped test leaves the device as it found it, so its own flag is
/// carried forward unchanged. Otherwise the device is rebooted after a
/// failure, in nightly mode, and before any test that enters the bootloader.
pub fn next_should_reboot(current_should_reboot: bool, status: Status, nightly: bool, next_needs_app_load: bool) -> bool {
    if status == Status::Skip {
        return current_should_reboot;
    }
    status == Status::Fail || nightly || next_needs_app_load
}

/// Drives flashing and tests on one target.
pub struct TestRunner {
    target: Target,
    context: RunContext,
    interrupted: Box<dyn Fn() -> bool>,
}

impl TestRunner {
    /// Runner for `target`, interruptible through [`crate::set_interrupt_checker`].
    pub fn new(target: Target, context: RunContext) -> Self {
        Self {
            target,
            context,
            interrupted: Box::new(crate::interrupt_requested),
        }
    }

    /// Use `checker` instead of the global interrupt checker.
    #[must_use]
    pub fn with_interrupt_checker(mut self, checker: impl Fn() -> bool + 'static) -> Self {
        self.interrupted = Box::new(checker);
        self
    }

    /// The target.
    pub fn target(&mut self) -> &mut Target {
        &mut self.target
    }

    /// Release the target.
    pub fn into_target(self) -> Target {
        self.target
    }

    /// Flash if asked to, then run `tests` in order.
    ///
    /// Errors are returned only for fatal conditions: a failed flashing
    /// phase, a failed reboot, or an interruption. Everything else is a
    /// FAIL of the affected test.
    pub fn run(&mut self, tests: &mut [TestOptions], reporter: &mut dyn Reporter) -> Result<Summary> {
        if self.context.flash {
            self.target
                .flash(&mut |step, done, total| reporter.flash_progress(step, done, total))?;
        }

        let mut summary = Summary::default();
        if !self.context.test {
            reporter.summary(&summary);
            return Ok(summary);
        }

        for i in 0..tests.len() {
            if (self.interrupted)() {
                return Err(Error::Interrupted);
            }
            let test = &mut tests[i];
            reporter.test_started(&test.name);
            let result = self.run_one(test)?;
            summary.record(result.status);
            reporter.test_finished(&test.name, &result);

            let current = test.should_reboot;
            if let Some(next) = tests.get_mut(i + 1) {
                next.should_reboot =
                    next_should_reboot(current, result.status, self.context.nightly, next.needs_app_load());
            }
        }

        reporter.summary(&summary);
        Ok(summary)
    }

    fn run_one(&mut self, test: &mut TestOptions) -> Result<TestResult> {
        if test.ignore {
            return Ok(TestResult::skipped("ignored"));
        }
        let pipeline = match Pipeline::build(test, &self.target) {
            Ok(pipeline) => pipeline,
            Err(e) => return Ok(TestResult::failed(None, e.to_string())),
        };
        pipeline.run(&mut self.target, test.body.as_mut(), test.timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::harness::FailureStage;
    use crate::image::AppLoadSpec;
    use crate::port::ProcessConfig;
    use crate::port::mock::ScriptedPort;
    use crate::power::{RebootOptions, Rebootable};
    use crate::session::DeviceSession;
    use crate::target::{Flashable, TargetConfig, TargetKind};

    #[derive(Clone, Default)]
    struct Counter(Arc<Mutex<usize>>);

    impl Counter {
        fn get(&self) -> usize {
            *self.0.lock().unwrap()
        }
    }

    struct CountingRebooter(Counter);

    impl Rebootable for CountingRebooter {
        fn reboot(&mut self, _session: &mut DeviceSession, _options: RebootOptions) -> Result<()> {
            *self.0.0.lock().unwrap() += 1;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct BrokenFlasher;

    impl Flashable for BrokenFlasher {
        fn flash(
            &mut self,
            _session: &mut DeviceSession,
            _rebooter: &mut dyn Rebootable,
            _progress: &mut dyn FnMut(&str, u64, u64),
        ) -> Result<()> {
            Err(Error::Flash {
                message: "copy failed".to_string(),
                output: String::new(),
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        finished: Vec<(String, Status)>,
        summaries: usize,
    }

    impl Reporter for Recorder {
        fn test_finished(&mut self, name: &str, result: &TestResult) {
            self.finished
                .push((name.to_string(), result.status));
        }

        fn summary(&mut self, _summary: &Summary) {
            self.summaries += 1;
        }
    }

    fn target(reboots: &Counter) -> Target {
        let config = TargetConfig::new("stub-target", TargetKind::Emulated(ProcessConfig::new("unused")));
        Target::new(
            config,
            DeviceSession::new(Box::new(ScriptedPort::new())),
            Box::new(CountingRebooter(reboots.clone())),
        )
    }

    fn pass(name: &str) -> TestOptions {
        TestOptions::new(name, |_: &mut DeviceSession, _: Duration, _: &mut TestResult| -> Result<()> { Ok(()) })
    }

    fn fail(name: &str) -> TestOptions {
        TestOptions::new(name, |_: &mut DeviceSession, _: Duration, result: &mut TestResult| -> Result<()> {
            result.fail(FailureStage::Run, "mismatch");
            Ok(())
        })
    }

    fn tests_only() -> RunContext {
        RunContext::new().with_flash(false)
    }

    #[test]
    fn test_next_should_reboot_table() {
        // Skip carries the current flag forward, whatever else holds.
        assert!(next_should_reboot(true, Status::Skip, false, false));
        assert!(!next_should_reboot(false, Status::Skip, true, true));

        assert!(next_should_reboot(false, Status::Fail, false, false));
        assert!(next_should_reboot(false, Status::Ok, true, false));
        assert!(!next_should_reboot(true, Status::Ok, false, false));
    }

    #[test]
    fn test_pass_followed_by_app_load_reboots() {
        for nightly in [false, true] {
            assert!(next_should_reboot(false, Status::Ok, nightly, true));
            assert!(next_should_reboot(true, Status::Ok, nightly, true));
        }
    }

    #[test]
    fn test_passing_tests_share_one_boot() {
        let reboots = Counter::default();
        let mut runner = TestRunner::new(target(&reboots), tests_only()).with_interrupt_checker(|| false);
        let mut tests = vec![pass("a"), pass("b"), pass("c")];
        let summary = runner
            .run(&mut tests, &mut Recorder::default())
            .unwrap();
        assert_eq!(summary.passed, 3);
        assert!(summary.is_success());
        assert_eq!(reboots.get(), 1);
        assert!(!tests[1].should_reboot);
        assert!(!tests[2].should_reboot);
    }

    #[test]
    fn test_failure_forces_next_reboot() {
        let reboots = Counter::default();
        let mut runner = TestRunner::new(target(&reboots), tests_only()).with_interrupt_checker(|| false);
        let mut tests = vec![fail("a"), pass("b"), pass("c")];
        let mut recorder = Recorder::default();
        let summary = runner
            .run(&mut tests, &mut recorder)
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert!(!summary.is_success());
        assert_eq!(reboots.get(), 2);
        assert_eq!(
            recorder.finished,
            [
                ("a".to_string(), Status::Fail),
                ("b".to_string(), Status::Ok),
                ("c".to_string(), Status::Ok)
            ]
        );
        assert_eq!(recorder.summaries, 1);
    }

    #[test]
    fn test_nightly_reboots_every_test() {
        let reboots = Counter::default();
        let context = tests_only().with_nightly(true);
        let mut runner = TestRunner::new(target(&reboots), context).with_interrupt_checker(|| false);
        let mut tests = vec![pass("a"), pass("b"), pass("c")];
        runner
            .run(&mut tests, &mut Recorder::default())
            .unwrap();
        assert_eq!(reboots.get(), 3);
    }

    #[test]
    fn test_skip_inherits_reboot_flag() {
        let reboots = Counter::default();
        let mut runner = TestRunner::new(target(&reboots), tests_only()).with_interrupt_checker(|| false);
        let mut tests = vec![fail("a"), pass("b").ignored(), pass("c")];
        let summary = runner
            .run(&mut tests, &mut Recorder::default())
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert!(tests[1].should_reboot);
        assert!(tests[2].should_reboot);
        assert_eq!(reboots.get(), 2);
    }

    #[test]
    fn test_composition_error_fails_without_stage() {
        let reboots = Counter::default();
        let mut runner = TestRunner::new(target(&reboots), tests_only()).with_interrupt_checker(|| false);
        let mut tests = vec![pass("apps").with_bootloader(vec![AppLoadSpec::new("psh", "flash0", "ddr")])];
        let mut recorder = Recorder::default();
        let summary = runner
            .run(&mut tests, &mut recorder)
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(reboots.get(), 0);
    }

    #[test]
    fn test_flash_failure_is_fatal() {
        let reboots = Counter::default();
        let target = target(&reboots).with_flasher(Box::new(BrokenFlasher));
        let mut runner = TestRunner::new(target, RunContext::new()).with_interrupt_checker(|| false);
        let mut tests = vec![pass("a")];
        let mut recorder = Recorder::default();
        let err = runner
            .run(&mut tests, &mut recorder)
            .unwrap_err();
        assert!(matches!(err, Error::Flash { .. }));
        assert!(recorder.finished.is_empty());
    }

    #[test]
    fn test_no_test_phase() {
        let reboots = Counter::default();
        let context = tests_only().with_test(false);
        let mut runner = TestRunner::new(target(&reboots), context).with_interrupt_checker(|| false);
        let summary = runner
            .run(&mut [pass("a")], &mut Recorder::default())
            .unwrap();
        assert_eq!(summary.total(), 0);
    }

    #[test]
    fn test_interrupt_between_tests() {
        let reboots = Counter::default();
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        let mut runner = TestRunner::new(target(&reboots), tests_only()).with_interrupt_checker(move || {
            seen.set(seen.get() + 1);
            seen.get() > 1
        });
        let mut tests = vec![pass("a"), pass("b")];
        let mut recorder = Recorder::default();
        let err = runner
            .run(&mut tests, &mut recorder)
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
        assert_eq!(recorder.finished.len(), 1);
        assert_eq!(calls.get(), 2);
    }
}
