//! Stage list built per test and driven by one loop.

use std::time::Duration;

use log::{debug, info};

use super::{FailureStage, Status, TestBody, TestOptions, TestResult};
use crate::error::{Error, Result};
use crate::image::AppLoadSpec;
use crate::power::RebootOptions;
use crate::protocol::plo::PloClient;
use crate::target::Target;

/// What the loop does after a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Run the next stage.
    Continue,
    /// End the test with the current result.
    Stop,
}

/// One step of a test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarnessStage {
    /// Reboot the device.
    Reboot(RebootOptions),
    /// Enter plo, preload `apps` and boot the OS.
    EnterBootloader {
        /// Applications to register.
        apps: Vec<AppLoadSpec>,
    },
    /// Wait for the OS shell prompt.
    EnterShell {
        /// Prompt text.
        prompt: String,
        /// Longest wait for it.
        timeout: Duration,
        /// Send an empty line first; the shell is already up.
        poke: bool,
    },
    /// Run a kernel log toggle in the shell.
    KernelLog {
        /// Shell command.
        command: String,
        /// Prompt printed once it is done.
        prompt: String,
        /// Whether the command turns logging back on.
        enable: bool,
    },
    /// The test body.
    Body,
    /// The prompt the shell prints once the body's command has finished.
    ClosingPrompt {
        /// Prompt text.
        prompt: String,
    },
}

impl HarnessStage {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reboot(_) => "reboot",
            Self::EnterBootloader { .. } => "bootloader",
            Self::EnterShell { .. } => "shell",
            Self::KernelLog { enable: false, .. } => "kernel-log-off",
            Self::KernelLog { enable: true, .. } => "kernel-log-on",
            Self::Body => "body",
            Self::ClosingPrompt { .. } => "closing-prompt",
        }
    }

    /// Tag given to a failure in this stage.
    pub fn failure_stage(&self) -> FailureStage {
        match self {
            Self::Reboot(_) | Self::EnterBootloader { .. } | Self::EnterShell { .. } => FailureStage::Flash,
            Self::KernelLog { enable, .. } => {
                if *enable {
                    FailureStage::Run
                } else {
                    FailureStage::Flash
                }
            },
            Self::Body | Self::ClosingPrompt { .. } => FailureStage::Run,
        }
    }

    fn run(
        &self,
        target: &mut Target,
        body: &mut dyn TestBody,
        timeout: Duration,
        result: &mut TestResult,
    ) -> Result<Flow> {
        match self {
            Self::Reboot(options) => target.reboot(*options)?,
            Self::EnterBootloader { apps } => {
                let (session, loader) = target.session_and_loader();
                let mut plo = PloClient::new(session)?;
                plo.enter_bootloader()?;
                if !apps.is_empty() {
                    let loader = loader.ok_or_else(|| {
                        Error::HarnessComposition("no application loader on this target".to_string())
                    })?;
                    loader.load_apps(&mut plo, apps)?;
                }
                plo.exit_to_os()?;
            },
            Self::EnterShell {
                prompt,
                timeout: bootup,
                poke,
            } => {
                let session = target.session();
                if *poke {
                    session.send_line("")?;
                }
                session.expect_exact(prompt, *bootup)?;
            },
            Self::KernelLog { command, prompt, .. } => {
                let session = target.session();
                session.send_line(command)?;
                session
                    .expect_exact(prompt, timeout)
                    .map_err(|e| e.with_command(command))?;
            },
            Self::Body => {
                body.run(target.session(), timeout, result)?;
                result.fold_subresults();
                if result.status != Status::Ok {
                    return Ok(Flow::Stop);
                }
            },
            Self::ClosingPrompt { prompt } => {
                target
                    .session()
                    .expect_exact(prompt, timeout)
                    .map_err(|e| match body.shell_command() {
                        Some(command) => e.with_command(command),
                        None => e,
                    })?;
            },
        }
        Ok(Flow::Continue)
    }
}

/// Ordered stages of one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<HarnessStage>,
}

impl Pipeline {
    /// Compose the stages `options` asks for on `target`.
    pub fn build(options: &TestOptions, target: &Target) -> Result<Self> {
        let config = target.config();
        let mut stages = Vec::new();

        if options.should_reboot {
            stages.push(HarnessStage::Reboot(RebootOptions::SOFT));
        }

        if let Some(bootloader) = &options.bootloader {
            if !bootloader.apps.is_empty() && !target.can_load_apps() {
                return Err(Error::HarnessComposition(format!(
                    "test {} preloads applications but target {} has no RAM window or phoenixd",
                    options.name, config.name
                )));
            }
            stages.push(HarnessStage::EnterBootloader {
                apps: bootloader.apps.clone(),
            });
        }

        let prompt = options.shell.as_ref().map(|shell| {
            shell
                .prompt
                .clone()
                .unwrap_or_else(|| config.shell_prompt.clone())
        });
        if let (Some(shell), Some(prompt)) = (&options.shell, &prompt) {
            stages.push(HarnessStage::EnterShell {
                prompt: prompt.clone(),
                timeout: shell
                    .bootup_timeout
                    .unwrap_or(config.bootup_timeout),
                poke: !options.should_reboot && options.bootloader.is_none(),
            });
        }

        let toggles = if options.suppress_kernel_log {
            let Some(prompt) = &prompt else {
                return Err(Error::HarnessComposition(format!(
                    "test {} suppresses kernel logs without entering the shell",
                    options.name
                )));
            };
            match (&config.kernel_log_off, &config.kernel_log_on) {
                (Some(off), Some(on)) => Some((off, on, prompt)),
                _ => {
                    debug!("Target {} has no kernel log commands", config.name);
                    None
                },
            }
        } else {
            None
        };

        if let Some((off, _, prompt)) = toggles {
            stages.push(HarnessStage::KernelLog {
                command: off.clone(),
                prompt: prompt.clone(),
                enable: false,
            });
        }
        stages.push(HarnessStage::Body);
        if let Some(prompt) = &prompt {
            stages.push(HarnessStage::ClosingPrompt {
                prompt: prompt.clone(),
            });
        }
        if let Some((_, on, prompt)) = toggles {
            stages.push(HarnessStage::KernelLog {
                command: on.clone(),
                prompt: prompt.clone(),
                enable: true,
            });
        }

        Ok(Self { stages })
    }

    /// Stages in execution order.
    pub fn stages(&self) -> &[HarnessStage] {
        &self.stages
    }

    /// Drive every stage until one stops the test.
    ///
    /// Stage errors become a FAIL tagged with the stage; fatal errors
    /// ([`Error::is_fatal`]) are returned instead.
    pub fn run(&self, target: &mut Target, body: &mut dyn TestBody, timeout: Duration) -> Result<TestResult> {
        let mut result = TestResult::new();
        for stage in &self.stages {
            debug!("Stage {}", stage.name());
            match stage.run(target, body, timeout, &mut result) {
                Ok(Flow::Continue) => {},
                Ok(Flow::Stop) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    info!("Stage {} failed: {e}", stage.name());
                    result.fail(stage.failure_stage(), e.to_string());
                    break;
                },
            }
        }
        Ok(result)
    }
}
