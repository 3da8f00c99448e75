//! Configuration file support for plotest.
//!
//! Configuration is loaded from the following sources (highest priority first):
//! 1. Command-line arguments and environment variables (PLOTEST_*)
//! 2. The file named by `--config`, used alone when given
//! 3. Local config file (./plotest.toml)
//! 4. Global config file (~/.config/plotest/config.toml)
//!
//! A file declares targets, hosts and the test list:
//!
//! ```toml
//! [defaults]
//! target = "ia32-generic-qemu"
//!
//! [targets.ia32-generic-qemu.emulator]
//! program = "qemu-system-i386"
//! args = ["-nographic"]
//!
//! [[tests]]
//! name = "uname"
//! command = "uname -a"
//! expect = ["Phoenix"]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use log::debug;
use plotest::host::GpioLines;
use plotest::target::{PhoenixdConfig, RamWindow};
#[cfg(feature = "native")]
use plotest::SerialConfig;
use plotest::{
    AppLoadSpec, ExpectBody, FlashImage, HostConfig, HostKind, Pattern, ProcessConfig,
    ShellOptions, TargetConfig, TargetKind, TestOptions,
};
use serde::Deserialize;

use crate::CliError;

/// Name of the local configuration file.
pub const LOCAL_CONFIG: &str = "plotest.toml";

const DEFAULT_BAUD: u32 = 115_200;

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

fn default_true() -> bool {
    true
}

/// Fallback choices when the command line names none.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Target name.
    pub target: Option<String>,
    /// Host name or kind.
    pub host: Option<String>,
}

/// Emulator command line.
#[derive(Debug, Clone, Deserialize)]
pub struct EmulatorEntry {
    /// Program to start.
    pub program: String,
    /// Its arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
}

/// RAM window applications are staged in.
#[derive(Debug, Clone, Deserialize)]
pub struct RamWindowEntry {
    /// Bootloader RAM device.
    pub device: String,
    /// First usable byte.
    pub offset: u64,
    /// Usable size in bytes.
    pub size: u64,
}

/// phoenixd settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PhoenixdEntry {
    /// Host side device.
    pub port: String,
    /// Its baud rate.
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Directory holding the served files.
    pub dir: PathBuf,
}

/// One `[targets.<name>]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TargetEntry {
    /// Console serial port of a physical board.
    pub port: Option<String>,
    /// Console baud rate.
    pub baud: Option<u32>,
    /// Emulator command line; the target is emulated when present.
    pub emulator: Option<EmulatorEntry>,
    /// Shell prompt.
    pub shell_prompt: Option<String>,
    /// Boot timeout in seconds.
    pub bootup_timeout: Option<u64>,
    /// Command that silences kernel messages.
    pub kernel_log_off: Option<String>,
    /// Command that restores kernel messages.
    pub kernel_log_on: Option<String>,
    /// RAM window for application preloading.
    pub ram_window: Option<RamWindowEntry>,
    /// Whole-device image.
    pub flash_image: Option<FlashImage>,
    /// phoenixd settings.
    pub phoenixd: Option<PhoenixdEntry>,
}

impl TargetEntry {
    /// Whether the target runs in an emulator.
    pub fn is_emulated(&self) -> bool {
        self.emulator.is_some()
    }

    /// Build the library configuration; physical boards need `port`.
    pub fn to_config(&self, name: &str, port: Option<String>) -> Result<TargetConfig, CliError> {
        if self.phoenixd.is_none() && (self.flash_image.is_some() || self.ram_window.is_some()) {
            return Err(CliError::Config(format!(
                "target {name}: flash_image and ram_window need a phoenixd table"
            )));
        }
        let kind = self.kind(name, port)?;
        let mut config = TargetConfig::new(name, kind);
        if let Some(prompt) = &self.shell_prompt {
            config = config.with_shell_prompt(prompt.clone());
        }
        if let Some(secs) = self.bootup_timeout {
            config = config.with_bootup_timeout(Duration::from_secs(secs));
        }
        match (&self.kernel_log_off, &self.kernel_log_on) {
            (Some(off), Some(on)) => {
                config = config.with_kernel_log_commands(off.clone(), on.clone());
            },
            (None, None) => {},
            _ => {
                return Err(CliError::Config(format!(
                    "target {name}: kernel_log_off and kernel_log_on must be set together"
                )));
            },
        }
        if let Some(window) = &self.ram_window {
            config = config.with_ram_window(RamWindow {
                device: window.device.clone(),
                offset: window.offset,
                size: window.size,
            });
        }
        if let Some(image) = &self.flash_image {
            config = config.with_flash_image(image.clone());
        }
        if let Some(phoenixd) = &self.phoenixd {
            config = config.with_phoenixd(PhoenixdConfig {
                port: phoenixd.port.clone(),
                baud_rate: phoenixd.baud,
                dir: phoenixd.dir.clone(),
            });
        }
        Ok(config)
    }

    fn kind(&self, name: &str, port: Option<String>) -> Result<TargetKind, CliError> {
        if let Some(emulator) = &self.emulator {
            let mut process = ProcessConfig::new(emulator.program.clone()).with_args(emulator.args.clone());
            if let Some(cwd) = &emulator.cwd {
                process = process.with_cwd(cwd.clone());
            }
            return Ok(TargetKind::Emulated(process));
        }
        let Some(port) = port else {
            return Err(CliError::Usage(format!(
                "target {name} is a physical board; pass --port or set its port"
            )));
        };
        self.physical(port)
    }

    #[cfg(feature = "native")]
    fn physical(&self, port: String) -> Result<TargetKind, CliError> {
        let baud = self.baud.unwrap_or(DEFAULT_BAUD);
        Ok(TargetKind::Physical(SerialConfig::new(port, baud)))
    }

    #[cfg(not(feature = "native"))]
    fn physical(&self, _port: String) -> Result<TargetKind, CliError> {
        Err(CliError::Config(
            "physical targets need serial port support".to_string(),
        ))
    }
}

/// One `[hosts.<name>]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct HostEntry {
    /// Host kind.
    pub kind: HostKind,
    /// Raspberry Pi GPIO lines.
    #[serde(default)]
    pub gpio: GpioLines,
    /// PC modem line adapter.
    pub modem: Option<String>,
    /// PC openocd arguments.
    pub debugger: Option<Vec<String>>,
    /// Seconds a person gets to reset the board.
    pub interactive_timeout: Option<u64>,
}

impl HostEntry {
    fn to_config(&self) -> HostConfig {
        let mut host = HostConfig::new(self.kind).with_gpio(self.gpio);
        if let Some(modem) = &self.modem {
            host = host.with_modem(modem.clone());
        }
        if let Some(args) = &self.debugger {
            host = host.with_debugger(args.clone());
        }
        if let Some(secs) = self.interactive_timeout {
            host = host.with_interactive_timeout(Duration::from_secs(secs));
        }
        host
    }
}

/// One `[[tests]]` entry: a command and the output it must produce.
#[derive(Debug, Clone, Deserialize)]
pub struct TestEntry {
    /// Test name.
    pub name: String,
    /// Shell command to run.
    pub command: Option<String>,
    /// Output expected in order.
    #[serde(default)]
    pub expect: Vec<String>,
    /// Treat `expect` entries as regular expressions.
    #[serde(default)]
    pub regex: bool,
    /// Wait for the shell before the body.
    #[serde(default = "default_true")]
    pub shell: bool,
    /// Prompt overriding the target's.
    pub prompt: Option<String>,
    /// Body timeout in seconds.
    pub timeout: Option<u64>,
    /// Skip the test.
    #[serde(default)]
    pub ignore: bool,
    /// Silence kernel messages around the body.
    #[serde(default)]
    pub suppress_kernel_log: bool,
    /// Targets the test runs on; all when empty.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Applications preloaded through the bootloader.
    #[serde(default)]
    pub apps: Vec<AppLoadSpec>,
    /// Pass through the bootloader even without applications.
    #[serde(default)]
    pub bootloader: bool,
}

impl TestEntry {
    /// Whether the test applies to `target`.
    pub fn runs_on(&self, target: &str) -> bool {
        self.targets.is_empty() || self.targets.iter().any(|t| t == target)
    }

    /// Build the library test description.
    pub fn to_options(&self) -> Result<TestOptions, CliError> {
        if self.command.is_none() && self.expect.is_empty() {
            return Err(CliError::Config(format!(
                "test {}: needs a command or expected output",
                self.name
            )));
        }
        let mut body = self
            .command
            .as_ref()
            .map_or_else(ExpectBody::watch, |cmd| ExpectBody::command(cmd.as_str()));
        for text in &self.expect {
            let pattern = if self.regex {
                Pattern::regex(text).map_err(|e| CliError::Config(format!("test {}: {e}", self.name)))?
            } else {
                Pattern::literal(text)
            };
            body = body.expect(pattern);
        }

        let mut options = TestOptions::new(self.name.clone(), body);
        if self.shell {
            options = options.with_shell(ShellOptions {
                prompt: self.prompt.clone(),
                bootup_timeout: None,
            });
        }
        if self.bootloader || !self.apps.is_empty() {
            options = options.with_bootloader(self.apps.clone());
        }
        if let Some(secs) = self.timeout {
            options = options.with_timeout(Duration::from_secs(secs));
        }
        if self.suppress_kernel_log {
            options = options.with_kernel_log_suppressed();
        }
        if self.ignore {
            options = options.ignored();
        }
        Ok(options)
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fallback target and host.
    pub defaults: Defaults,
    /// Targets by name.
    pub targets: BTreeMap<String, TargetEntry>,
    /// Hosts by name.
    pub hosts: BTreeMap<String, HostEntry>,
    /// Tests in run order.
    pub tests: Vec<TestEntry>,
}

impl Config {
    /// Load the `--config` file if given, otherwise global plus local.
    pub fn load(explicit: Option<&Path>) -> Result<Self, CliError> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(CliError::Config(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
            return Self::load_from_file(path);
        }

        let mut config = Self::default();
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                config.merge(Self::load_from_file(&global_path)?);
            }
        }
        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            config.merge(Self::load_from_file(local)?);
        }
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Result<Self, CliError> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config = toml::from_str(&content)
            .map_err(|e| CliError::Config(format!("failed to parse {}: {e}", path.display())))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "plotest").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Merge another config into this one; `other` wins on conflicts.
    fn merge(&mut self, other: Self) {
        if other.defaults.target.is_some() {
            self.defaults.target = other.defaults.target;
        }
        if other.defaults.host.is_some() {
            self.defaults.host = other.defaults.host;
        }
        self.targets.extend(other.targets);
        self.hosts.extend(other.hosts);
        self.tests.extend(other.tests);
    }

    /// Pick the target named on the command line or in `[defaults]`.
    pub fn target(&self, cli_target: Option<&str>) -> Result<(&str, &TargetEntry), CliError> {
        let Some(name) = cli_target.or(self.defaults.target.as_deref()) else {
            return Err(CliError::Usage(
                "no target selected; pass --target or set defaults.target".to_string(),
            ));
        };
        self.targets
            .get_key_value(name)
            .map(|(name, entry)| (name.as_str(), entry))
            .ok_or_else(|| CliError::Config(format!("unknown target `{name}`")))
    }

    /// Resolve the host: a configured name, a bare kind, or a default by target type.
    pub fn host(&self, cli_host: Option<&str>, emulated: bool) -> Result<HostConfig, CliError> {
        let Some(name) = cli_host.or(self.defaults.host.as_deref()) else {
            let kind = if emulated { HostKind::Emulator } else { HostKind::Pc };
            return Ok(HostConfig::new(kind));
        };
        if let Some(entry) = self.hosts.get(name) {
            return Ok(entry.to_config());
        }
        name.parse::<HostKind>()
            .map(HostConfig::new)
            .map_err(|e| CliError::Config(e.to_string()))
    }

    /// Tests for `target`, optionally narrowed to the `only` names.
    pub fn tests_for(&self, target: &str, only: &[String]) -> Result<Vec<TestOptions>, CliError> {
        for name in only {
            if !self.tests.iter().any(|t| &t.name == name) {
                return Err(CliError::Usage(format!("unknown test `{name}`")));
            }
        }
        self.tests
            .iter()
            .filter(|t| t.runs_on(target))
            .filter(|t| only.is_empty() || only.contains(&t.name))
            .map(TestEntry::to_options)
            .collect()
    }
}
