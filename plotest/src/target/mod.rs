//! Targets: a device configuration plus the strategies that act on it.
//!
//! A target is not a type hierarchy. It is a [`TargetConfig`] value
//! (transport, memory geometry, images, shell details) together with the
//! capabilities chosen for it:
//!
//! - [`Rebootable`](crate::power::Rebootable), picked by the host,
//! - [`Flashable`], programming the whole-device image,
//! - [`AppLoadable`], registering applications from the bootloader.

pub mod plo;

pub use plo::{PloAppLoader, PloFlasher};

use {
    crate::{
        error::{Error, Result},
        image::{AppLoadSpec, FlashImage},
        port::ProcessConfig,
        power::{RebootOptions, Rebootable},
        protocol::plo::PloClient,
        service::ServiceSpec,
        session::DeviceSession,
    },
    log::info,
    std::{path::PathBuf, time::Duration},
};
#[cfg(feature = "native")]
use crate::port::SerialConfig;

/// Default OS shell prompt.
pub const SHELL_PROMPT: &str = "(psh)% ";

/// Programs the whole-device image.
pub trait Flashable {
    /// Flash the device behind `session`, rebooting it with `rebooter`.
    ///
    /// `progress` receives `(step, done, total)`.
    fn flash(
        &mut self,
        session: &mut DeviceSession,
        rebooter: &mut dyn Rebootable,
        progress: &mut dyn FnMut(&str, u64, u64),
    ) -> Result<()>;
}

/// Registers applications in the syspage from the bootloader prompt.
pub trait AppLoadable {
    /// Load every application in `apps`, in order.
    fn load_apps(&mut self, plo: &mut PloClient<'_>, apps: &[AppLoadSpec]) -> Result<()>;
}

/// How the device console is reached.
#[derive(Debug, Clone)]
pub enum TargetKind {
    /// Physical board behind a serial line.
    #[cfg(feature = "native")]
    Physical(SerialConfig),
    /// Emulator whose console is the process' stdio.
    Emulated(ProcessConfig),
}

/// RAM region applications are staged in before `app` registers them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamWindow {
    /// Bootloader device name of the RAM.
    pub device: String,
    /// First usable byte.
    pub offset: u64,
    /// Usable size.
    pub size: u64,
}

/// phoenixd settings of a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoenixdConfig {
    /// Host side device phoenixd serves files over.
    pub port: String,
    /// Baud rate of that device.
    pub baud_rate: u32,
    /// Directory holding the served files.
    pub dir: PathBuf,
}

impl PhoenixdConfig {
    /// Service description for this configuration.
    pub fn spec(&self) -> ServiceSpec {
        ServiceSpec::phoenixd(&self.port, self.baud_rate, &self.dir)
    }
}

/// Everything known about one device under test.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// Target name, for example `armv7a9-zynq7000-qemu`.
    pub name: String,
    /// Console transport.
    pub kind: TargetKind,
    /// OS shell prompt.
    pub shell_prompt: String,
    /// Longest wait for the shell prompt after boot.
    pub bootup_timeout: Duration,
    /// Shell command silencing kernel messages on the console.
    pub kernel_log_off: Option<String>,
    /// Shell command restoring kernel messages.
    pub kernel_log_on: Option<String>,
    /// RAM staging window for application preload.
    pub ram_window: Option<RamWindow>,
    /// Whole-device image.
    pub flash_image: Option<FlashImage>,
    /// phoenixd used for flashing and preload.
    pub phoenixd: Option<PhoenixdConfig>,
}

impl TargetConfig {
    /// Target `name` reached through `kind`, with defaults for the rest.
    pub fn new(name: impl Into<String>, kind: TargetKind) -> Self {
        Self {
            name: name.into(),
            kind,
            shell_prompt: SHELL_PROMPT.to_string(),
            bootup_timeout: Duration::from_secs(90),
            kernel_log_off: None,
            kernel_log_on: None,
            ram_window: None,
            flash_image: None,
            phoenixd: None,
        }
    }

    /// Set the shell prompt.
    #[must_use]
    pub fn with_shell_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.shell_prompt = prompt.into();
        self
    }

    /// Set the boot timeout.
    #[must_use]
    pub fn with_bootup_timeout(mut self, timeout: Duration) -> Self {
        self.bootup_timeout = timeout;
        self
    }

    /// Set the kernel log toggle commands.
    #[must_use]
    pub fn with_kernel_log_commands(mut self, off: impl Into<String>, on: impl Into<String>) -> Self {
        self.kernel_log_off = Some(off.into());
        self.kernel_log_on = Some(on.into());
        self
    }

    /// Set the RAM staging window.
    #[must_use]
    pub fn with_ram_window(mut self, window: RamWindow) -> Self {
        self.ram_window = Some(window);
        self
    }

    /// Set the device image.
    #[must_use]
    pub fn with_flash_image(mut self, image: FlashImage) -> Self {
        self.flash_image = Some(image);
        self
    }

    /// Set phoenixd.
    #[must_use]
    pub fn with_phoenixd(mut self, phoenixd: PhoenixdConfig) -> Self {
        self.phoenixd = Some(phoenixd);
        self
    }

    /// Whether the console is a spawned emulator.
    pub fn is_emulated(&self) -> bool {
        matches!(self.kind, TargetKind::Emulated(_))
    }

    /// Open the console session.
    pub fn open_session(&self) -> Result<DeviceSession> {
        match &self.kind {
            #[cfg(feature = "native")]
            TargetKind::Physical(serial) => DeviceSession::open_serial(serial),
            TargetKind::Emulated(process) => DeviceSession::spawn(process.clone()),
        }
    }
}

/// A target ready to run: its session plus the strategies acting on it.
pub struct Target {
    config: TargetConfig,
    session: DeviceSession,
    rebooter: Box<dyn Rebootable>,
    flasher: Option<Box<dyn Flashable>>,
    loader: Option<Box<dyn AppLoadable>>,
}

impl Target {
    /// Combine an open session with a reboot strategy.
    pub fn new(config: TargetConfig, session: DeviceSession, rebooter: Box<dyn Rebootable>) -> Self {
        Self {
            config,
            session,
            rebooter,
            flasher: None,
            loader: None,
        }
    }

    /// Open the session and pick the plo based strategies the config allows.
    pub fn open(config: TargetConfig, rebooter: Box<dyn Rebootable>) -> Result<Self> {
        let session = config.open_session()?;
        let mut target = Self::new(config, session, rebooter);
        if let Some(phoenixd) = &target.config.phoenixd {
            if let Some(image) = &target.config.flash_image {
                target.flasher = Some(Box::new(PloFlasher::new(image.clone(), phoenixd.spec())));
            }
            if let Some(window) = &target.config.ram_window {
                target.loader = Some(Box::new(PloAppLoader::new(window.clone(), phoenixd.spec())));
            }
        }
        Ok(target)
    }

    /// Use `flasher` for [`Target::flash`].
    #[must_use]
    pub fn with_flasher(mut self, flasher: Box<dyn Flashable>) -> Self {
        self.flasher = Some(flasher);
        self
    }

    /// Use `loader` for application preload.
    #[must_use]
    pub fn with_loader(mut self, loader: Box<dyn AppLoadable>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Target configuration.
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Console session.
    pub fn session(&mut self) -> &mut DeviceSession {
        &mut self.session
    }

    /// Whether application preload is available.
    pub fn can_load_apps(&self) -> bool {
        self.loader.is_some()
    }

    /// Reboot the device.
    pub fn reboot(&mut self, options: RebootOptions) -> Result<()> {
        info!(
            "Rebooting {} through {}",
            self.config.name,
            self.rebooter.name()
        );
        self.rebooter
            .reboot(&mut self.session, options)
    }

    /// Program the whole-device image.
    pub fn flash(&mut self, progress: &mut dyn FnMut(&str, u64, u64)) -> Result<()> {
        let Some(flasher) = self.flasher.as_mut() else {
            return Err(Error::Unsupported(format!(
                "target {} has no flash image",
                self.config.name
            )));
        };
        info!("Flashing {}", self.config.name);
        flasher.flash(&mut self.session, self.rebooter.as_mut(), progress)
    }

    /// Split borrow used by the bootloader stage: session plus loader.
    pub(crate) fn session_and_loader(&mut self) -> (&mut DeviceSession, Option<&mut dyn AppLoadable>) {
        let loader = self
            .loader
            .as_mut()
            .map(|l| l.as_mut() as &mut dyn AppLoadable);
        (&mut self.session, loader)
    }

    /// Close the session.
    pub fn close(&mut self) -> Result<()> {
        self.session
            .close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::FlashImageSpec;
    use crate::power::EmulatorRebooter;

    fn emulated() -> TargetConfig {
        TargetConfig::new(
            "ia32-generic-qemu",
            TargetKind::Emulated(ProcessConfig::new("sh").with_args(["-c", "echo booted; cat"])),
        )
    }

    #[test]
    fn test_config_defaults() {
        let config = emulated();
        assert!(config.is_emulated());
        assert_eq!(config.shell_prompt, SHELL_PROMPT);
        assert!(config.kernel_log_off.is_none());
    }

    #[test]
    fn test_open_emulated_target() {
        let mut target = Target::open(emulated(), Box::new(EmulatorRebooter)).unwrap();
        assert!(!target.can_load_apps());
        target
            .session()
            .expect_exact("booted", Duration::from_secs(5))
            .unwrap();
        assert!(matches!(target.flash(&mut |_, _, _| {}), Err(Error::Unsupported(_))));
        target.close().unwrap();
    }

    #[test]
    fn test_open_picks_plo_strategies() {
        let config = emulated()
            .with_phoenixd(PhoenixdConfig {
                port: "/dev/ttyACM1".into(),
                baud_rate: 115200,
                dir: PathBuf::from("/srv"),
            })
            .with_ram_window(RamWindow {
                device: "ram0".into(),
                offset: 0,
                size: 0x1000,
            })
            .with_flash_image(FlashImage::Plain(FlashImageSpec::new("disk.img", "usb0", "flash0")));
        let target = Target::open(config, Box::new(EmulatorRebooter)).unwrap();
        assert!(target.can_load_apps());
        assert!(target.flasher.is_some());
    }
}
