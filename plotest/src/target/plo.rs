//! Flash and preload strategies built on the plo client and phoenixd.

use {
    super::{AppLoadable, Flashable, RamWindow},
    crate::{
        error::{Error, Result},
        image::{AppLoadSpec, FlashImage},
        power::{RebootOptions, Rebootable},
        protocol::plo::PloClient,
        service::{BackgroundService, ServiceSpec},
        session::DeviceSession,
    },
    log::{debug, info},
    std::{fs, time::Duration},
};

/// Staged applications start on page boundaries.
pub const PAGE_SIZE: u64 = 0x1000;

/// Default bound on copying the whole-device image.
const IMAGE_COPY_TIMEOUT: Duration = Duration::from_secs(600);

/// Default bound on copying one application into RAM.
const APP_COPY_TIMEOUT: Duration = Duration::from_secs(60);

/// Run `f` with phoenixd alive and turn any failure into [`Error::Flash`]
/// carrying phoenixd's output.
fn with_phoenixd<T>(spec: &ServiceSpec, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let mut phoenixd = BackgroundService::run(spec).map_err(|e| e.into_flash(""))?;
    let result = f();
    let output = phoenixd.output();
    let stopped = phoenixd.kill();
    let value = result.map_err(|e| e.into_flash(&output))?;
    stopped.map_err(|e| e.into_flash(&output))?;
    Ok(value)
}

fn file_size(path: &std::path::Path) -> Result<u64> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| Error::Flash {
            message: format!("cannot read {}: {e}", path.display()),
            output: String::new(),
        })
}

/// Programs a [`FlashImage`] through plo.
pub struct PloFlasher {
    image: FlashImage,
    phoenixd: ServiceSpec,
    copy_timeout: Duration,
}

impl PloFlasher {
    /// Flash `image`, served by the given phoenixd.
    pub fn new(image: FlashImage, phoenixd: ServiceSpec) -> Self {
        Self {
            image,
            phoenixd,
            copy_timeout: IMAGE_COPY_TIMEOUT,
        }
    }

    /// Override the image copy bound.
    #[must_use]
    pub fn with_copy_timeout(mut self, timeout: Duration) -> Self {
        self.copy_timeout = timeout;
        self
    }

    fn program(&self, plo: &mut PloClient<'_>, progress: &mut dyn FnMut(&str, u64, u64)) -> Result<()> {
        let spec = self.image.spec();
        let size = file_size(&spec.file)?;

        if let FlashImage::Jffs(jffs) = &self.image {
            let geometry = jffs.cleanmarker;
            progress("erase", 0, geometry.size());
            let erase_timeout = jffs
                .per_block_timeout
                .checked_mul(geometry.block_count)
                .ok_or_else(|| Error::Flash {
                    message: format!(
                        "erase timeout of {} blocks at {:?} each overflows",
                        geometry.block_count, jffs.per_block_timeout
                    ),
                    output: String::new(),
                })?;
            plo.erase(&spec.memory_bank, geometry.offset(), geometry.size(), erase_timeout)?;
            progress("erase", geometry.size(), geometry.size());
            plo.format_filesystem(jffs, &mut |done, total| {
                progress("format", u64::from(done), u64::from(total));
            })?;
        }

        progress("copy", 0, size);
        plo.copy_file_to_memory(
            &spec.source_id,
            &spec.file_name(),
            &spec.memory_bank,
            0,
            size,
            self.copy_timeout,
        )?;
        progress("copy", size, size);
        Ok(())
    }
}

impl Flashable for PloFlasher {
    fn flash(
        &mut self,
        session: &mut DeviceSession,
        rebooter: &mut dyn Rebootable,
        progress: &mut dyn FnMut(&str, u64, u64),
    ) -> Result<()> {
        rebooter.reboot(session, RebootOptions::FLASH)?;
        let mut plo = PloClient::new(session)?;
        plo.enter_bootloader()
            .map_err(|e| e.into_flash(""))?;
        with_phoenixd(&self.phoenixd, || self.program(&mut plo, progress))?;
        info!("Flashed {}", self.image.spec().file.display());
        Ok(())
    }
}

/// Stages applications in a RAM window and registers them with `app`.
pub struct PloAppLoader {
    ram: RamWindow,
    phoenixd: ServiceSpec,
    copy_timeout: Duration,
}

impl PloAppLoader {
    /// Stage applications in `ram`, served by the given phoenixd.
    pub fn new(ram: RamWindow, phoenixd: ServiceSpec) -> Self {
        Self {
            ram,
            phoenixd,
            copy_timeout: APP_COPY_TIMEOUT,
        }
    }

    fn window_end(&self) -> Result<u64> {
        self.ram
            .offset
            .checked_add(self.ram.size)
            .ok_or_else(|| {
                Error::Config(format!(
                    "RAM window {} at {:#x} with size {:#x} exceeds the address space",
                    self.ram.device, self.ram.offset, self.ram.size
                ))
            })
    }

    fn stage(&self, plo: &mut PloClient<'_>, apps: &[AppLoadSpec], end: u64) -> Result<()> {
        let mut offset = self.ram.offset;
        for app in apps {
            let size = file_size(&app.file)?;
            let app_end = offset
                .checked_add(size)
                .filter(|&app_end| app_end <= end);
            let Some(app_end) = app_end else {
                return Err(Error::Flash {
                    message: format!(
                        "{} ({size:#x} bytes at {offset:#x}) does not fit in {} ending at {end:#x}",
                        app.file.display(),
                        self.ram.device
                    ),
                    output: String::new(),
                });
            };
            let name = app.file_name();
            debug!("Staging {name} at {offset:#x}");
            plo.copy_file_to_memory(
                &app.source_id,
                &name,
                &self.ram.device,
                offset,
                size,
                self.copy_timeout,
            )?;
            plo.alias(&name, offset, size)?;
            plo.load_app(&self.ram.device, &name, &app.imap, &app.dmap, app.executable)?;
            offset = app_end
                .checked_next_multiple_of(PAGE_SIZE)
                .unwrap_or(u64::MAX);
        }
        Ok(())
    }
}

impl AppLoadable for PloAppLoader {
    fn load_apps(&mut self, plo: &mut PloClient<'_>, apps: &[AppLoadSpec]) -> Result<()> {
        if apps.is_empty() {
            return Ok(());
        }
        let end = self.window_end()?;
        info!("Preloading {} application(s)", apps.len());
        with_phoenixd(&self.phoenixd, || self.stage(plo, apps, end))
    }
}
