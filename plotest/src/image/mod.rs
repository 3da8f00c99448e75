//! Descriptions of what gets programmed into, or preloaded onto, a device.
//!
//! These are plain data: the bootloader client and the flash strategies read
//! them, the CLI deserializes them from its configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Whole-device OS image and how the bootloader reaches it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FlashImageSpec {
    /// Image file on the host, served to the bootloader by phoenixd.
    pub file: PathBuf,
    /// Bootloader device the image is read from (for example `usb0`).
    pub source_id: String,
    /// Bootloader device the image is written to (for example `flash0`).
    pub memory_bank: String,
}

impl FlashImageSpec {
    /// Describe an image copied from `source_id` into `memory_bank`.
    pub fn new(file: impl Into<PathBuf>, source_id: &str, memory_bank: &str) -> Self {
        Self {
            file: file.into(),
            source_id: source_id.to_string(),
            memory_bank: memory_bank.to_string(),
        }
    }

    /// Name under which phoenixd serves the image.
    pub fn file_name(&self) -> String {
        served_name(&self.file)
    }
}

/// Block layout used to pre-condition a jffs2 partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CleanmarkerGeometry {
    /// First erase block of the partition.
    pub start_block: u32,
    /// Number of erase blocks to format.
    pub block_count: u32,
    /// Erase block size in bytes.
    pub block_size: u32,
    /// Cleanmarker size in bytes.
    pub marker_size: u32,
}

impl CleanmarkerGeometry {
    /// Byte offset of the first block.
    pub fn offset(&self) -> u64 {
        u64::from(self.start_block) * u64::from(self.block_size)
    }

    /// Byte size of the formatted range.
    pub fn size(&self) -> u64 {
        u64::from(self.block_count) * u64::from(self.block_size)
    }
}

/// Image whose filesystem has to be erased and formatted before programming.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct JffsFlashImageSpec {
    /// Where the image comes from and goes to.
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub image: FlashImageSpec,
    /// Flash device id passed to `jffs2 -d`.
    pub flash_device_id: String,
    /// Partition geometry.
    pub cleanmarker: CleanmarkerGeometry,
    /// Longest gap allowed between two block progress lines.
    #[cfg_attr(feature = "serde", serde(with = "duration_secs"))]
    pub per_block_timeout: Duration,
}

/// A device image of either kind.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "lowercase"))]
pub enum FlashImage {
    /// Copied as is.
    Plain(FlashImageSpec),
    /// Erased and formatted first.
    Jffs(JffsFlashImageSpec),
}

impl FlashImage {
    /// The copy part shared by both kinds.
    pub fn spec(&self) -> &FlashImageSpec {
        match self {
            Self::Plain(spec) => spec,
            Self::Jffs(jffs) => &jffs.image,
        }
    }
}

/// One application registered in the syspage before the OS boots.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AppLoadSpec {
    /// Binary on the host, served by phoenixd.
    pub file: PathBuf,
    /// Bootloader device the binary is read from.
    pub source_id: String,
    /// Instruction memory map.
    pub imap: String,
    /// Data memory map.
    pub dmap: String,
    /// Start the application once the OS is up.
    #[cfg_attr(feature = "serde", serde(default = "default_executable"))]
    pub executable: bool,
}

#[cfg(feature = "serde")]
fn default_executable() -> bool {
    true
}

impl AppLoadSpec {
    /// Executable application mapped into `map` for both code and data.
    pub fn new(file: impl Into<PathBuf>, source_id: &str, map: &str) -> Self {
        Self {
            file: file.into(),
            source_id: source_id.to_string(),
            imap: map.to_string(),
            dmap: map.to_string(),
            executable: true,
        }
    }

    /// Name under which phoenixd serves the binary and the alias it gets.
    pub fn file_name(&self) -> String {
        served_name(&self.file)
    }
}

fn served_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(
            || path.to_string_lossy().into_owned(),
            |name| name.to_string_lossy().into_owned(),
        )
}

#[cfg(feature = "serde")]
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_range() {
        let geometry = CleanmarkerGeometry {
            start_block: 2,
            block_count: 4,
            block_size: 0x1_0000,
            marker_size: 16,
        };
        assert_eq!(geometry.offset(), 0x2_0000);
        assert_eq!(geometry.size(), 0x4_0000);
    }

    #[test]
    fn test_served_name_strips_directories() {
        let app = AppLoadSpec::new("/opt/build/prog/psh", "usb0", "ocram2");
        assert_eq!(app.file_name(), "psh");
        assert!(app.executable);

        let image = FlashImageSpec::new("phoenix.disk", "usb0", "flash0");
        assert_eq!(image.file_name(), "phoenix.disk");
        assert_eq!(FlashImage::Plain(image.clone()).spec(), &image);
    }
}
