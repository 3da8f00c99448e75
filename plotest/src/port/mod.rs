//! Transport abstraction for device sessions.
//!
//! A device under test is reached either through a serial line (physical
//! boards) or through the console of a spawned process (emulators). Both are
//! exposed through the same [`Port`] trait so that the session and protocol
//! layers never care which one they talk to.
//!
//! ```text
//! +--------------------------+
//! |  Bootloader / Harness    |
//! +------------+-------------+
//!              |
//!              v
//! +------------+-------------+
//! |      DeviceSession       |
//! +------------+-------------+
//!              |
//!              v
//! +------------+-------------+
//! |        Port trait        |
//! +-------+-----------+------+
//!         |           |
//!         v           v
//! +-------+----+ +----+--------+
//! | NativePort | | ProcessPort |
//! | serialport | |  emulator   |
//! +------------+ +-------------+
//! ```

#[cfg(test)]
pub(crate) mod mock;
#[cfg(feature = "native")]
pub mod native;
pub mod process;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// Line settings of a physical board console.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Device node, e.g. `/dev/ttyACM0`.
    pub port_name: String,
    /// Line speed.
    pub baud_rate: u32,
    /// Timeout of a single read or write.
    pub timeout: Duration,
}

/// Read timeout a fresh [`SerialConfig`] starts with.
pub const SERIAL_TIMEOUT: Duration = Duration::from_millis(100);

impl SerialConfig {
    /// 8N1 line at `baud_rate` with the default timeout.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: SERIAL_TIMEOUT,
        }
    }
}

/// A serial device found on the host, with its USB identity when it has one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Device node.
    pub name: String,
    /// USB vendor ID.
    pub vid: Option<u16>,
    /// USB product ID.
    pub pid: Option<u16>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
    /// USB product string.
    pub product: Option<String>,
    /// USB serial number.
    pub serial_number: Option<String>,
}

/// Byte transport to a device under test.
///
/// Reads must honour the configured timeout: a read that sees no data within
/// it returns an [`std::io::ErrorKind::TimedOut`] error, and `Ok(0)` means
/// the transport is gone for good.
pub trait Port: Read + Write + Send {
    /// Set the timeout of a single read.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current read timeout.
    fn timeout(&self) -> Duration;

    /// Discard whatever the transport itself has buffered.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path (or the spawned program for process ports).
    fn name(&self) -> &str;

    /// Tear the transport down and bring it up again.
    ///
    /// For an emulator this restarts the process, which is a reboot. For a
    /// serial line it waits for the device node to reappear after the board
    /// reset, as USB consoles do.
    fn reopen(&mut self) -> Result<()> {
        Err(Error::Unsupported(format!(
            "transport {} cannot be reopened",
            self.name()
        )))
    }

    /// Close the port and release resources.
    ///
    /// Closing twice is allowed; the second call does nothing.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        (**self).set_timeout(timeout)
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn clear_buffers(&mut self) -> Result<()> {
        (**self).clear_buffers()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn reopen(&mut self) -> Result<()> {
        (**self).reopen()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Source of the serial devices a physical target may sit behind.
pub trait PortEnumerator {
    /// Every serial device currently present.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
pub use process::{ProcessConfig, ProcessPort};
