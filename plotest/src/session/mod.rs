//! Device session: one live transport plus the bytes read from it.
//!
//! Every protocol interaction in the crate goes through
//! [`DeviceSession::expect`], which reads incrementally from the transport
//! and scans the accumulated buffer after each read. Bytes that precede a
//! match are handed back in [`MatchResult::before`]; bytes after it stay
//! buffered for the next expectation.

pub mod expect;

use std::io::Write;
use std::time::{Duration, Instant};

use log::{debug, trace};

pub use self::expect::{MatchResult, Pattern};
use self::expect::{describe, find_earliest};
use crate::error::{Error, Result};
#[cfg(feature = "native")]
use crate::port::{NativePort, SerialConfig};
use crate::port::{Port, ProcessConfig, ProcessPort};

/// Line terminator understood by the bootloader and the OS shell.
pub const LINE_TERMINATOR: &str = "\r";

/// Upper bound of a single blocking read inside an expectation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read timeout while draining stale bytes.
const DRAIN_READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Overall bound of a drain, for devices that never stop talking.
const DRAIN_LIMIT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 1024;

/// Outcome of a single read attempt.
enum Fill {
    Data,
    Timeout,
    Eof,
}

/// A live connection to a device under test.
pub struct DeviceSession {
    port: Box<dyn Port>,
    buffer: Vec<u8>,
    log: Option<Box<dyn Write + Send>>,
    closed: bool,
}

impl DeviceSession {
    /// Wrap an already opened transport.
    pub fn new(port: Box<dyn Port>) -> Self {
        Self {
            port,
            buffer: Vec::new(),
            log: None,
            closed: false,
        }
    }

    /// Open a serial-backed session.
    #[cfg(feature = "native")]
    pub fn open_serial(config: &SerialConfig) -> Result<Self> {
        debug!(
            "Opening {} at {} baud",
            config.port_name, config.baud_rate
        );
        Ok(Self::new(Box::new(NativePort::open(config)?)))
    }

    /// Spawn a process-backed session (emulators).
    pub fn spawn(config: ProcessConfig) -> Result<Self> {
        debug!("Spawning {} {:?}", config.program, config.args);
        Ok(Self::new(Box::new(ProcessPort::spawn(config)?)))
    }

    /// Duplicate all traffic to `sink`.
    #[must_use]
    pub fn with_log(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.log = Some(sink);
        self
    }

    /// Replace (or remove) the traffic log sink.
    pub fn set_log(&mut self, sink: Option<Box<dyn Write + Send>>) {
        self.log = sink;
    }

    /// Name of the underlying transport.
    pub fn name(&self) -> &str {
        self.port.name()
    }

    /// Bytes read but not yet consumed by an expectation.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Write raw bytes.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        trace!("<< {:?}", String::from_utf8_lossy(data));
        self.port
            .write_all_bytes(data)?;
        self.log_bytes(data);
        Ok(())
    }

    /// Write `line` followed by [`LINE_TERMINATOR`].
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        let mut data = Vec::with_capacity(line.len() + LINE_TERMINATOR.len());
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(LINE_TERMINATOR.as_bytes());
        self.send(&data)
    }

    /// Wait until one of `patterns` shows up in the device output.
    ///
    /// The earliest match in the buffer wins; on a tie the pattern listed
    /// first wins. Fails with [`Error::StreamTimeout`] carrying everything
    /// received when nothing matches within `timeout`.
    pub fn expect(&mut self, patterns: &[Pattern], timeout: Duration) -> Result<MatchResult> {
        let start = Instant::now();
        loop {
            if let Some((index, found)) = find_earliest(&self.buffer, patterns) {
                let matched = self.buffer[found.start..found.end].to_vec();
                let before = self.buffer[..found.start].to_vec();
                self.buffer
                    .drain(..found.end);
                trace!("matched {:?} after {:?}", patterns[index], start.elapsed());
                return Ok(MatchResult {
                    index,
                    groups: found.groups,
                    before,
                    matched,
                });
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Error::StreamTimeout {
                    patterns: describe(patterns),
                    timeout,
                    before: String::from_utf8_lossy(&self.buffer).into_owned(),
                });
            }

            if let Fill::Eof = self.fill((timeout - elapsed).min(POLL_INTERVAL))? {
                return Err(Error::Eof {
                    patterns: describe(patterns),
                    before: String::from_utf8_lossy(&self.buffer).into_owned(),
                });
            }
        }
    }

    /// Wait for an exact piece of text.
    pub fn expect_exact(&mut self, text: &str, timeout: Duration) -> Result<MatchResult> {
        self.expect(&[Pattern::literal(text)], timeout)
    }

    /// Best-effort read of up to `max` bytes.
    ///
    /// Buffered bytes are returned first; otherwise a single read waits at
    /// most `timeout`. An empty result means nothing arrived.
    pub fn read_raw(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
        if self.buffer.is_empty() {
            self.fill(timeout)?;
        }
        let n = max.min(self.buffer.len());
        Ok(self.buffer
            .drain(..n)
            .collect())
    }

    /// Discard buffered and pending device output without matching it.
    pub fn clear_buffer(&mut self) -> Result<()> {
        self.buffer.clear();
        self.port
            .clear_buffers()?;

        let start = Instant::now();
        while start.elapsed() < DRAIN_LIMIT {
            match self.fill(DRAIN_READ_TIMEOUT)? {
                Fill::Data => {},
                Fill::Timeout | Fill::Eof => break,
            }
        }
        if !self.buffer.is_empty() {
            trace!("discarded {} stale bytes", self.buffer.len());
        }
        self.buffer.clear();
        Ok(())
    }

    /// Restart the transport (emulated targets reboot this way).
    pub fn reopen(&mut self) -> Result<()> {
        self.buffer.clear();
        self.port
            .reopen()?;
        self.closed = false;
        Ok(())
    }

    /// Release the transport. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(log) = self.log.as_mut() {
            let _ = log.flush();
        }
        self.port
            .close()
    }

    fn fill(&mut self, wait: Duration) -> Result<Fill> {
        self.port
            .set_timeout(wait.max(Duration::from_millis(1)))?;
        let mut chunk = [0u8; READ_CHUNK];
        match self.port.read(&mut chunk) {
            Ok(0) => Ok(Fill::Eof),
            Ok(n) => {
                trace!(">> {:?}", String::from_utf8_lossy(&chunk[..n]));
                self.buffer
                    .extend_from_slice(&chunk[..n]);
                self.log_bytes(&chunk[..n]);
                Ok(Fill::Data)
            },
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Fill::Timeout)
            },
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn log_bytes(&mut self, data: &[u8]) {
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.write_all(data) {
                trace!("session log write failed: {e}");
            }
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Closing session failed: {e}");
        }
    }
}
