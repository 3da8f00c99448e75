//! Supervised helper processes.
//!
//! Flashing needs phoenixd serving files over the device link, debugger
//! resets need openocd. Both are started the same way: spawn the helper in
//! its own process group, let one reader thread drain its output, and block
//! the caller until the helper prints its readiness marker.
//!
//! ```text
//!   owner                         reader thread
//!     | spawn ------------------------> |
//!     |                                 |  append output
//!     |                                 |  marker seen?
//!     | <------------- ready (once) --- |
//!     |                                 |  keep draining
//!     | kill: TERM group, join, KILL    |
//! ```
//!
//! The output buffer is only appended to by the reader; the owner reads it
//! for diagnostics.

use {
    crate::{
        error::{Error, Result},
        port::process::{join_with_timeout, signal_group, spawn_merged, wait_with_timeout},
    },
    log::{debug, info, warn},
    nix::sys::signal::Signal,
    std::{
        io::Read,
        path::{Path, PathBuf},
        process::{Child, ExitStatus},
        sync::{
            Arc, Mutex, PoisonError,
            mpsc::{self, RecvTimeoutError},
        },
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Step of the device path poll.
const PATH_POLL_STEP: Duration = Duration::from_millis(10);

/// Shortest wait for the child after the reader thread was joined.
const EXIT_GRACE: Duration = Duration::from_millis(50);

/// Readiness line printed by phoenixd, without the port.
pub const PHOENIXD_MARKER: &str = "Starting message dispatcher on";

/// Readiness line printed by openocd.
pub const OPENOCD_MARKER: &str = "Listening on port 3333 for gdb connections";

/// How to start a helper and how to tell it is ready.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Program to run.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Literal text the helper prints once it is ready.
    pub ready_marker: String,
    /// Longest wait for the marker.
    pub ready_timeout: Duration,
    /// Device node that must exist before the helper is started.
    pub wait_for_path: Option<PathBuf>,
    /// Longest wait for `wait_for_path`.
    pub path_timeout: Duration,
    /// Bound on the graceful stop before the group is killed.
    pub stop_timeout: Duration,
}

impl ServiceSpec {
    /// Helper `program` that is ready once it prints `ready_marker`.
    pub fn new(program: impl Into<String>, ready_marker: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            ready_marker: ready_marker.into(),
            ready_timeout: Duration::from_secs(10),
            wait_for_path: None,
            path_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
        }
    }

    /// phoenixd serving files from `dir` over `port`.
    pub fn phoenixd(port: &str, baud_rate: u32, dir: &Path) -> Self {
        Self::new("phoenixd", format!("{PHOENIXD_MARKER} [{port}]"))
            .with_args(["-p", port, "-b", &baud_rate.to_string(), "-s", "."])
            .with_cwd(dir)
            .with_wait_for_path(port, Duration::from_secs(10))
    }

    /// openocd with the given command line.
    pub fn openocd<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("openocd", OPENOCD_MARKER).with_args(args)
    }

    /// Set the arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args
            .into_iter()
            .map(Into::into)
            .collect();
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set the readiness bound.
    #[must_use]
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Wait for `path` to exist (at most `timeout`) before spawning.
    #[must_use]
    pub fn with_wait_for_path(mut self, path: impl Into<PathBuf>, timeout: Duration) -> Self {
        self.wait_for_path = Some(path.into());
        self.path_timeout = timeout;
        self
    }

    /// Set the graceful stop bound.
    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// A running helper process.
pub struct BackgroundService {
    program: String,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    output: Arc<Mutex<Vec<u8>>>,
    stop_timeout: Duration,
    forced_kills: usize,
}

impl BackgroundService {
    /// Start the helper and block until it is ready.
    ///
    /// On timeout, or when the helper exits first, it is killed and the
    /// captured output is returned inside the error.
    pub fn run(spec: &ServiceSpec) -> Result<Self> {
        if let Some(path) = &spec.wait_for_path {
            wait_for_path(&spec.program, path, spec.path_timeout)?;
        }

        let (child, mut pipe) = spawn_merged(&spec.program, &spec.args, spec.cwd.as_deref(), false)
            .map_err(|e| Error::BackgroundService {
                program: spec.program.clone(),
                reason: format!("spawn failed: {e}"),
                output: String::new(),
            })?;

        let output = Arc::new(Mutex::new(Vec::new()));
        let mut service = Self {
            program: spec
                .program
                .clone(),
            child: Some(child),
            reader: None,
            output: Arc::clone(&output),
            stop_timeout: spec.stop_timeout,
            forced_kills: 0,
        };

        let (ready_tx, ready_rx) = mpsc::sync_channel::<()>(1);
        let marker = spec
            .ready_marker
            .as_bytes()
            .to_vec();
        let sink = output;
        let reader = thread::Builder::new()
            .name(format!("plotest-{}", spec.program))
            .spawn(move || {
                let mut ready_tx = Some(ready_tx);
                let mut chunk = [0u8; 4096];
                loop {
                    let n = match pipe.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let mut buf = sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    let scan_from = buf
                        .len()
                        .saturating_sub(marker.len());
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(tx) = ready_tx.take_if(|_| contains(&buf[scan_from..], &marker)) {
                        let _ = tx.send(());
                    }
                }
            })?;
        service.reader = Some(reader);

        let start = Instant::now();
        let reason = match ready_rx.recv_timeout(spec.ready_timeout) {
            Ok(()) => {
                info!(
                    "{} ready after {:?}",
                    spec.program,
                    start.elapsed()
                );
                return Ok(service);
            },
            Err(RecvTimeoutError::Timeout) => {
                format!("not ready within {:?}", spec.ready_timeout)
            },
            Err(RecvTimeoutError::Disconnected) => "exited before becoming ready".to_string(),
        };

        let status = service.kill_quietly();
        let reason = match status {
            Some(status) if !status.success() => format!("{reason} ({status})"),
            _ => reason,
        };
        Err(Error::BackgroundService {
            program: spec.program.clone(),
            reason,
            output: service.output(),
        })
    }

    /// Run `f` with the helper alive; the helper is killed afterwards
    /// whether `f` succeeded or not.
    pub fn scoped<T>(spec: &ServiceSpec, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let mut service = Self::run(spec)?;
        let result = f(&mut service);
        let stopped = service.kill();
        if result.is_err() {
            debug!("{} output:\n{}", service.program, service.output());
        }
        let value = result?;
        stopped?;
        Ok(value)
    }

    /// Everything the helper printed so far.
    pub fn output(&self) -> String {
        let buf = self
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Process id while the helper is running.
    pub fn pid(&self) -> Option<u32> {
        self.child
            .as_ref()
            .map(Child::id)
    }

    /// Number of times the helper had to be killed forcefully.
    pub fn forced_kills(&self) -> usize {
        self.forced_kills
    }

    /// Wait for the helper to exit on its own.
    pub fn wait_exit(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => Ok(wait_with_timeout(child, timeout)?),
            None => Ok(None),
        }
    }

    /// Stop the helper. Safe to call more than once.
    ///
    /// Fails when the helper had already exited with a non-zero status.
    pub fn kill(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let early = child.try_wait()?;
        let status = self.stop(&mut child)?;
        debug!("{} stopped: {status}", self.program);

        match early {
            Some(status) if !status.success() => Err(Error::BackgroundService {
                program: self.program.clone(),
                reason: format!("exited with {status}"),
                output: self.output(),
            }),
            _ => Ok(()),
        }
    }

    fn kill_quietly(&mut self) -> Option<ExitStatus> {
        let mut child = self.child.take()?;
        match self.stop(&mut child) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Stopping {} failed: {e}", self.program);
                None
            },
        }
    }

    fn stop(&mut self, child: &mut Child) -> Result<ExitStatus> {
        let deadline = Instant::now() + self.stop_timeout;
        signal_group(child, Signal::SIGTERM);

        if let Some(handle) = self.reader.take() {
            if let Err(handle) = join_with_timeout(handle, self.stop_timeout) {
                self.reader = Some(handle);
            }
        }
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(EXIT_GRACE);
        if let Some(status) = wait_with_timeout(child, remaining)? {
            return Ok(status);
        }

        warn!(
            "{} (pid {}) ignored SIGTERM for {:?}, killing it",
            self.program,
            child.id(),
            self.stop_timeout
        );
        signal_group(child, Signal::SIGKILL);
        self.forced_kills += 1;
        let status = child.wait()?;

        if let Some(handle) = self.reader.take() {
            if join_with_timeout(handle, self.stop_timeout).is_err() {
                warn!("{} output reader did not finish, detaching it", self.program);
            }
        }
        Ok(status)
    }
}

impl Drop for BackgroundService {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.kill_quietly();
        }
    }
}

fn wait_for_path(program: &str, path: &Path, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() >= timeout {
            return Err(Error::BackgroundService {
                program: program.to_string(),
                reason: format!("{} did not appear within {timeout:?}", path.display()),
                output: String::new(),
            });
        }
        thread::sleep(PATH_POLL_STEP);
    }
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty()
        || haystack
            .windows(needle.len())
            .any(|w| w == needle)
}
