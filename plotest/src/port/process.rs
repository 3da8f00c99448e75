//! Process-backed port used for emulated targets.
//!
//! The emulator's console is its stdin plus its merged stdout/stderr. A
//! reader thread drains the output pipe into a channel so that reads can
//! honour a timeout the same way a serial port does.

use {
    crate::{error::Result, port::Port},
    log::{debug, trace, warn},
    nix::{
        sys::signal::{Signal, killpg},
        unistd::Pid,
    },
    std::{
        io::{self, PipeReader, Read, Write},
        os::unix::process::CommandExt,
        path::{Path, PathBuf},
        process::{Child, ChildStdin, Command, ExitStatus, Stdio},
        sync::mpsc::{self, Receiver, RecvTimeoutError},
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Read chunk size of the output reader thread.
const READ_CHUNK: usize = 4096;

/// Poll step while waiting for a child or a thread to finish.
const POLL_STEP: Duration = Duration::from_millis(10);

/// Configuration of a spawned process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Program to run.
    pub program: String,
    /// Command-line arguments.
    pub args: Vec<String>,
    /// Working directory (inherited when `None`).
    pub cwd: Option<PathBuf>,
    /// Grace period between the terminate and the kill signal on stop.
    pub stop_timeout: Duration,
}

impl ProcessConfig {
    /// Create a configuration for `program` without arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stop_timeout: Duration::from_secs(5),
        }
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

    /// Set the stop grace period.
    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// Spawn `program` in its own process group with stdout and stderr merged
/// into one pipe.
pub(crate) fn spawn_merged(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    with_stdin: bool,
) -> io::Result<(Child, PipeReader)> {
    let (reader, writer) = io::pipe()?;
    let writer_err = writer.try_clone()?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if with_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(writer)
        .stderr(writer_err)
        .process_group(0);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let child = command.spawn()?;
    // The command owns our copies of the write end; EOF on `reader` must
    // only depend on the child.
    drop(command);
    debug!("Spawned {program} (pid {})", child.id());
    Ok((child, reader))
}

/// Send `signal` to the whole process group led by `child`.
pub(crate) fn signal_group(child: &Child, signal: Signal) {
    let Ok(raw) = i32::try_from(child.id()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        trace!("killpg({raw}, {signal}) failed: {e}");
    }
}

/// Wait until `child` exits or `timeout` elapses.
pub(crate) fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        thread::sleep(POLL_STEP);
    }
}

/// Wait until the thread behind `handle` finishes or `timeout` elapses.
///
/// Returns the handle back when the thread is still running.
pub(crate) fn join_with_timeout<T>(handle: JoinHandle<T>, timeout: Duration) -> std::result::Result<Option<T>, JoinHandle<T>> {
    let start = Instant::now();
    while !handle.is_finished() {
        if start.elapsed() >= timeout {
            return Err(handle);
        }
        thread::sleep(POLL_STEP);
    }
    Ok(handle
        .join()
        .ok())
}

/// Terminate the process group of `child`, escalating to a kill after `grace`.
///
/// Returns the exit status and whether the kill signal was needed.
pub(crate) fn stop_child(child: &mut Child, grace: Duration) -> io::Result<(ExitStatus, bool)> {
    if let Some(status) = child.try_wait()? {
        return Ok((status, false));
    }

    signal_group(child, Signal::SIGTERM);
    if let Some(status) = wait_with_timeout(child, grace)? {
        return Ok((status, false));
    }

    warn!(
        "Process {} ignored SIGTERM for {grace:?}, killing it",
        child.id()
    );
    signal_group(child, Signal::SIGKILL);
    Ok((child.wait()?, true))
}

/// A running child together with its console plumbing.
struct Console {
    child: Child,
    stdin: Option<ChildStdin>,
    rx: Receiver<Vec<u8>>,
    reader: JoinHandle<()>,
}

/// Process-backed port.
pub struct ProcessPort {
    config: ProcessConfig,
    console: Option<Console>,
    pending: Vec<u8>,
    timeout: Duration,
}

impl ProcessPort {
    /// Spawn the process described by `config`.
    pub fn spawn(config: ProcessConfig) -> Result<Self> {
        let mut port = Self {
            config,
            console: None,
            pending: Vec::new(),
            timeout: Duration::from_millis(100),
        };
        port.start()?;
        Ok(port)
    }

    /// Process id of the running child, if any.
    pub fn pid(&self) -> Option<u32> {
        self.console
            .as_ref()
            .map(|c| c.child.id())
    }

    fn start(&mut self) -> Result<()> {
        let (mut child, mut output) = spawn_merged(
            &self.config.program,
            &self.config.args,
            self.config.cwd.as_deref(),
            true,
        )?;
        let stdin = child.stdin.take();

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let reader = thread::Builder::new()
            .name(format!("plotest-console-{}", child.id()))
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match output.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        },
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                        Err(_) => break,
                    }
                }
            })?;

        self.pending.clear();
        self.console = Some(Console {
            child,
            stdin,
            rx,
            reader,
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(mut console) = self.console.take() else {
            return Ok(());
        };
        // Closing stdin first lets well-behaved programs exit on their own.
        drop(console.stdin.take());
        let (status, forced) = stop_child(&mut console.child, self.config.stop_timeout)?;
        debug!(
            "{} stopped with {status}{}",
            self.config.program,
            if forced { " (killed)" } else { "" }
        );
        if join_with_timeout(console.reader, self.config.stop_timeout).is_err() {
            warn!(
                "Console reader of {} still running, detaching it",
                self.config.program
            );
        }
        self.pending.clear();
        Ok(())
    }

    fn closed() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "process port closed")
    }
}

impl Port for ProcessPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.pending.clear();
        if let Some(console) = &self.console {
            while console.rx.try_recv().is_ok() {}
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.config.program
    }

    fn reopen(&mut self) -> Result<()> {
        debug!("Restarting {}", self.config.program);
        self.stop()?;
        self.start()
    }

    fn close(&mut self) -> Result<()> {
        self.stop()
    }
}

impl Read for ProcessPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            let console = self
                .console
                .as_ref()
                .ok_or_else(Self::closed)?;
            match console.rx.recv_timeout(self.timeout) {
                Ok(chunk) => self.pending = chunk,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no output"));
                },
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

impl Write for ProcessPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.console
            .as_mut()
            .and_then(|c| c.stdin.as_mut())
            .ok_or_else(Self::closed)?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self
            .console
            .as_mut()
            .and_then(|c| c.stdin.as_mut())
        {
            Some(stdin) => stdin.flush(),
            None => Err(Self::closed()),
        }
    }
}

impl Drop for ProcessPort {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop {}: {e}", self.config.program);
        }
    }
}
