//! Reboots performed by a person at the bench.

use std::io::{self, BufRead, BufReader, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use log::{debug, info};

use super::{RebootOptions, Rebootable};
use crate::error::{Error, Result};
use crate::session::DeviceSession;

/// Default wait for the operator.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);

/// Asks the operator to reboot the board and waits for Enter.
///
/// Input lines are read on a dedicated thread so that the wait can be
/// bounded; lines typed between two reboots are discarded.
pub struct InteractiveRebooter {
    lines: Receiver<String>,
    out: Box<dyn Write + Send>,
    timeout: Duration,
}

impl InteractiveRebooter {
    /// Prompt on stderr, confirm on stdin.
    pub fn stdio() -> Result<Self> {
        Self::from_reader(BufReader::new(io::stdin()), Box::new(io::stderr()))
    }

    /// Prompt on `out`, confirm on `input`.
    pub fn from_reader<R>(input: R, out: Box<dyn Write + Send>) -> Result<Self>
    where
        R: BufRead + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("plotest-operator".to_string())
            .spawn(move || {
                for line in input.lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self {
            lines: rx,
            out,
            timeout: CONFIRM_TIMEOUT,
        })
    }

    /// Override the confirmation bound.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Rebootable for InteractiveRebooter {
    fn reboot(&mut self, session: &mut DeviceSession, options: RebootOptions) -> Result<()> {
        while let Ok(stale) = self.lines.try_recv() {
            debug!("Ignoring operator input {stale:?}");
        }
        session.clear_buffer()?;

        let action = if options.hard {
            "Power cycle"
        } else {
            "Reset"
        };
        let mode = if options.flash {
            " with the boot switch in serial download position"
        } else {
            ""
        };
        writeln!(
            self.out,
            "{action} the board{mode}, then press Enter ({}s)",
            self.timeout.as_secs()
        )?;
        self.out.flush()?;

        match self.lines.recv_timeout(self.timeout) {
            Ok(_) => {
                info!("Operator confirmed the reboot");
                Ok(())
            },
            Err(RecvTimeoutError::Timeout) => Err(Error::Reboot(format!(
                "reboot not confirmed within {:?}",
                self.timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Reboot(
                "operator input closed before the reboot was confirmed".to_string(),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "interactive"
    }
}
