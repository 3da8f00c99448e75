//! Client for the plo bootloader console.
//!
//! plo speaks a line oriented ASCII protocol over the device console:
//!
//! ```text
//! host                          device
//!  |                              |  "Waiting for input"
//!  |  "\r"  -------------------->  |
//!  |                              |  "(plo)% "
//!  |  "<command>\r" ------------>  |
//!  |                              |  "<command>"        (echo)
//!  |                              |  ...output...
//!  |                              |  "(plo)% "          (ESC[31m before it on error)
//! ```
//!
//! Every command is checked for its exact echo before its output is
//! interpreted, and a prompt that follows the red error colour is treated as
//! a failure even though the prompt itself matched.

use {
    crate::{
        error::{Error, Result},
        image::JffsFlashImageSpec,
        session::{DeviceSession, MatchResult, Pattern},
    },
    log::{debug, info, trace},
    std::{fmt, time::Duration},
};

/// Bootloader prompt.
pub const PROMPT: &str = "(plo)% ";
/// Banner printed while plo counts down to the default boot.
pub const BANNER: &str = "Waiting for input";
/// Warning printed before a destructive erase.
pub const DATA_LOSS_WARNING: &str = "Serious risk of data loss, type YES! to proceed.";
/// Token confirming a destructive erase.
pub const CONFIRMATION: &str = "YES!";
/// Printed once an erase has completed.
pub const ERASED: &str = "Erased";
/// Colour escape plo prints in front of error messages.
pub const ERROR_MARKER: &[u8] = b"\x1b[31m";

/// Default wait for the prompt.
pub const PROMPT_TIMEOUT: Duration = Duration::from_secs(8);
/// Wait for a command echo.
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(4);
/// Wait for the data loss warning after an erase command.
pub const ERASE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(8);
/// Wait for `app` to finish; preloading can be slow.
pub const APP_TIMEOUT: Duration = Duration::from_secs(30);
/// Wait for `alias` to finish.
pub const ALIAS_TIMEOUT: Duration = Duration::from_secs(4);
/// Wait for the countdown banner.
pub const BANNER_TIMEOUT: Duration = Duration::from_secs(5);

const BLOCK_PROGRESS: &str = r"block (?P<index>\d+)/(?P<count>\d+)\D";

/// A plo command line.
///
/// The rendered text is what gets sent and what the echo is compared with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PloCommand {
    /// `erase <device> <offset> <size>`
    Erase {
        /// Flash device.
        device: String,
        /// First byte to erase.
        offset: u64,
        /// Number of bytes.
        size: u64,
    },
    /// `jffs2 -d <device> -e -c <start>:<count>:<block size>:<marker size>`
    Jffs2Format {
        /// Flash device id.
        device: String,
        /// Erase the blocks before writing cleanmarkers.
        erase: bool,
        /// First block.
        start_block: u32,
        /// Number of blocks.
        block_count: u32,
        /// Block size in bytes.
        block_size: u32,
        /// Cleanmarker size in bytes.
        marker_size: u32,
    },
    /// `app <device> [-x]<file> <imap> <dmap>`
    App {
        /// Device holding the binary.
        device: String,
        /// File or alias name.
        file: String,
        /// Instruction map.
        imap: String,
        /// Data map.
        dmap: String,
        /// Start the application after boot.
        executable: bool,
    },
    /// `copy <src> <src obj> [<size>] <dst> <dst obj> [<size>]`
    Copy {
        /// Source device.
        src: String,
        /// File name or offset on the source.
        src_obj: String,
        /// Bytes to read, if not the whole object.
        src_size: Option<u64>,
        /// Destination device.
        dst: String,
        /// File name or offset on the destination.
        dst_obj: String,
        /// Bytes available at the destination.
        dst_size: Option<u64>,
    },
    /// `alias <name> <offset> <size>`
    Alias {
        /// Alias name, later used as a file name by `app`.
        name: String,
        /// Region start.
        offset: u64,
        /// Region size.
        size: u64,
    },
    /// `go!`
    Go,
}

impl fmt::Display for PloCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Erase {
                device,
                offset,
                size,
            } => write!(f, "erase {device} {offset:#x} {size:#x}"),
            Self::Jffs2Format {
                device,
                erase,
                start_block,
                block_count,
                block_size,
                marker_size,
            } => {
                write!(f, "jffs2 -d {device}")?;
                if *erase {
                    f.write_str(" -e")?;
                }
                write!(
                    f,
                    " -c {start_block:#x}:{block_count:#x}:{block_size:#x}:{marker_size:#x}"
                )
            },
            Self::App {
                device,
                file,
                imap,
                dmap,
                executable,
            } => {
                let flag = if *executable { "-x" } else { "" };
                write!(f, "app {device} {flag}{file} {imap} {dmap}")
            },
            Self::Copy {
                src,
                src_obj,
                src_size,
                dst,
                dst_obj,
                dst_size,
            } => {
                write!(f, "copy {src} {src_obj}")?;
                if let Some(size) = src_size {
                    write!(f, " {size:#x}")?;
                }
                write!(f, " {dst} {dst_obj}")?;
                if let Some(size) = dst_size {
                    write!(f, " {size:#x}")?;
                }
                Ok(())
            },
            Self::Alias { name, offset, size } => write!(f, "alias {name} {offset:#x} {size:#x}"),
            Self::Go => f.write_str("go!"),
        }
    }
}

/// Where the client believes the bootloader is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PloState {
    /// Counting down, not interrupted yet.
    AwaitingInterrupt,
    /// At the prompt, ready for a command.
    PromptReady,
    /// A command is running.
    Busy,
    /// Control was handed to the OS.
    Exited,
}

/// Command/response client over a borrowed [`DeviceSession`].
pub struct PloClient<'a> {
    session: &'a mut DeviceSession,
    state: PloState,
    block_progress: Pattern,
}

impl<'a> PloClient<'a> {
    /// Attach to a session whose device is about to show the plo banner.
    pub fn new(session: &'a mut DeviceSession) -> Result<Self> {
        Ok(Self {
            session,
            state: PloState::AwaitingInterrupt,
            block_progress: Pattern::regex(BLOCK_PROGRESS)?,
        })
    }

    /// Current protocol state.
    pub fn state(&self) -> PloState {
        self.state
    }

    /// The underlying session.
    pub fn session(&mut self) -> &mut DeviceSession {
        self.session
    }

    /// Interrupt the boot countdown and wait for the first prompt.
    pub fn enter_bootloader(&mut self) -> Result<()> {
        debug!("Waiting for plo banner");
        self.session
            .expect_exact(BANNER, BANNER_TIMEOUT)?;
        self.session
            .send_line("")?;
        self.wait_prompt(PROMPT_TIMEOUT)?;
        info!("Entered plo on {}", self.session.name());
        Ok(())
    }

    /// Wait for the prompt.
    pub fn wait_prompt(&mut self, timeout: Duration) -> Result<MatchResult> {
        let m = self
            .session
            .expect_exact(PROMPT, timeout)?;
        self.state = PloState::PromptReady;
        Ok(m)
    }

    /// Wait for the prompt and, with `error_check`, fail if an error was
    /// printed right before it.
    pub fn assert_prompt(&mut self, timeout: Duration, error_check: bool) -> Result<MatchResult> {
        let m = self.wait_prompt(timeout)?;
        if error_check && contains(&m.before, ERROR_MARKER) {
            return Err(Error::Device {
                command: String::new(),
                reason: "plo reported an error".to_string(),
                output: m
                    .before_text()
                    .into_owned(),
            });
        }
        Ok(m)
    }

    /// Send `cmd` and require its exact echo, ended by a line terminator.
    pub fn send_command(&mut self, cmd: &str) -> Result<()> {
        if self.state == PloState::Exited {
            return Err(Error::Unsupported(format!(
                "cannot send `{cmd}`: plo already handed over to the OS"
            )));
        }
        trace!("plo <- {cmd}");
        self.state = PloState::Busy;
        self.session
            .send_line(cmd)?;
        let echo = self
            .session
            .expect_exact(cmd, ECHO_TIMEOUT)
            .map_err(|e| e.with_command(cmd))?;
        if !echo
            .before
            .iter()
            .all(u8::is_ascii_whitespace)
        {
            return Err(Error::Device {
                command: cmd.to_string(),
                reason: "unexpected output before command echo".to_string(),
                output: echo
                    .before_text()
                    .into_owned(),
            });
        }
        let end = self
            .session
            .expect(&[Pattern::literal("\r"), Pattern::literal("\n")], ECHO_TIMEOUT)
            .map_err(|e| e.with_command(cmd))?;
        if !end
            .before
            .is_empty()
        {
            return Err(Error::Device {
                command: cmd.to_string(),
                reason: "command echo continues past the command".to_string(),
                output: end
                    .before_text()
                    .into_owned(),
            });
        }
        Ok(())
    }

    /// Send `cmd` and wait for a clean prompt.
    pub fn run_command(&mut self, cmd: &str, timeout: Duration) -> Result<MatchResult> {
        self.send_command(cmd)?;
        self.assert_prompt(timeout, true)
            .map_err(|e| e.with_command(cmd))
    }

    /// Run a rendered [`PloCommand`].
    pub fn run(&mut self, cmd: &PloCommand, timeout: Duration) -> Result<MatchResult> {
        self.run_command(&cmd.to_string(), timeout)
    }

    /// Erase `size` bytes of `device` starting at `offset`.
    ///
    /// The confirmation token is only sent after the data loss warning was
    /// seen; a prompt in place of the warning fails the erase.
    pub fn erase(&mut self, device: &str, offset: u64, size: u64, timeout: Duration) -> Result<()> {
        let cmd = PloCommand::Erase {
            device: device.to_string(),
            offset,
            size,
        }
        .to_string();
        info!("Erasing {device} {offset:#x}+{size:#x}");

        self.send_command(&cmd)?;
        self.expect_or_refused(DATA_LOSS_WARNING, ERASE_CONFIRM_TIMEOUT, &cmd)?;
        self.send_command(CONFIRMATION)
            .map_err(|e| e.with_command(&cmd))?;
        self.expect_or_refused(ERASED, timeout, &cmd)?;
        self.assert_prompt(PROMPT_TIMEOUT, true)
            .map_err(|e| e.with_command(&cmd))?;
        Ok(())
    }

    /// Write jffs2 cleanmarkers over the partition described by `spec`.
    ///
    /// plo prints `block <i>/<n>` for every block; each index must show up in
    /// order, and within `per_block_timeout` of the previous one.
    pub fn format_filesystem(
        &mut self,
        spec: &JffsFlashImageSpec,
        progress: &mut dyn FnMut(u32, u32),
    ) -> Result<()> {
        let geometry = spec.cleanmarker;
        let cmd = PloCommand::Jffs2Format {
            device: spec
                .flash_device_id
                .clone(),
            erase: true,
            start_block: geometry.start_block,
            block_count: geometry.block_count,
            block_size: geometry.block_size,
            marker_size: geometry.marker_size,
        }
        .to_string();
        info!(
            "Formatting {} blocks on {}",
            geometry.block_count, spec.flash_device_id
        );

        self.send_command(&cmd)?;
        let patterns = [self
            .block_progress
            .clone()];
        for expected in 0..geometry.block_count {
            let m = self
                .session
                .expect(&patterns, spec.per_block_timeout)
                .map_err(|e| match e {
                    Error::StreamTimeout { before, .. } | Error::Eof { before, .. } => Error::Device {
                        command: cmd.clone(),
                        reason: format!("missing progress for block {expected}"),
                        output: before,
                    },
                    other => other,
                })?;
            let count = m
                .group("count")
                .and_then(|n| n.parse::<u32>().ok());
            if count != Some(geometry.block_count) {
                return Err(Error::Device {
                    command: cmd,
                    reason: format!(
                        "plo formats {} blocks, expected {}",
                        m.group("count")
                            .unwrap_or("?"),
                        geometry.block_count
                    ),
                    output: m
                        .before_text()
                        .into_owned(),
                });
            }
            let index = m
                .group("index")
                .and_then(|i| i.parse::<u32>().ok());
            if index != Some(expected) {
                return Err(Error::Device {
                    command: cmd,
                    reason: format!(
                        "expected progress for block {expected}, got {}",
                        m.matched_text()
                            .trim_end()
                    ),
                    output: m
                        .before_text()
                        .into_owned(),
                });
            }
            progress(expected + 1, geometry.block_count);
        }
        self.assert_prompt(PROMPT_TIMEOUT, true)
            .map_err(|e| e.with_command(&cmd))?;
        Ok(())
    }

    /// Register an application in the syspage.
    pub fn load_app(
        &mut self,
        device: &str,
        file: &str,
        imap: &str,
        dmap: &str,
        executable: bool,
    ) -> Result<()> {
        let cmd = PloCommand::App {
            device: device.to_string(),
            file: file.to_string(),
            imap: imap.to_string(),
            dmap: dmap.to_string(),
            executable,
        };
        self.run(&cmd, APP_TIMEOUT)?;
        Ok(())
    }

    /// Generic data movement between two bootloader devices.
    #[allow(clippy::too_many_arguments)]
    pub fn copy(
        &mut self,
        src: &str,
        src_obj: &str,
        dst: &str,
        dst_obj: &str,
        src_size: Option<u64>,
        dst_size: Option<u64>,
        timeout: Duration,
    ) -> Result<()> {
        let cmd = PloCommand::Copy {
            src: src.to_string(),
            src_obj: src_obj.to_string(),
            src_size,
            dst: dst.to_string(),
            dst_obj: dst_obj.to_string(),
            dst_size,
        };
        self.run(&cmd, timeout)?;
        Ok(())
    }

    /// Copy a file served on `src` into `dst` at `offset`.
    pub fn copy_file_to_memory(
        &mut self,
        src: &str,
        file: &str,
        dst: &str,
        offset: u64,
        size: u64,
        timeout: Duration,
    ) -> Result<()> {
        self.copy(
            src,
            file,
            dst,
            &format!("{offset:#x}"),
            None,
            Some(size),
            timeout,
        )
    }

    /// Name a memory region so that `app` can load it like a file.
    pub fn alias(&mut self, name: &str, offset: u64, size: u64) -> Result<()> {
        let cmd = PloCommand::Alias {
            name: name.to_string(),
            offset,
            size,
        };
        self.run(&cmd, ALIAS_TIMEOUT)?;
        Ok(())
    }

    /// Boot the OS. The OS prompt is not plo's business, so nothing is awaited.
    pub fn exit_to_os(&mut self) -> Result<()> {
        info!("Leaving plo");
        self.session
            .send_line(&PloCommand::Go.to_string())?;
        self.state = PloState::Exited;
        Ok(())
    }

    fn expect_or_refused(&mut self, marker: &str, timeout: Duration, cmd: &str) -> Result<()> {
        let m = self
            .session
            .expect(&[Pattern::literal(marker), Pattern::literal(PROMPT)], timeout)
            .map_err(|e| e.with_command(cmd))?;
        if m.index == 1 {
            self.state = PloState::PromptReady;
            return Err(Error::Device {
                command: cmd.to_string(),
                reason: format!("prompt returned before {marker:?}"),
                output: m
                    .before_text()
                    .into_owned(),
            });
        }
        Ok(())
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|w| w == needle)
}
