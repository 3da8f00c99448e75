//! Error types for plotest.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for plotest operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for plotest operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (transport, subprocess, files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Invalid expectation pattern.
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// None of the expected patterns showed up in time.
    #[error("Timeout after {timeout:?} waiting for {patterns}; received: {before:?}")]
    StreamTimeout {
        /// Human readable list of the candidate patterns.
        patterns: String,
        /// How long the caller waited.
        timeout: Duration,
        /// Everything received while waiting, escaped.
        before: String,
    },

    /// The transport closed while a pattern was awaited.
    #[error("Transport closed while waiting for {patterns}; received: {before:?}")]
    Eof {
        /// Human readable list of the candidate patterns.
        patterns: String,
        /// Everything received before the end of stream, escaped.
        before: String,
    },

    /// The device reported an error (or echoed something unexpected).
    #[error("Device error on `{command}`: {reason}; output: {output:?}")]
    Device {
        /// Command being executed when the failure was observed.
        command: String,
        /// Short description of what went wrong.
        reason: String,
        /// Device output captured around the failure, escaped.
        output: String,
    },

    /// Programming the device image or preloading applications failed.
    #[error("Flash error: {message}{}", fmt_output(.output))]
    Flash {
        /// Description of the failing step.
        message: String,
        /// Output captured from helper processes, if any.
        output: String,
    },

    /// The device could not be rebooted.
    #[error("Reboot error: {0}")]
    Reboot(String),

    /// A supervised helper process failed to start or exited abnormally.
    #[error("Background service `{program}` failed: {reason}{}", fmt_output(.output))]
    BackgroundService {
        /// Program name of the helper.
        program: String,
        /// Short description of the failure.
        reason: String,
        /// Output captured from the helper.
        output: String,
    },

    /// The per-test pipeline could not be assembled from its options.
    #[error("Harness composition error: {0}")]
    HarnessComposition(String),

    /// Unsupported operation for this transport or target.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The embedding application requested to stop.
    #[error("Interrupted")]
    Interrupted,
}

fn fmt_output(output: &str) -> String {
    if output.is_empty() {
        String::new()
    } else {
        format!("\n--- captured output ---\n{output}")
    }
}

impl Error {
    /// Returns `true` for errors that invalidate the whole run, not just one test.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Reboot(_) | Self::Interrupted)
    }

    /// Wrap any error raised while programming the device into [`Error::Flash`].
    ///
    /// Errors that already are flash errors pass through untouched.
    #[must_use]
    pub fn into_flash(self, output: &str) -> Self {
        match self {
            Self::Flash { .. } => self,
            other => Self::Flash {
                message: other.to_string(),
                output: output.to_string(),
            },
        }
    }

    /// Attach the command that was being run to a protocol error.
    #[must_use]
    pub fn with_command(self, cmd: &str) -> Self {
        match self {
            Self::StreamTimeout {
                patterns,
                timeout,
                before,
            } => Self::Device {
                command: cmd.to_string(),
                reason: format!("timeout after {timeout:?} waiting for {patterns}"),
                output: before,
            },
            Self::Eof { patterns, before } => Self::Device {
                command: cmd.to_string(),
                reason: format!("transport closed while waiting for {patterns}"),
                output: before,
            },
            Self::Device {
                command,
                reason,
                output,
            } if command.is_empty() => Self::Device {
                command: cmd.to_string(),
                reason,
                output,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Reboot("no confirmation".into()).is_fatal());
        assert!(Error::Interrupted.is_fatal());
        assert!(!Error::Config("x".into()).is_fatal());
        assert!(
            !Error::Flash {
                message: "x".into(),
                output: String::new()
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_with_command_converts_timeout() {
        let err = Error::StreamTimeout {
            patterns: "\"(plo)% \"".into(),
            timeout: Duration::from_secs(1),
            before: "garbage".into(),
        }
        .with_command("alias a 0x0 0x10");

        match err {
            Error::Device {
                command, output, ..
            } => {
                assert_eq!(command, "alias a 0x0 0x10");
                assert_eq!(output, "garbage");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_into_flash_keeps_flash_errors() {
        let err = Error::Flash {
            message: "copy failed".into(),
            output: "first".into(),
        }
        .into_flash("second");
        match err {
            Error::Flash { output, .. } => assert_eq!(output, "first"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_flash_display_includes_output() {
        let err = Error::Flash {
            message: "copy failed".into(),
            output: "phoenixd: no such file".into(),
        };
        let text = err.to_string();
        assert!(text.contains("captured output"));
        assert!(text.contains("phoenixd: no such file"));

        let bare = Error::Flash {
            message: "copy failed".into(),
            output: String::new(),
        };
        assert_eq!(bare.to_string(), "Flash error: copy failed");
    }
}
