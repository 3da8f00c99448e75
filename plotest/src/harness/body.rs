//! Test bodies.

use std::time::Duration;

use log::debug;

use super::TestResult;
use crate::error::{Error, Result};
use crate::session::{DeviceSession, Pattern};

/// The part of a test that exercises the booted device.
///
/// A body either records its verdict in `result` or returns an error, which
/// the pipeline turns into a failure of the run stage.
pub trait TestBody {
    /// Run against `session`; every wait should be bounded by `timeout`.
    fn run(&mut self, session: &mut DeviceSession, timeout: Duration, result: &mut TestResult) -> Result<()>;

    /// Shell command the body sends, named in failure messages.
    fn shell_command(&self) -> Option<&str> {
        None
    }
}

impl<F> TestBody for F
where
    F: FnMut(&mut DeviceSession, Duration, &mut TestResult) -> Result<()>,
{
    fn run(&mut self, session: &mut DeviceSession, timeout: Duration, result: &mut TestResult) -> Result<()> {
        self(session, timeout, result)
    }
}

/// Sends one shell command and expects a sequence of patterns.
#[derive(Debug, Clone)]
pub struct ExpectBody {
    command: Option<String>,
    expected: Vec<Pattern>,
}

impl ExpectBody {
    /// Run `command` first.
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            expected: Vec::new(),
        }
    }

    /// Only watch the console.
    pub fn watch() -> Self {
        Self {
            command: None,
            expected: Vec::new(),
        }
    }

    /// Expect `pattern` after the previous one.
    #[must_use]
    pub fn expect(mut self, pattern: impl Into<Pattern>) -> Self {
        self.expected.push(pattern.into());
        self
    }
}

impl TestBody for ExpectBody {
    fn run(&mut self, session: &mut DeviceSession, timeout: Duration, _result: &mut TestResult) -> Result<()> {
        let context = |e: Error| match &self.command {
            Some(command) => e.with_command(command),
            None => e,
        };
        if let Some(command) = &self.command {
            debug!("$ {command}");
            session.send_line(command)?;
            session
                .expect_exact(command, timeout)
                .map_err(context)?;
        }
        for pattern in &self.expected {
            session
                .expect(std::slice::from_ref(pattern), timeout)
                .map_err(context)?;
        }
        Ok(())
    }

    fn shell_command(&self) -> Option<&str> {
        self.command.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::ScriptedPort;

    #[test]
    fn test_expect_body_in_order() {
        let port = ScriptedPort::new().on_write("uname\r", "uname\r\nPhoenix-RTOS 3.2\r\n(psh)% ");
        let mut session = DeviceSession::new(Box::new(port));
        let mut body = ExpectBody::command("uname")
            .expect("Phoenix-RTOS")
            .expect(Pattern::regex(r"\d+\.\d+").unwrap());
        let mut result = TestResult::new();
        body.run(&mut session, Duration::from_secs(1), &mut result)
            .unwrap();
        assert_eq!(session.buffered(), b"\r\n(psh)% ");
    }

    #[test]
    fn test_expect_body_missing_output() {
        let port = ScriptedPort::new().on_write("ls\r", "ls\r\n(psh)% ");
        let mut session = DeviceSession::new(Box::new(port));
        let mut body = ExpectBody::command("ls").expect("bin");
        let err = body
            .run(&mut session, Duration::from_millis(100), &mut TestResult::new())
            .unwrap_err();
        match err {
            Error::Device {
                command, output, ..
            } => {
                assert_eq!(command, "ls");
                assert!(output.contains("(psh)% "));
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_watch_body_timeout_stays_a_timeout() {
        let mut session = DeviceSession::new(Box::new(ScriptedPort::new()));
        let mut body = ExpectBody::watch().expect("kernel panic");
        assert!(body.shell_command().is_none());
        let err = body
            .run(&mut session, Duration::from_millis(50), &mut TestResult::new())
            .unwrap_err();
        assert!(matches!(err, Error::StreamTimeout { .. }));
    }

    #[test]
    fn test_closure_body() {
        let mut session = DeviceSession::new(Box::new(ScriptedPort::new()));
        let mut body = |_: &mut DeviceSession, _: Duration, result: &mut TestResult| -> Result<()> {
            result.add_subresult("leaf", crate::harness::Status::Ok, "");
            Ok(())
        };
        let mut result = TestResult::new();
        TestBody::run(&mut body, &mut session, Duration::ZERO, &mut result).unwrap();
        assert_eq!(result.subresults.len(), 1);
    }
}
