//! Scripted port for protocol tests.
//!
//! Device output is released in response to host writes, so a test can
//! describe a conversation ("when `erase ...` is written, print the warning")
//! and later check the order in which the host wrote and read.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::port::Port;

struct Rule {
    trigger: Vec<u8>,
    reply: Vec<u8>,
    delay: Duration,
}

#[derive(Default)]
struct State {
    incoming: VecDeque<u8>,
    delayed: Vec<(Instant, Vec<u8>)>,
    rules: VecDeque<Rule>,
    unmatched: Vec<u8>,
    written: Vec<u8>,
    writes: Vec<(Vec<u8>, usize)>,
    consumed: usize,
    reopen_output: Vec<u8>,
    reopens: usize,
    clears: usize,
    closed: bool,
}

impl State {
    fn release_due(&mut self) {
        let now = Instant::now();
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, bytes) = self.delayed.remove(i);
                self.incoming.extend(bytes);
            } else {
                i += 1;
            }
        }
    }

    fn apply_rules(&mut self) {
        while let Some(rule) = self.rules.front() {
            let Some(pos) = find(&self.unmatched, &rule.trigger) else {
                break;
            };
            let end = pos + rule.trigger.len();
            self.unmatched.drain(..end);
            let rule = self.rules.pop_front().unwrap();
            if rule.delay.is_zero() {
                self.incoming.extend(rule.reply);
            } else {
                self.delayed.push((Instant::now() + rule.delay, rule.reply));
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

/// Inspection handle shared with a [`ScriptedPort`] moved into a session.
#[derive(Clone)]
pub(crate) struct Probe(Arc<Mutex<State>>);

impl Probe {
    /// Everything the host wrote, lossily decoded.
    pub(crate) fn written(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap().written).into_owned()
    }

    /// Number of device bytes the host had read when it wrote `needle`.
    pub(crate) fn read_position_at_write(&self, needle: &str) -> Option<usize> {
        let state = self.0.lock().unwrap();
        state
            .writes
            .iter()
            .find(|(bytes, _)| find(bytes, needle.as_bytes()).is_some())
            .map(|(_, pos)| *pos)
    }

    /// Number of bytes handed out by reads so far.
    pub(crate) fn consumed(&self) -> usize {
        self.0.lock().unwrap().consumed
    }

    /// Append device output right away.
    pub(crate) fn push_output(&self, bytes: &str) {
        self.0
            .lock()
            .unwrap()
            .incoming
            .extend(bytes.as_bytes());
    }

    pub(crate) fn reopens(&self) -> usize {
        self.0.lock().unwrap().reopens
    }

    pub(crate) fn clears(&self) -> usize {
        self.0.lock().unwrap().clears
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.lock().unwrap().closed
    }

    /// Rules that never fired.
    pub(crate) fn pending_rules(&self) -> usize {
        self.0.lock().unwrap().rules.len()
    }
}

/// Port replaying a scripted device.
pub(crate) struct ScriptedPort {
    state: Arc<Mutex<State>>,
    timeout: Duration,
}

impl ScriptedPort {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            timeout: Duration::from_millis(100),
        }
    }

    /// Output available before the host writes anything.
    pub(crate) fn with_output(self, bytes: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .incoming
            .extend(bytes.as_bytes());
        self
    }

    /// Once the host has written `trigger`, the device prints `reply`.
    ///
    /// Rules fire strictly in the order they were added.
    pub(crate) fn on_write(self, trigger: &str, reply: &str) -> Self {
        self.on_write_delayed(trigger, reply, Duration::ZERO)
    }

    /// Like [`ScriptedPort::on_write`], with the reply showing up after `delay`.
    pub(crate) fn on_write_delayed(self, trigger: &str, reply: &str, delay: Duration) -> Self {
        self.state
            .lock()
            .unwrap()
            .rules
            .push_back(Rule {
                trigger: trigger.as_bytes().to_vec(),
                reply: reply.as_bytes().to_vec(),
                delay,
            });
        self
    }

    /// Output printed every time the port is reopened.
    pub(crate) fn on_reopen(self, bytes: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .reopen_output = bytes.as_bytes().to_vec();
        self
    }

    pub(crate) fn probe(&self) -> Probe {
        Probe(Arc::clone(&self.state))
    }
}

impl Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
                }
                state.release_due();
                if !state.incoming.is_empty() {
                    let n = buf.len().min(state.incoming.len());
                    for b in buf.iter_mut().take(n) {
                        *b = state.incoming.pop_front().unwrap();
                    }
                    state.consumed += n;
                    return Ok(n);
                }
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let consumed = state.consumed;
        state.written.extend_from_slice(buf);
        state.writes.push((buf.to_vec(), consumed));
        state.unmatched.extend_from_slice(buf);
        state.apply_rules();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for ScriptedPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.incoming.clear();
        state.clears += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn reopen(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.reopens += 1;
        state.incoming.clear();
        let output = state.reopen_output.clone();
        state.incoming.extend(output);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}
