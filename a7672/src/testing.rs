//! Scripted modem transcripts for host tests.
//!
//! [`ScriptedPort`] plays the modem side of the serial line: every frame the
//! driver writes (bytes up to and including `\r\n`) is matched against a
//! rule table, and the rule's scripted reply is queued for the driver to
//! read back. Unscripted commands panic, so a test fails loudly the moment
//! the driver goes off its expected transcript.

use std::collections::VecDeque;
use std::string::String;
use std::vec::Vec;

use embassy_time::Duration;

use crate::at::AtEngine;
use crate::config::Config;
use crate::modem::Modem;
use crate::serial::{SerialLine, SerialPort};

pub fn run<F: core::future::Future>(fut: F) -> F::Output {
    futures::executor::block_on(fut)
}

/// A [`Config`] with every pause and window shrunk so scripted tests finish
/// quickly.
pub fn fast_config() -> Config {
    Config::new()
        .with_registration_retry_pause(Duration::from_millis(5))
        .with_registration_check_window(Duration::from_millis(150))
        .with_service_check_window(Duration::from_millis(120))
        .with_band_settle_pause(Duration::from_millis(5))
        .with_mqtt_acquire_settle(Duration::from_millis(5))
        .with_init_settle_pause(Duration::from_millis(5))
}

pub fn engine(port: ScriptedPort) -> AtEngine<ScriptedPort, MockPin> {
    AtEngine::new(SerialLine::new(port, MockPin), fast_config().at_response_timeout)
}

pub fn modem(port: ScriptedPort) -> Modem<ScriptedPort, MockPin> {
    modem_with(port, fast_config())
}

pub fn modem_with(port: ScriptedPort, config: Config) -> Modem<ScriptedPort, MockPin> {
    Modem::new(SerialLine::new(port, MockPin), config)
}

/// Output pin that goes nowhere.
pub struct MockPin;

impl embedded_hal::digital::ErrorType for MockPin {
    type Error = core::convert::Infallible;
}

impl embedded_hal::digital::OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockError;

impl embedded_io_async::Error for MockError {
    fn kind(&self) -> embedded_io_async::ErrorKind {
        embedded_io_async::ErrorKind::Other
    }
}

struct Rule {
    frame: Vec<u8>,
    /// Replies handed out in order; the last one repeats.
    replies: Vec<Vec<u8>>,
    next: usize,
}

impl Rule {
    fn take_reply(&mut self) -> Vec<u8> {
        let index = self.next.min(self.replies.len() - 1);
        self.next += 1;
        self.replies[index].clone()
    }
}

pub struct ScriptedPort {
    rules: Vec<Rule>,
    pending: Vec<u8>,
    rx: VecDeque<u8>,
    frames: Vec<String>,
    open_calls: usize,
    remaining_open_failures: usize,
}

impl ScriptedPort {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            pending: Vec::new(),
            rx: VecDeque::new(),
            frames: Vec::new(),
            open_calls: 0,
            remaining_open_failures: 0,
        }
    }

    /// Scripts `reply` for every occurrence of `cmd`. Replaces any earlier
    /// rule for the same command.
    pub fn on(&mut self, cmd: &str, reply: &str) {
        self.on_bytes(cmd, reply.as_bytes());
    }

    /// Like [`on`](Self::on), for replies carrying raw binary.
    pub fn on_bytes(&mut self, cmd: &str, reply: &[u8]) {
        self.set_rule(cmd, vec![reply.to_vec()]);
    }

    /// Scripts a sequence of replies, consumed one per occurrence; the last
    /// entry repeats. An empty entry means "recognized, no reply".
    pub fn on_seq(&mut self, cmd: &str, replies: &[&str]) {
        assert!(!replies.is_empty());
        self.set_rule(cmd, replies.iter().map(|r| r.as_bytes().to_vec()).collect());
    }

    /// Recognizes `cmd` but never answers it.
    pub fn silent(&mut self, cmd: &str) {
        self.set_rule(cmd, vec![Vec::new()]);
    }

    /// Makes the next `count` calls to `open` fail.
    pub fn fail_opens(&mut self, count: usize) {
        self.remaining_open_failures = count;
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls
    }

    /// Every frame the driver wrote, in order, lossily decoded.
    pub fn frames(&self) -> &Vec<String> {
        &self.frames
    }

    /// How often `cmd` went over the wire.
    pub fn count(&self, cmd: &str) -> usize {
        let frame = format!("{cmd}\r\n");
        self.frames.iter().filter(|f| **f == frame).count()
    }

    pub fn sent(&self, cmd: &str) -> bool {
        self.count(cmd) > 0
    }

    fn set_rule(&mut self, cmd: &str, replies: Vec<Vec<u8>>) {
        let mut frame = cmd.as_bytes().to_vec();
        frame.extend_from_slice(b"\r\n");
        if let Some(rule) = self.rules.iter_mut().find(|r| r.frame == frame) {
            rule.replies = replies;
            rule.next = 0;
        } else {
            self.rules.push(Rule {
                frame,
                replies,
                next: 0,
            });
        }
    }

    fn handle_frame(&mut self, frame: Vec<u8>) {
        self.frames.push(String::from_utf8_lossy(&frame).into_owned());
        let Some(rule) = self.rules.iter_mut().find(|r| r.frame == frame) else {
            panic!("unexpected command: {:?}", String::from_utf8_lossy(&frame));
        };
        let reply = rule.take_reply();
        self.rx.extend(reply);
    }

    fn drain_pending_frames(&mut self) {
        while let Some(end) = self
            .pending
            .windows(2)
            .position(|window| window == b"\r\n")
        {
            let frame: Vec<u8> = self.pending.drain(..end + 2).collect();
            self.handle_frame(frame);
        }
    }
}

impl Default for ScriptedPort {
    fn default() -> Self {
        Self::new()
    }
}

impl embedded_io_async::ErrorType for ScriptedPort {
    type Error = MockError;
}

impl embedded_io_async::Read for ScriptedPort {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.rx.is_empty() {
            // nothing scripted right now; the driver's deadline decides
            core::future::pending::<()>().await;
        }
        match self.rx.pop_front() {
            Some(byte) => {
                buf[0] = byte;
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

impl embedded_io_async::Write for ScriptedPort {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.pending.extend_from_slice(buf);
        self.drain_pending_frames();
        Ok(buf.len())
    }
}

impl SerialPort for ScriptedPort {
    async fn open(&mut self, _baud: u32) -> Result<(), Self::Error> {
        self.open_calls += 1;
        if self.remaining_open_failures > 0 {
            self.remaining_open_failures -= 1;
            return Err(MockError);
        }
        Ok(())
    }

    async fn close(&mut self) {}
}
