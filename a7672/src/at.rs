//! Request/response AT command engine.
//!
//! The module interleaves final result codes (`OK`, `ERROR`), prefixed value
//! lines (`+CMD: data`), sub-prompts (`>`, `DOWNLOAD`), unsolicited lines and,
//! for `+HTTPREAD`, raw binary. Three read primitives keep those regimes
//! apart: [`AtEngine::wait_response`] tail-matches tokens on a rolling
//! buffer, [`AtEngine::recv_line`] picks up the rest of a value line, and
//! [`AtEngine::retrieve_buffer`] pulls an exact number of raw bytes.

use embassy_time::{Duration, Instant, Timer, with_timeout};
use embedded_hal::digital::OutputPin;
use embedded_io_async::{Read, Write};
use heapless::String;

use crate::error::{Error, Result};
use crate::serial::{SerialLine, SerialPort};

/// Final result code of a successful command.
pub const RESP_OK: &str = "OK\r\n";
/// Final result code of a failed command.
pub const RESP_ERROR: &str = "ERROR\r\n";

const RESP_ERROR_CME: &str = "+CME ERROR:";
const RESP_ERROR_CMS: &str = "+CMS ERROR:";

/// Rolling receive buffer size; large enough for every recognized non-body
/// response.
const RX_BUFFER_SIZE: usize = 512;

/// Capacity of a single received value line.
pub const LINE_CAPACITY: usize = 64;

const LINE_TIMEOUT: Duration = Duration::from_millis(3000);
const TEST_AT_ATTEMPT_WINDOW: Duration = Duration::from_millis(500);
const TEST_AT_ATTEMPT_PAUSE: Duration = Duration::from_millis(100);

/// Which of the expected tokens terminated a [`AtEngine::wait_response`]
/// wait, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AtResponse {
    Expected1,
    Expected2,
    Expected3,
    Timeout,
    /// `ERROR`-class outcome: a CME/CMS error line, or a receive buffer
    /// overflow.
    CmxError,
}

impl AtResponse {
    /// Collapses the outcome into `Ok` for the first expectation and the
    /// matching error otherwise.
    pub fn expect1(self) -> Result<()> {
        match self {
            AtResponse::Expected1 => Ok(()),
            AtResponse::Timeout => Err(Error::Timeout),
            _ => Err(Error::Modem),
        }
    }
}

/// Framed, half-duplex AT command engine on top of a [`SerialLine`].
///
/// At most one command is in flight at any time; the engine owns the line
/// for the whole command, from the first framed byte until the waited-for
/// terminator matches or the window lapses.
pub struct AtEngine<S: SerialPort, P: OutputPin> {
    serial: SerialLine<S, P>,
    buf: [u8; RX_BUFFER_SIZE],
    len: usize,
    default_timeout: Duration,
}

impl<S: SerialPort, P: OutputPin> AtEngine<S, P> {
    pub fn new(serial: SerialLine<S, P>, default_timeout: Duration) -> Self {
        Self {
            serial,
            buf: [0; RX_BUFFER_SIZE],
            len: 0,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub(crate) fn serial_mut(&mut self) -> &mut SerialLine<S, P> {
        &mut self.serial
    }

    #[cfg(test)]
    pub(crate) fn serial(&self) -> &SerialLine<S, P> {
        &self.serial
    }

    /// Pings the module with bare `AT` until it answers `OK` or the overall
    /// window lapses.
    pub async fn test_at(&mut self, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            if self.send_raw(b"AT").await.is_err() {
                return false;
            }
            if self.wait_ok_within(TEST_AT_ATTEMPT_WINDOW).await == AtResponse::Expected1 {
                return true;
            }
            Timer::after(TEST_AT_ATTEMPT_PAUSE).await;
        }
        false
    }

    /// Sends a command body, framing it with the `AT` prefix and the line
    /// terminator.
    pub async fn send_at(&mut self, cmd: &str) -> Result<()> {
        trace!("-> AT{}", cmd);
        self.serial.write_all(b"AT").await.map_err(|_| Error::Serial)?;
        self.serial.write_all(cmd.as_bytes()).await.map_err(|_| Error::Serial)?;
        self.finish_frame().await
    }

    /// Sends bytes verbatim plus the line terminator. Used when the caller
    /// already carries the `AT` prefix, and for payloads behind `DOWNLOAD`
    /// and `>` sub-prompts.
    pub async fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.serial.write_all(raw).await.map_err(|_| Error::Serial)?;
        self.finish_frame().await
    }

    async fn finish_frame(&mut self) -> Result<()> {
        self.serial.write_all(b"\r\n").await.map_err(|_| Error::Serial)?;
        self.serial.flush().await.map_err(|_| Error::Serial)?;
        Timer::after_millis(1).await;
        Ok(())
    }

    /// Accumulates incoming bytes and reports which expected token the
    /// buffer's tail hit first.
    ///
    /// CME/CMS error prefixes are recognized in the same loop, so an error
    /// racing an expected token wins as soon as its bytes arrive; the
    /// trailing error text is consumed and logged.
    pub async fn wait_response(
        &mut self,
        timeout: Duration,
        exp1: &str,
        exp2: &str,
        exp3: Option<&str>,
    ) -> AtResponse {
        self.len = 0;
        let deadline = Instant::now() + timeout;

        loop {
            let Some(byte) = self.read_byte(deadline).await else {
                return AtResponse::Timeout;
            };
            if self.len >= RX_BUFFER_SIZE {
                error!("wait_response receive buffer overflow");
                return AtResponse::CmxError;
            }
            self.buf[self.len] = byte;
            self.len += 1;

            let tail = &self.buf[..self.len];
            if tail.ends_with(exp1.as_bytes()) {
                return AtResponse::Expected1;
            }
            if tail.ends_with(exp2.as_bytes()) {
                return AtResponse::Expected2;
            }
            if exp3.is_some_and(|exp| tail.ends_with(exp.as_bytes())) {
                return AtResponse::Expected3;
            }
            if tail.ends_with(RESP_ERROR_CME.as_bytes()) || tail.ends_with(RESP_ERROR_CMS.as_bytes()) {
                match self.recv_line().await {
                    Ok(message) => warn!("CMx error message: {}", message.as_str()),
                    Err(_) => warn!("CMx error without a readable message"),
                }
                return AtResponse::CmxError;
            }
        }
    }

    /// Waits for the final result code with the default window.
    pub async fn wait_ok(&mut self) -> AtResponse {
        self.wait_ok_within(self.default_timeout).await
    }

    pub async fn wait_ok_within(&mut self, timeout: Duration) -> AtResponse {
        self.wait_response(timeout, RESP_OK, RESP_ERROR, None).await
    }

    /// Waits for a `+CMD:`-style prefix (or `ERROR`) with the default
    /// window.
    pub async fn wait_prefix(&mut self, prefix: &str) -> AtResponse {
        self.wait_prefix_within(self.default_timeout, prefix).await
    }

    pub async fn wait_prefix_within(&mut self, timeout: Duration, prefix: &str) -> AtResponse {
        self.wait_response(timeout, prefix, RESP_ERROR, None).await
    }

    /// Receives the rest of a value line up to its terminator, discarding
    /// the single space the module prints after `+CMD:` prefixes.
    pub async fn recv_line(&mut self) -> Result<String<LINE_CAPACITY>> {
        self.recv_line_with(LINE_TIMEOUT, true).await
    }

    pub async fn recv_line_with(
        &mut self,
        timeout: Duration,
        skip_leading_space: bool,
    ) -> Result<String<LINE_CAPACITY>> {
        let mut line: String<LINE_CAPACITY> = String::new();
        let deadline = Instant::now() + timeout;

        loop {
            let Some(mut byte) = self.read_byte(deadline).await else {
                return Err(Error::Timeout);
            };
            if skip_leading_space && line.is_empty() && byte == b' ' {
                continue;
            }
            if byte == b'\r' {
                let Some(next) = self.read_byte(deadline).await else {
                    return Err(Error::Timeout);
                };
                if next == b'\n' {
                    return Ok(line);
                }
                // stray carriage return, keep the byte that followed it
                byte = next;
            }
            if line.push(byte as char).is_err() {
                error!("recv_line buffer overflow");
                return Err(Error::BufferOverflow);
            }
        }
    }

    /// Reads exactly `out.len()` raw bytes with no delimiter logic; used to
    /// extract binary HTTP body slices.
    pub async fn retrieve_buffer(&mut self, out: &mut [u8], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        for slot in out.iter_mut() {
            let Some(byte) = self.read_byte(deadline).await else {
                return Err(Error::Timeout);
            };
            *slot = byte;
        }
        Ok(())
    }

    /// Drains whatever the module has queued up.
    pub async fn clear_buffer(&mut self) {
        loop {
            let deadline = Instant::now() + Duration::from_millis(2);
            if self.read_byte(deadline).await.is_none() {
                return;
            }
        }
    }

    async fn read_byte(&mut self, deadline: Instant) -> Option<u8> {
        let mut byte = [0u8; 1];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            match with_timeout(deadline - now, self.serial.read(&mut byte)).await {
                Ok(Ok(0)) => Timer::after_millis(1).await,
                Ok(Ok(_)) => return Some(byte[0]),
                Ok(Err(_)) => {
                    warn!("serial read error");
                    return None;
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedPort, engine, run};

    #[test]
    fn framing_is_exact() {
        let mut port = ScriptedPort::new();
        port.on("AT+CPIN?", "+CPIN: READY\r\nOK\r\n");
        port.on("x", "OK\r\n");
        let mut at = engine(port);

        run(async {
            at.send_at("+CPIN?").await.unwrap();
            at.send_raw(b"x").await.unwrap();
        });

        assert_eq!(at.serial().port().frames(), &["AT+CPIN?\r\n", "x\r\n"]);
    }

    #[test]
    fn tail_match_picks_the_right_argument() {
        let mut port = ScriptedPort::new();
        port.on("AT+CPIN?", "+CPIN: READY\r\nOK\r\n");
        let mut at = engine(port);

        run(async {
            at.send_at("+CPIN?").await.unwrap();
            let resp = at.wait_response(LINE_TIMEOUT, "+CPIN:", RESP_ERROR, None).await;
            assert_eq!(resp, AtResponse::Expected1);
            // the rest of the value line is still in the stream
            assert_eq!(at.recv_line().await.unwrap().as_str(), "READY");
            assert_eq!(at.wait_ok().await, AtResponse::Expected1);
        });
    }

    #[test]
    fn tail_match_third_argument() {
        let mut port = ScriptedPort::new();
        port.on("AT+CGREG?", "+CGREG: 0,1\r\nOK\r\n");
        let mut at = engine(port);

        run(async {
            at.send_at("+CGREG?").await.unwrap();
            let resp = at
                .wait_response(LINE_TIMEOUT, "+CREG:", "+CEREG:", Some("+CGREG:"))
                .await;
            assert_eq!(resp, AtResponse::Expected3);
        });
    }

    #[test]
    fn error_terminator_yields_second_argument() {
        let mut port = ScriptedPort::new();
        port.on("AT+HTTPINIT", "ERROR\r\n");
        let mut at = engine(port);

        run(async {
            at.send_at("+HTTPINIT").await.unwrap();
            assert_eq!(at.wait_ok().await, AtResponse::Expected2);
        });
    }

    #[test]
    fn cme_error_wins_and_consumes_its_line() {
        let mut port = ScriptedPort::new();
        port.on("AT+CPIN?", "+CME ERROR: 10\r\n");
        let mut at = engine(port);

        run(async {
            at.send_at("+CPIN?").await.unwrap();
            assert_eq!(at.wait_ok().await, AtResponse::CmxError);
        });
    }

    #[test]
    fn silence_times_out() {
        let mut port = ScriptedPort::new();
        port.silent("AT+CPIN?");
        let mut at = engine(port);

        run(async {
            at.send_at("+CPIN?").await.unwrap();
            let resp = at.wait_ok_within(Duration::from_millis(30)).await;
            assert_eq!(resp, AtResponse::Timeout);
        });
    }

    #[test]
    fn oversized_response_aborts_the_command() {
        let mut port = ScriptedPort::new();
        let garbage: std::string::String = core::iter::repeat('x').take(600).collect();
        port.on("AT+CPSI?", &garbage);
        let mut at = engine(port);

        run(async {
            at.send_at("+CPSI?").await.unwrap();
            assert_eq!(at.wait_ok_within(Duration::from_millis(200)).await, AtResponse::CmxError);
            // the engine stays usable once the residue is dropped
            at.clear_buffer().await;
            at.serial_mut().port_mut().on("AT", "OK\r\n");
            at.send_raw(b"AT").await.unwrap();
            assert_eq!(at.wait_ok().await, AtResponse::Expected1);
        });
    }

    #[test]
    fn recv_line_reports_timeout_without_terminator() {
        let mut port = ScriptedPort::new();
        port.on("AT+CSQ", "+CSQ: 17,99");
        let mut at = engine(port);

        run(async {
            at.send_at("+CSQ").await.unwrap();
            assert_eq!(at.wait_prefix("+CSQ:").await, AtResponse::Expected1);
            let got = at.recv_line_with(Duration::from_millis(30), true).await;
            assert_eq!(got, Err(Error::Timeout));
        });
    }

    #[test]
    fn retrieve_buffer_is_exact_and_binary_safe() {
        let mut port = ScriptedPort::new();
        port.on_bytes("AT+HTTPREAD=0,4", b"\x01\x02\xff\x00rest");
        let mut at = engine(port);

        run(async {
            at.send_at("+HTTPREAD=0,4").await.unwrap();
            let mut out = [0u8; 4];
            at.retrieve_buffer(&mut out, LINE_TIMEOUT).await.unwrap();
            assert_eq!(&out, b"\x01\x02\xff\x00");
        });
    }

    #[test]
    fn retrieve_buffer_times_out_when_short() {
        let mut port = ScriptedPort::new();
        port.on_bytes("AT+HTTPREAD=0,4", b"\x01\x02");
        let mut at = engine(port);

        run(async {
            at.send_at("+HTTPREAD=0,4").await.unwrap();
            let mut out = [0u8; 4];
            let got = at.retrieve_buffer(&mut out, Duration::from_millis(30)).await;
            assert_eq!(got, Err(Error::Timeout));
        });
    }

    #[test]
    fn test_at_retries_until_the_module_answers() {
        let mut port = ScriptedPort::new();
        port.on_seq("AT", &["", "", "OK\r\n"]);
        let mut at = engine(port);

        run(async {
            assert!(at.test_at(Duration::from_secs(5)).await);
        });
        assert_eq!(at.serial().port().count("AT"), 3);
    }

    #[test]
    fn test_at_gives_up_after_the_window() {
        let mut port = ScriptedPort::new();
        port.silent("AT");
        let mut at = engine(port);

        run(async {
            assert!(!at.test_at(Duration::from_millis(700)).await);
        });
    }
}
