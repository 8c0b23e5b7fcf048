//! HTTP through the module's built-in stack.
//!
//! Sessions are scoped: `+HTTPINIT` is always paired with `+HTTPTERM`, on
//! success and on every failure path. Response bodies stream back through
//! `+HTTPREAD` in fixed-size chunks because the module's serial buffer
//! cannot hold a whole body.

use core::fmt::Write as _;

use embassy_time::{Duration, Instant};
use embedded_hal::digital::OutputPin;
use heapless::{String, Vec};

use crate::at::AtResponse;
use crate::config::HTTP_READ_CHUNK_MAX;
use crate::error::{Error, Result};
use crate::modem::Modem;
use crate::parse;
use crate::serial::SerialPort;
use crate::types::HttpResponse;

const METHOD_GET: u8 = 0;
const METHOD_POST: u8 = 1;

/// `CONNECTTO` range accepted by the module, seconds.
const CONNECT_TIMEOUT_MIN: u16 = 20;
const CONNECT_TIMEOUT_MAX: u16 = 120;
/// `RECVTO` range accepted by the module, seconds.
const RESPONSE_TIMEOUT_MIN: u16 = 2;
const RESPONSE_TIMEOUT_MAX: u16 = 120;

/// Window for one `+HTTPREAD` slice to stream out of the module.
const CHUNK_TIMEOUT: Duration = Duration::from_millis(3000);
/// Window for the `OK` after a `DOWNLOAD` body upload, matching the
/// `+HTTPDATA` parameter.
const UPLOAD_WINDOW: Duration = Duration::from_secs(10);

impl<S: SerialPort, P: OutputPin> Modem<S, P> {
    /// Performs an HTTP GET and hands the response body to the caller.
    ///
    /// `N` bounds the body the caller is willing to accept. The timeouts are
    /// in seconds and clamped to the module's accepted ranges; `None` leaves
    /// the module defaults in place.
    pub async fn http_get<const N: usize>(
        &mut self,
        url: &str,
        connect_timeout: Option<u16>,
        response_timeout: Option<u16>,
    ) -> Result<HttpResponse<N>> {
        let connect_timeout =
            connect_timeout.map(|t| t.clamp(CONNECT_TIMEOUT_MIN, CONNECT_TIMEOUT_MAX));
        let response_timeout =
            response_timeout.map(|t| t.clamp(RESPONSE_TIMEOUT_MIN, RESPONSE_TIMEOUT_MAX));

        self.http_init().await?;
        let result = self.http_get_inner(url, connect_timeout, response_timeout).await;
        self.http_terminate().await;

        if result.is_ok() {
            info!("http_get finished");
        }
        result
    }

    /// Performs an HTTP POST. The response body is not read back; the
    /// returned response always carries an empty body.
    pub async fn http_post(
        &mut self,
        url: &str,
        body: &[u8],
        content_type: Option<&str>,
        connect_timeout: Option<u16>,
        response_timeout: Option<u16>,
    ) -> Result<HttpResponse<0>> {
        let connect_timeout =
            connect_timeout.map(|t| t.clamp(CONNECT_TIMEOUT_MIN, CONNECT_TIMEOUT_MAX));
        let response_timeout =
            response_timeout.map(|t| t.clamp(RESPONSE_TIMEOUT_MIN, RESPONSE_TIMEOUT_MAX));

        self.http_init().await?;
        let result = self
            .http_post_inner(url, body, content_type, connect_timeout, response_timeout)
            .await;
        self.http_terminate().await;

        if result.is_ok() {
            info!("http_post finished");
        }
        result
    }

    async fn http_get_inner<const N: usize>(
        &mut self,
        url: &str,
        connect_timeout: Option<u16>,
        response_timeout: Option<u16>,
    ) -> Result<HttpResponse<N>> {
        self.http_set_param_timeout(connect_timeout, response_timeout).await?;
        self.http_set_url(url).await?;

        let (status_code, body_len) = self
            .http_action(METHOD_GET, connect_timeout, response_timeout)
            .await?;
        info!(
            "HTTP response code {} with body len: {}, retrieving response body",
            status_code, body_len
        );

        let mut body: Vec<u8, N> = Vec::new();
        if body_len > 0 {
            if body_len > N {
                error!("response body does not fit the caller's buffer");
                return Err(Error::BufferOverflow);
            }
            body.resize_default(body_len).map_err(|_| Error::BufferOverflow)?;
            self.http_read_body(&mut body).await?;
        }

        Ok(HttpResponse {
            status_code,
            body_len,
            body,
        })
    }

    async fn http_post_inner(
        &mut self,
        url: &str,
        body: &[u8],
        content_type: Option<&str>,
        connect_timeout: Option<u16>,
        response_timeout: Option<u16>,
    ) -> Result<HttpResponse<0>> {
        self.http_set_param_timeout(connect_timeout, response_timeout).await?;

        if let Some(content_type) = content_type {
            let mut cmd: String<128> = String::new();
            write!(cmd, "+HTTPPARA=\"CONTENT\",\"{content_type}\"")
                .map_err(|_| Error::BufferOverflow)?;
            self.at.send_at(cmd.as_str()).await?;
            self.at.wait_ok().await.expect1()?;
        }

        self.http_set_url(url).await?;

        // body length announced up front; the module opens a DOWNLOAD prompt
        let mut cmd: String<32> = String::new();
        write!(cmd, "+HTTPDATA={},10", body.len()).map_err(|_| Error::BufferOverflow)?;
        self.at.send_at(cmd.as_str()).await?;
        self.at.wait_prefix("DOWNLOAD").await.expect1()?;

        info!("DOWNLOAD prompt received, sending request body");
        self.at.send_raw(body).await?;
        self.at.wait_ok_within(UPLOAD_WINDOW).await.expect1()?;

        let (status_code, _) = self
            .http_action(METHOD_POST, connect_timeout, response_timeout)
            .await?;
        info!("HTTP response code {}", status_code);

        // the response body is left in the module on the POST path
        Ok(HttpResponse {
            status_code,
            body_len: 0,
            body: Vec::new(),
        })
    }

    async fn http_init(&mut self) -> Result<()> {
        self.at.send_at("+HTTPINIT").await?;
        match self.at.wait_ok().await.expect1() {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("failed to initialize the module HTTP service");
                Err(e)
            }
        }
    }

    async fn http_terminate(&mut self) {
        // best effort; after a timeout this is merely an attempt
        if self.at.send_at("+HTTPTERM").await.is_err() {
            return;
        }
        if self.at.wait_ok().await != AtResponse::Expected1 {
            warn!("failed to stop the module HTTP service");
        }
    }

    async fn http_set_param_timeout(
        &mut self,
        connect_timeout: Option<u16>,
        response_timeout: Option<u16>,
    ) -> Result<()> {
        if let Some(timeout) = connect_timeout {
            let mut cmd: String<40> = String::new();
            write!(cmd, "+HTTPPARA=\"CONNECTTO\",{timeout}").map_err(|_| Error::BufferOverflow)?;
            self.at.send_at(cmd.as_str()).await?;
            self.at.wait_ok().await.expect1()?;
        }

        if let Some(timeout) = response_timeout {
            let mut cmd: String<40> = String::new();
            write!(cmd, "+HTTPPARA=\"RECVTO\",{timeout}").map_err(|_| Error::BufferOverflow)?;
            self.at.send_at(cmd.as_str()).await?;
            self.at.wait_ok().await.expect1()?;
        }

        Ok(())
    }

    async fn http_set_url(&mut self, url: &str) -> Result<()> {
        let mut cmd: String<256> = String::new();
        write!(cmd, "+HTTPPARA=\"URL\",\"{url}\"").map_err(|_| Error::BufferOverflow)?;
        self.at.send_at(cmd.as_str()).await?;
        self.at.wait_ok().await.expect1()
    }

    /// Fires `+HTTPACTION` and parses the `<method>,<code>,<len>` report it
    /// finishes with.
    async fn http_action(
        &mut self,
        method: u8,
        connect_timeout: Option<u16>,
        response_timeout: Option<u16>,
    ) -> Result<(u16, usize)> {
        let mut cmd: String<20> = String::new();
        write!(cmd, "+HTTPACTION={method}").map_err(|_| Error::BufferOverflow)?;
        self.at.send_at(cmd.as_str()).await?;
        self.at.wait_ok().await.expect1()?;

        let window = self.action_wait_window(connect_timeout, response_timeout);
        self.at
            .wait_prefix_within(window, "+HTTPACTION:")
            .await
            .expect1()?;

        let line = self.at.recv_line().await?;
        let Some((_, code, len)) = parse::int_triple(line.as_str()) else {
            warn!("+HTTPACTION result value empty or malformed");
            return Err(Error::Failed);
        };
        if (700..=720).contains(&code) {
            // module error code, not an HTTP status (datasheet 16.3.2)
            warn!("+HTTPACTION failed with module errcode: {}", code);
            return Err(Error::Failed);
        }
        if !(0..=u16::MAX as i32).contains(&code) || len < 0 {
            return Err(Error::Failed);
        }

        Ok((code as u16, len as usize))
    }

    /// Total time `+HTTPACTION` may take: connect plus receive, with module
    /// defaults filling in what the caller left unset.
    fn action_wait_window(
        &self,
        connect_timeout: Option<u16>,
        response_timeout: Option<u16>,
    ) -> Duration {
        let connect = connect_timeout.unwrap_or(self.config.http_connect_timeout);
        let response = response_timeout.unwrap_or(self.config.http_response_timeout);
        Duration::from_secs(connect as u64 + response as u64)
    }

    /// Streams the response body out of the module in chunks, verifying
    /// every announced slice length on the way.
    async fn http_read_body(&mut self, body: &mut [u8]) -> Result<()> {
        let chunk_size = self.config.http_read_chunk_size.min(HTTP_READ_CHUNK_MAX);
        let mut chunk = [0u8; HTTP_READ_CHUNK_MAX];
        let mut offset = 0;
        let started = Instant::now();

        while offset < body.len() {
            let mut cmd: String<32> = String::new();
            write!(cmd, "+HTTPREAD={offset},{chunk_size}").map_err(|_| Error::BufferOverflow)?;
            self.at.send_at(cmd.as_str()).await?;

            // the first +HTTPREAD announces the slice length; the leading OK
            // is skipped over by the tail match
            if let Err(e) = self.at.wait_prefix("+HTTPREAD:").await.expect1() {
                warn!("no +HTTPREAD report for the requested slice");
                return Err(e);
            }
            let line = self.at.recv_line().await?;
            let announced: usize = line.as_str().trim().parse().map_err(|_| Error::Failed)?;

            let expected = chunk_size.min(body.len() - offset);
            if announced != expected {
                error!("announced slice len {} does not match expected {}", announced, expected);
                return Err(Error::Modem);
            }

            if self
                .at
                .retrieve_buffer(&mut chunk[..announced], CHUNK_TIMEOUT)
                .await
                .is_err()
            {
                error!("slice shorter than its announced {} bytes", announced);
                return Err(Error::Modem);
            }

            // consume the closing +HTTPREAD: 0 and whatever trails it
            self.at.wait_prefix("+HTTPREAD: 0").await;
            self.at.clear_buffer().await;

            body[offset..offset + announced].copy_from_slice(&chunk[..announced]);
            offset += chunk_size;
        }

        debug!("finished retrieving response body in {} ms", started.elapsed().as_millis());
        Ok(())
    }
}
