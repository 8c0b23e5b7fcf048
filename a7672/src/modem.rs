use core::fmt::Write as _;

use embassy_time::{Duration, Timer};
use embedded_hal::digital::OutputPin;
use heapless::String;

use crate::at::{AtEngine, AtResponse};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::parse;
use crate::serial::{DEFAULT_BAUD_RATE, SerialLine, SerialPort};
use crate::types::{CSQ_UNKNOWN, RadioTech};

/// Capacity for a SIM ICCID (19-20 digits).
pub const CCID_CAPACITY: usize = 24;
/// Capacity for a PDP address string.
pub const IP_ADDR_CAPACITY: usize = 64;

/// How long to wait for the module to start answering bare `AT`.
pub(crate) const MODULE_READY_WINDOW: Duration = Duration::from_secs(60);

/// Driver for a SIMCom A76xx cellular module.
///
/// All operations are strictly sequential: the driver issues one command,
/// parses its response, and only then moves on. Upper layers must serialize
/// their calls; there is no interior locking.
pub struct Modem<S: SerialPort, P: OutputPin> {
    pub(crate) at: AtEngine<S, P>,
    pub(crate) config: Config,
    power: Option<P>,
    initialized: bool,
}

impl<S: SerialPort, P: OutputPin> Modem<S, P> {
    pub fn new(serial: SerialLine<S, P>, config: Config) -> Self {
        let at = AtEngine::new(serial, config.at_response_timeout);
        Self {
            at,
            config,
            power: None,
            initialized: false,
        }
    }

    /// Like [`new`](Self::new), with a PWRKEY pin the driver may pulse to
    /// power-cycle the module.
    pub fn with_power_pin(serial: SerialLine<S, P>, power: P, config: Config) -> Self {
        let mut modem = Self::new(serial, config);
        modem.power = Some(power);
        modem
    }

    /// First-time bring-up: opens the serial line, powers the module on if a
    /// power pin is wired, waits for the AT interface, and puts the dialect
    /// into a known state (echo off, GPRS event reporting off, identity
    /// printed).
    ///
    /// Safe to call again; subsequent calls are no-ops.
    pub async fn init(&mut self) -> Result<()> {
        if self.initialized {
            info!("module already initialized");
            return Ok(());
        }

        self.at.serial_mut().init()?;
        self.at.serial_mut().open(DEFAULT_BAUD_RATE).await?;

        if self.power.is_some() {
            self.power_on().await?;
        }

        info!("checking module readiness");
        if !self.at.test_at(MODULE_READY_WINDOW).await {
            warn!("cellular module never became ready");
            return Err(Error::Timeout);
        }

        self.apply_dialect_setup().await?;

        // Print product identification information
        self.at.send_raw(b"ATI").await?;
        self.at.wait_ok().await;

        self.initialized = true;
        Ok(())
    }

    /// Re-runs the dialect setup after an external reset or power cycle.
    pub async fn reinitialize(&mut self) -> Result<()> {
        info!("reinitializing module");
        if !self.at.test_at(MODULE_READY_WINDOW).await {
            warn!("cellular module never became ready");
            return Err(Error::Timeout);
        }
        self.apply_dialect_setup().await
    }

    async fn apply_dialect_setup(&mut self) -> Result<()> {
        // Disable echo
        self.at.send_at("E0").await?;
        self.at.wait_ok().await;
        Timer::after(self.config.init_settle_pause).await;

        // Disable GPRS event reporting (URC)
        self.at.send_at("+CGEREP=0").await?;
        self.at.wait_ok().await;
        Timer::after(self.config.init_settle_pause).await;

        Ok(())
    }

    /// Pulses PWRKEY with the module's power-on timing.
    pub async fn power_on(&mut self) -> Result<()> {
        let Some(power) = self.power.as_mut() else {
            warn!("no power pin wired, skipping power on");
            return Ok(());
        };
        power.set_low().map_err(|_| Error::Gpio)?;
        Timer::after_millis(500).await;
        power.set_high().map_err(|_| Error::Gpio)?;
        Timer::after_millis(100).await;
        power.set_low().map_err(|_| Error::Gpio)?;
        Timer::after_millis(100).await;
        Ok(())
    }

    /// Requests a software power-down via `+CPOF`; pulses PWRKEY instead
    /// when `force` is set or the module does not acknowledge the request.
    pub async fn power_off(&mut self, force: bool) -> Result<()> {
        if !force {
            self.at.send_at("+CPOF").await?;
            if self.at.wait_ok().await == AtResponse::Expected1 {
                info!("module powered off");
                return Ok(());
            }
        }

        warn!("forcing module power off");
        let Some(power) = self.power.as_mut() else {
            return Err(Error::Gpio);
        };
        power.set_high().map_err(|_| Error::Gpio)?;
        Timer::after_millis(1300).await;
        power.set_low().map_err(|_| Error::Gpio)?;
        Ok(())
    }

    /// Resets the module via `+CRESET`.
    pub async fn reset(&mut self) -> Result<()> {
        self.at.send_at("+CRESET").await?;
        match self.at.wait_ok().await.expect1() {
            Ok(()) => {
                info!("module reset");
                Ok(())
            }
            Err(e) => {
                warn!("failed to reset module");
                Err(e)
            }
        }
    }

    /// Closes the serial line so the surrounding firmware can drop into low
    /// power.
    pub async fn sleep(&mut self) {
        self.at.serial_mut().close().await;
    }

    /// Pings the module with bare `AT` until it answers or `window` lapses.
    pub async fn test_at(&mut self, window: Duration) -> bool {
        self.at.test_at(window).await
    }

    /// `AT+CPIN?`: whether the SIM reports `READY`.
    pub async fn is_sim_ready(&mut self) -> Result<()> {
        self.at.send_at("+CPIN?").await?;
        self.at.wait_prefix("+CPIN:").await.expect1()?;
        let value = self.at.recv_line().await?;
        self.at.wait_ok().await;
        if value.as_str() != "READY" {
            // SIM PIN, SIM PUK and friends all land here
            warn!("SIM not ready: {}", value.as_str());
            return Err(Error::Failed);
        }
        Ok(())
    }

    /// `AT+CICCID`: the ICCID printed on the SIM.
    pub async fn retrieve_sim_ccid(&mut self) -> Result<String<CCID_CAPACITY>> {
        self.at.send_at("+CICCID").await?;
        self.at.wait_prefix("+ICCID:").await.expect1()?;
        let line = self.at.recv_line().await?;
        self.at.wait_ok().await;

        let mut ccid: String<CCID_CAPACITY> = String::new();
        ccid.push_str(line.as_str().trim()).map_err(|_| Error::BufferOverflow)?;
        Ok(ccid)
    }

    /// `AT+CSQ`: the raw RSSI. A value the module or the parser cannot make
    /// sense of comes back as [`CSQ_UNKNOWN`].
    pub async fn retrieve_signal(&mut self) -> Result<u8> {
        self.at.send_at("+CSQ").await?;
        self.at.wait_prefix("+CSQ:").await.expect1()?;
        let line = self.at.recv_line().await?;
        // <rssi>,<ber>; <ber> is ignored
        let rssi = match parse::int_pair(line.as_str()) {
            Some((rssi, _)) if (0..=99).contains(&rssi) => rssi as u8,
            _ => CSQ_UNKNOWN,
        };
        self.at.wait_ok().await;
        Ok(rssi)
    }

    /// `AT+CGPADDR=1`: the address bound to the first PDP context.
    pub async fn retrieve_ip_addr(&mut self) -> Result<String<IP_ADDR_CAPACITY>> {
        self.at.send_at("+CGPADDR=1").await?;
        self.at.wait_prefix("+CGPADDR: 1,").await.expect1()?;
        let addr = self.at.recv_line().await?;
        self.at.wait_ok().await;
        Ok(addr)
    }

    /// Queries the registration status command matching `ct` and reports
    /// whether the module is registered (home or roaming).
    pub async fn is_network_registered(&mut self, ct: RadioTech) -> Result<()> {
        let name = ct.registration_command().ok_or(Error::UnsupportedRadioTech)?;
        let mut query: String<16> = String::new();
        write!(query, "+{name}?").map_err(|_| Error::BufferOverflow)?;
        self.at.send_at(query.as_str()).await?;

        let timeout = self.at.default_timeout();
        match self
            .at
            .wait_response(timeout, "+CREG:", "+CEREG:", Some("+CGREG:"))
            .await
        {
            AtResponse::Expected1 | AtResponse::Expected2 | AtResponse::Expected3 => {}
            _ => return Err(Error::Timeout),
        }

        let line = self.at.recv_line().await?;
        let registered = matches!(
            parse::int_pair(line.as_str()),
            Some((n, stat)) if (n == 0 || n == 1) && (stat == 1 || stat == 5)
        );
        self.at.wait_ok().await;

        if registered { Ok(()) } else { Err(Error::Failed) }
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &S {
        self.at.serial().port()
    }
}
