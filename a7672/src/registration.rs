//! Network registration: a state machine that walks the module from cold to
//! data-ready.
//!
//! Every phase does a small amount of work and names the phase to run next.
//! Soft failures retry in place after a pause; a module that stops
//! answering sends the machine back to the readiness check. The caller's
//! overall deadline always wins: the loop runs inside `with_timeout` and is
//! cancelled at its next suspension point once the deadline lapses.

use core::fmt::Write as _;

use embassy_time::{Duration, Instant, Timer, with_timeout};
use embedded_hal::digital::OutputPin;
use heapless::String;

use crate::at::AtResponse;
use crate::error::{Error, Result};
use crate::modem::{IP_ADDR_CAPACITY, MODULE_READY_WINDOW, Modem};
use crate::parse;
use crate::serial::SerialPort;
use crate::types::{CSQ_UNKNOWN, RadioTech, csq_is_valid};

use RegistrationPhase::*;

/// All bands the module family supports, 2G and LTE alike. Applied when the
/// network needs reconfiguring; the operator then narrows the selection.
const ALL_BANDS: &str = "+CNBP=0xFFFFFFFF7FFFFFFF,0x000007FF3FDF3FFF,0x000F";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum RegistrationPhase {
    /// AT interface answering and SIM ready.
    CheckModuleReady,
    /// Registration reporting off, radio technology selected.
    PrepareRegistration,
    /// Registration status as expected and signal usable.
    CheckNetworkRegistration,
    /// Service mode usable and packet domain attached.
    EnsureServiceReady,
    /// APN, bands and operator selection reapplied.
    ConfigureNetwork,
    /// PDP context activated, packet domain force-attached.
    ConfigureService,
    /// Final signal and address check.
    NetworkRegistered,
}

impl<S: SerialPort, P: OutputPin> Modem<S, P> {
    /// Registers the module on the network and activates packet data.
    ///
    /// On success the module is registered (home or roaming) with a usable
    /// signal, the packet domain is attached, and the returned string is the
    /// address bound to the first PDP context. On deadline expiry the call
    /// returns [`Error::Timeout`], no later than one suspension point past
    /// `overall_timeout`.
    pub async fn start_network_registration(
        &mut self,
        ct: RadioTech,
        apn: &str,
        overall_timeout: Duration,
    ) -> Result<String<IP_ADDR_CAPACITY>> {
        if ct.mode_code().is_none() {
            return Err(Error::UnsupportedRadioTech);
        }

        info!("start operation network registration");
        match with_timeout(overall_timeout, self.registration_loop(ct, apn)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("register to network operation timeout");
                Err(Error::Timeout)
            }
        }
    }

    async fn registration_loop(
        &mut self,
        ct: RadioTech,
        apn: &str,
    ) -> Result<String<IP_ADDR_CAPACITY>> {
        let mut phase = CheckModuleReady;
        // clock for the phases that are allowed to stall before a fallback
        let mut phase_started = Instant::now();

        loop {
            phase = match phase {
                CheckModuleReady => self.check_module_ready().await,
                PrepareRegistration => {
                    let next = self.prepare_registration(ct).await;
                    phase_started = Instant::now();
                    next
                }
                CheckNetworkRegistration => {
                    if phase_started.elapsed() > self.config.registration_check_window {
                        debug!("registration unsettled too long, configuring network");
                        ConfigureNetwork
                    } else {
                        let next = self.check_network_registration(ct).await;
                        if next == EnsureServiceReady {
                            phase_started = Instant::now();
                        }
                        next
                    }
                }
                EnsureServiceReady => {
                    if phase_started.elapsed() > self.config.service_check_window {
                        debug!("service not ready too long, configuring service");
                        ConfigureService
                    } else {
                        self.ensure_service_ready().await
                    }
                }
                ConfigureNetwork => {
                    let next = self.configure_network(apn).await;
                    phase_started = Instant::now();
                    next
                }
                ConfigureService => {
                    let next = self.configure_service().await;
                    phase_started = Instant::now();
                    next
                }
                NetworkRegistered => match self.confirm_network_registered().await {
                    Ok(addr) => {
                        info!("network registration finished");
                        return Ok(addr);
                    }
                    Err(next) => {
                        phase_started = Instant::now();
                        next
                    }
                },
            };

            // give the executor a break between iterations
            Timer::after_millis(1).await;
        }
    }

    async fn check_module_ready(&mut self) -> RegistrationPhase {
        if !self.at.test_at(MODULE_READY_WINDOW).await {
            Timer::after(self.config.registration_retry_pause).await;
            return CheckModuleReady;
        }
        if self.is_sim_ready().await.is_err() {
            Timer::after(self.config.registration_retry_pause).await;
            return CheckModuleReady;
        }

        debug!("continue: prepare registration");
        PrepareRegistration
    }

    async fn prepare_registration(&mut self, ct: RadioTech) -> RegistrationPhase {
        if self.disable_registration_urc(ct).await.is_err() {
            warn!("failed to disable registration reporting");
        }
        if self.apply_radio_tech(ct).await.is_err() {
            warn!("failed to apply radio technology");
        }

        debug!("continue: check network registration");
        CheckNetworkRegistration
    }

    async fn check_network_registration(&mut self, ct: RadioTech) -> RegistrationPhase {
        let status = if ct == RadioTech::Auto {
            self.check_any_registration().await
        } else {
            self.is_network_registered(ct).await
        };
        match status {
            Err(Error::Timeout) => return CheckModuleReady,
            Err(_) => {
                Timer::after(self.config.registration_retry_pause).await;
                return CheckNetworkRegistration;
            }
            Ok(()) => {}
        }

        match self.retrieve_signal().await {
            Err(Error::Timeout) => return CheckModuleReady,
            Ok(csq) if csq_is_valid(csq) => {}
            _ => {
                Timer::after(self.config.registration_retry_pause).await;
                return CheckNetworkRegistration;
            }
        }

        debug!("continue: ensure service ready");
        EnsureServiceReady
    }

    /// Walks the registration status commands in order and accepts the
    /// first one reporting registered.
    async fn check_any_registration(&mut self) -> Result<()> {
        for ct in [RadioTech::Auto, RadioTech::TwoG, RadioTech::Lte] {
            match self.is_network_registered(ct).await {
                Ok(()) => return Ok(()),
                Err(Error::Timeout) => return Err(Error::Timeout),
                Err(_) => {}
            }
        }
        Err(Error::Failed)
    }

    async fn ensure_service_ready(&mut self) -> RegistrationPhase {
        match self.is_service_available().await {
            Err(Error::Timeout) => return CheckModuleReady,
            Err(_) => {
                Timer::after(self.config.registration_retry_pause).await;
                return EnsureServiceReady;
            }
            Ok(()) => {}
        }

        match self.ensure_packet_domain_attached(false).await {
            Err(Error::Timeout) => return CheckModuleReady,
            Err(_) => {
                Timer::after(self.config.registration_retry_pause).await;
                return EnsureServiceReady;
            }
            Ok(()) => {}
        }

        debug!("continue: network registered");
        NetworkRegistered
    }

    async fn configure_network(&mut self, apn: &str) -> RegistrationPhase {
        let signal = match self.retrieve_signal().await {
            Err(Error::Timeout) => return CheckModuleReady,
            Err(_) => CSQ_UNKNOWN,
            Ok(csq) => csq,
        };
        info!("cellular signal: {}", signal);

        if let Err(Error::Timeout) = self.apply_apn(apn).await {
            return CheckModuleReady;
        }

        match self.check_operator_selection().await {
            Err(Error::Timeout) => return CheckModuleReady,
            Ok(()) => {
                // selection already automatic, give registration another go
                debug!("continue: check network registration");
                return CheckNetworkRegistration;
            }
            Err(_) => {}
        }

        self.print_network_info().await;

        if let Err(Error::Timeout) = self.apply_preferred_bands().await {
            return CheckModuleReady;
        }

        info!("waiting for band settings to apply before reselecting operator");
        Timer::after(self.config.band_settle_pause).await;

        if let Err(Error::Timeout) = self.apply_operator_selection().await {
            return CheckModuleReady;
        }

        debug!("continue: check network registration");
        CheckNetworkRegistration
    }

    async fn configure_service(&mut self) -> RegistrationPhase {
        if let Err(Error::Timeout) = self.activate_pdp_context().await {
            return CheckModuleReady;
        }
        if let Err(Error::Timeout) = self.ensure_packet_domain_attached(true).await {
            return CheckModuleReady;
        }

        debug!("continue: check network registration");
        CheckNetworkRegistration
    }

    async fn confirm_network_registered(
        &mut self,
    ) -> core::result::Result<String<IP_ADDR_CAPACITY>, RegistrationPhase> {
        let signal = match self.retrieve_signal().await {
            Err(Error::Timeout) => return Err(CheckModuleReady),
            Err(_) => CSQ_UNKNOWN,
            Ok(csq) => csq,
        };
        if !csq_is_valid(signal) {
            Timer::after(self.config.registration_retry_pause).await;
            return Err(EnsureServiceReady);
        }
        info!("signal ready at: {}", signal);

        match self.retrieve_ip_addr().await {
            Ok(addr) if !addr.is_empty() => {
                info!("IP addr: {}", addr.as_str());
                Ok(addr)
            }
            _ => Err(EnsureServiceReady),
        }
    }

    async fn disable_registration_urc(&mut self, ct: RadioTech) -> Result<()> {
        if ct == RadioTech::Auto {
            // every registration reporting command the module knows
            for cmd in ["+CREG=0", "+CGREG=0", "+CEREG=0"] {
                self.at.send_at(cmd).await?;
                self.at.wait_ok().await.expect1()?;
            }
            return Ok(());
        }

        let name = ct.registration_command().ok_or(Error::UnsupportedRadioTech)?;
        let mut cmd: String<16> = String::new();
        write!(cmd, "+{name}=0").map_err(|_| Error::BufferOverflow)?;
        self.at.send_at(cmd.as_str()).await?;
        self.at.wait_ok().await.expect1()
    }

    /// Selects the radio technology, skipping the write when the module is
    /// already in the wanted mode so a settled registration is not bounced.
    async fn apply_radio_tech(&mut self, ct: RadioTech) -> Result<()> {
        let mode = ct.mode_code().ok_or(Error::UnsupportedRadioTech)?;

        self.at.send_at("+CNMP?").await?;
        let current = match self.at.wait_prefix("+CNMP:").await {
            AtResponse::Expected1 => {
                let line = self.at.recv_line().await?;
                self.at.wait_ok().await;
                line.as_str().trim().parse::<u8>().ok()
            }
            AtResponse::Timeout => return Err(Error::Timeout),
            _ => None,
        };
        if current == Some(mode) {
            debug!("radio technology mode {} already selected", mode);
            return Ok(());
        }

        let mut cmd: String<16> = String::new();
        write!(cmd, "+CNMP={mode}").map_err(|_| Error::BufferOverflow)?;
        self.at.send_at(cmd.as_str()).await?;
        self.at.wait_ok().await.expect1()
    }

    /// `+CNSMOD?`: the module must report something other than NO SERVICE.
    async fn is_service_available(&mut self) -> Result<()> {
        self.at.send_at("+CNSMOD?").await?;
        self.at.wait_prefix("+CNSMOD:").await.expect1()?;
        let line = self.at.recv_line().await?;
        self.at.wait_ok().await;

        match parse::int_pair(line.as_str()) {
            Some((_, 0)) | None => Err(Error::Failed),
            Some(_) => Ok(()),
        }
    }

    /// `+CGATT?`: packet domain attachment, optionally forcing an attach.
    async fn ensure_packet_domain_attached(&mut self, force_attach: bool) -> Result<()> {
        self.at.send_at("+CGATT?").await?;
        self.at.wait_prefix("+CGATT:").await.expect1()?;
        let state = self.at.recv_line().await?;
        self.at.wait_ok().await;

        if state.as_str().trim() == "1" {
            return Ok(());
        }
        if !force_attach {
            return Err(Error::Failed);
        }

        self.at.send_at("+CGATT=1").await?;
        self.at.wait_ok().await.expect1().map_err(|_| Error::Failed)
    }

    async fn apply_apn(&mut self, apn: &str) -> Result<()> {
        // bind the APN to pdp cid 1
        let mut cmd: String<128> = String::new();
        write!(cmd, "+CGDCONT=1,\"IP\",\"{apn}\"").map_err(|_| Error::BufferOverflow)?;
        self.at.send_at(cmd.as_str()).await?;
        self.at.wait_ok().await.expect1()
    }

    /// `+COPS?`: whether operator selection is already automatic with
    /// numeric format.
    async fn check_operator_selection(&mut self) -> Result<()> {
        self.at.send_at("+COPS?").await?;
        self.at.wait_prefix("+COPS:").await.expect1()?;
        let line = self.at.recv_line().await?;
        self.at.wait_ok().await;

        if line.as_str().starts_with("0,2,") {
            Ok(())
        } else {
            Err(Error::Failed)
        }
    }

    async fn apply_operator_selection(&mut self) -> Result<()> {
        self.at.send_at("+COPS=0,2").await?;
        self.at.wait_ok().await.expect1()
    }

    async fn apply_preferred_bands(&mut self) -> Result<()> {
        self.at.send_at(ALL_BANDS).await?;
        self.at.wait_ok().await.expect1()
    }

    /// Dumps band, operator and system diagnostics into the log.
    async fn print_network_info(&mut self) {
        let _ = self.at.send_at("+CNBP?").await;
        self.at.wait_ok().await;

        info!("listing operator selections, this can take a while");
        let _ = self.at.send_at("+COPS=?").await;
        self.at.wait_ok_within(Duration::from_secs(60)).await;

        let _ = self.at.send_at("+CPSI?").await;
        self.at.wait_ok().await;

        let _ = self.at.send_at("+CGDCONT?").await;
        self.at.wait_ok().await;
    }
}
