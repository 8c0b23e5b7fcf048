//! MQTT through the module's built-in client.
//!
//! The session is scoped around the module's service lifecycle: a started
//! context (`+CMQTTSTART`) is always stopped again, also when acquiring the
//! client or connecting to the broker fails mid-way. Topic and payload go
//! through `>` sub-prompts, so the receive buffer is cleared after every
//! step to keep prompt residue out of the next exchange.

use core::fmt::Write as _;

use embassy_time::{Duration, Timer};
use embedded_hal::digital::OutputPin;
use heapless::String;

use crate::at::AtResponse;
use crate::error::{Error, Result};
use crate::modem::Modem;
use crate::serial::SerialPort;

/// Window for the `+CMQTTSTART` report.
const START_WINDOW: Duration = Duration::from_secs(12);
/// Window for the broker connection to come up.
const CONNECT_WINDOW: Duration = Duration::from_secs(30);
/// Window for a clean disconnect, mirrored in the `+CMQTTDISC` argument.
const DISCONNECT_WINDOW: Duration = Duration::from_secs(60);

impl<S: SerialPort, P: OutputPin> Modem<S, P> {
    /// Starts the MQTT context, acquires the one client the module offers,
    /// and connects it to the broker over plain TCP.
    ///
    /// Credentials are optional; a password is only sent along with a
    /// username.
    pub async fn mqtt_connect(
        &mut self,
        client_id: &str,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        self.mqtt_start().await?;

        if let Err(e) = self.mqtt_acquire_client(client_id).await {
            self.mqtt_stop().await;
            return Err(e);
        }

        Timer::after(self.config.mqtt_acquire_settle).await;

        if let Err(e) = self.mqtt_open_connection(host, port, username, password).await {
            self.mqtt_release().await;
            self.mqtt_stop().await;
            return Err(e);
        }

        Ok(())
    }

    /// Disconnects from the broker and tears the MQTT context down.
    pub async fn mqtt_disconnect(&mut self) -> Result<()> {
        self.at.send_at("+CMQTTDISC=0,60").await?;
        match self
            .at
            .wait_prefix_within(DISCONNECT_WINDOW, "+CMQTTDISC: 0,")
            .await
        {
            AtResponse::Expected1 => {}
            _ => {
                self.at.clear_buffer().await;
                return Err(Error::Modem);
            }
        }
        let code = self.at.recv_line().await?;
        if code.as_str().trim() != "0" {
            error!("+CMQTTDISC error result: {}", code.as_str());
            return Err(Error::Modem);
        }
        self.at.clear_buffer().await;

        self.at.send_at("+CMQTTREL=0").await?;
        let released = self.at.wait_ok().await;
        self.at.clear_buffer().await;
        if released != AtResponse::Expected1 {
            return Err(Error::Modem);
        }

        self.at.send_at("+CMQTTSTOP").await?;
        let stopped = self.at.wait_ok().await;
        self.at.clear_buffer().await;
        if stopped != AtResponse::Expected1 {
            return Err(Error::Modem);
        }

        Ok(())
    }

    /// Publishes one message on an established connection.
    pub async fn mqtt_publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: u8,
        timeout_s: u16,
    ) -> Result<()> {
        // topic through the prompt, length announced up front
        let mut cmd: String<32> = String::new();
        write!(cmd, "+CMQTTTOPIC=0,{}", topic.len()).map_err(|_| Error::BufferOverflow)?;
        self.at.send_at(cmd.as_str()).await?;
        if let Err(e) = self.at.wait_prefix(">").await.expect1() {
            warn!("no prompt for +CMQTTTOPIC");
            return Err(e);
        }
        self.at.send_raw(topic.as_bytes()).await?;
        self.at.wait_ok().await.expect1()?;
        self.at.clear_buffer().await;

        // payload the same way
        let mut cmd: String<32> = String::new();
        write!(cmd, "+CMQTTPAYLOAD=0,{}", payload.len()).map_err(|_| Error::BufferOverflow)?;
        self.at.send_at(cmd.as_str()).await?;
        if let Err(e) = self.at.wait_prefix(">").await.expect1() {
            warn!("no prompt for +CMQTTPAYLOAD");
            return Err(e);
        }
        self.at.send_raw(payload).await?;
        self.at.wait_ok().await.expect1()?;
        self.at.clear_buffer().await;

        let mut cmd: String<32> = String::new();
        write!(cmd, "+CMQTTPUB=0,{qos},{timeout_s},{retain}").map_err(|_| Error::BufferOverflow)?;
        self.at.send_at(cmd.as_str()).await?;
        let window = Duration::from_secs(timeout_s as u64);
        match self.at.wait_prefix_within(window, "+CMQTTPUB: 0,").await {
            AtResponse::Expected1 => {}
            AtResponse::Timeout => return Err(Error::Timeout),
            _ => return Err(Error::Modem),
        }
        let code = self.at.recv_line().await?;
        if code.as_str().trim() != "0" {
            error!("+CMQTTPUB failed with value {}", code.as_str());
            return Err(Error::Modem);
        }
        self.at.clear_buffer().await;

        Ok(())
    }

    async fn mqtt_start(&mut self) -> Result<()> {
        self.at.send_at("+CMQTTSTART").await?;
        match self.at.wait_prefix_within(START_WINDOW, "+CMQTTSTART:").await {
            AtResponse::Expected1 => {
                let code = self.at.recv_line().await?;
                if code.as_str().trim() != "0" {
                    error!("+CMQTTSTART failed with value {}", code.as_str());
                    return Err(Error::Modem);
                }
                self.at.clear_buffer().await;
                Ok(())
            }
            AtResponse::Expected2 => {
                // the module reports ERROR when the context is already up
                info!("+CMQTTSTART returned error, mqtt context already started");
                Ok(())
            }
            _ => {
                warn!("timeout waiting for +CMQTTSTART response");
                Err(Error::Timeout)
            }
        }
    }

    async fn mqtt_acquire_client(&mut self, client_id: &str) -> Result<()> {
        let mut cmd: String<160> = String::new();
        write!(cmd, "+CMQTTACCQ=0,\"{client_id}\",0").map_err(|_| Error::BufferOverflow)?;
        self.at.send_at(cmd.as_str()).await?;
        self.at.wait_ok().await.expect1()
    }

    async fn mqtt_open_connection(
        &mut self,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        // keep alive 120, clean session 1
        let mut cmd: String<256> = String::new();
        match (username, password) {
            (Some(user), Some(pass)) => {
                info!("connect with username and password");
                write!(
                    cmd,
                    "+CMQTTCONNECT=0,\"tcp://{host}:{port}\",120,1,\"{user}\",\"{pass}\""
                )
            }
            (Some(user), None) => {
                info!("connect with username only");
                write!(cmd, "+CMQTTCONNECT=0,\"tcp://{host}:{port}\",120,1,\"{user}\"")
            }
            _ => write!(cmd, "+CMQTTCONNECT=0,\"tcp://{host}:{port}\",120,1"),
        }
        .map_err(|_| Error::BufferOverflow)?;

        self.at.send_at(cmd.as_str()).await?;
        match self
            .at
            .wait_prefix_within(CONNECT_WINDOW, "+CMQTTCONNECT: 0,")
            .await
        {
            AtResponse::Expected1 => {}
            AtResponse::Timeout => {
                self.at.clear_buffer().await;
                return Err(Error::Timeout);
            }
            _ => {
                self.at.clear_buffer().await;
                return Err(Error::Modem);
            }
        }

        let code = self.at.recv_line().await?;
        if code.as_str().trim() != "0" {
            error!("+CMQTTCONNECT error result: {}", code.as_str());
            return Err(Error::Modem);
        }
        self.at.clear_buffer().await;

        Ok(())
    }

    async fn mqtt_release(&mut self) {
        if self.at.send_at("+CMQTTREL=0").await.is_err() {
            return;
        }
        if self.at.wait_ok().await != AtResponse::Expected1 {
            warn!("failed to release the mqtt client");
        }
        self.at.clear_buffer().await;
    }

    async fn mqtt_stop(&mut self) {
        if self.at.send_at("+CMQTTSTOP").await.is_err() {
            return;
        }
        if self.at.wait_ok().await != AtResponse::Expected1 {
            warn!("failed to stop the mqtt context");
        }
        self.at.clear_buffer().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedPort, modem, run};

    fn connected_broker_rules(port: &mut ScriptedPort) {
        port.on("AT+CMQTTSTART", "OK\r\n+CMQTTSTART: 0\r\n");
        port.on("AT+CMQTTACCQ=0,\"station-42\",0", "OK\r\n");
        port.on(
            "AT+CMQTTCONNECT=0,\"tcp://broker.example.com:1883\",120,1",
            "OK\r\n+CMQTTCONNECT: 0,0\r\n",
        );
    }

    #[test]
    fn connect_and_publish() {
        let mut port = ScriptedPort::new();
        connected_broker_rules(&mut port);
        port.on("AT+CMQTTTOPIC=0,8", ">");
        port.on("measures", "OK\r\n");
        port.on("AT+CMQTTPAYLOAD=0,4", ">");
        port.on("22,7", "OK\r\n");
        port.on("AT+CMQTTPUB=0,1,15,0", "OK\r\n+CMQTTPUB: 0,0\r\n");
        let mut m = modem(port);

        run(async {
            assert_eq!(
                m.mqtt_connect("station-42", "broker.example.com", 1883, None, None).await,
                Ok(())
            );
            assert_eq!(m.mqtt_publish("measures", b"22,7", 1, 0, 15).await, Ok(()));
        });
    }

    #[test]
    fn connect_with_credentials() {
        let mut port = ScriptedPort::new();
        port.on("AT+CMQTTSTART", "OK\r\n+CMQTTSTART: 0\r\n");
        port.on("AT+CMQTTACCQ=0,\"station-42\",0", "OK\r\n");
        port.on(
            "AT+CMQTTCONNECT=0,\"tcp://broker.example.com:1883\",120,1,\"user\",\"secret\"",
            "OK\r\n+CMQTTCONNECT: 0,0\r\n",
        );
        let mut m = modem(port);

        run(async {
            assert_eq!(
                m.mqtt_connect(
                    "station-42",
                    "broker.example.com",
                    1883,
                    Some("user"),
                    Some("secret"),
                )
                .await,
                Ok(())
            );
        });
    }

    #[test]
    fn start_error_means_already_started() {
        let mut port = ScriptedPort::new();
        port.on("AT+CMQTTSTART", "ERROR\r\n");
        port.on("AT+CMQTTACCQ=0,\"station-42\",0", "OK\r\n");
        port.on(
            "AT+CMQTTCONNECT=0,\"tcp://broker.example.com:1883\",120,1",
            "OK\r\n+CMQTTCONNECT: 0,0\r\n",
        );
        let mut m = modem(port);

        run(async {
            assert_eq!(
                m.mqtt_connect("station-42", "broker.example.com", 1883, None, None).await,
                Ok(())
            );
        });
    }

    #[test]
    fn failed_client_acquisition_stops_the_context() {
        let mut port = ScriptedPort::new();
        port.on("AT+CMQTTSTART", "OK\r\n+CMQTTSTART: 0\r\n");
        port.on("AT+CMQTTACCQ=0,\"station-42\",0", "ERROR\r\n");
        port.on("AT+CMQTTSTOP", "OK\r\n");
        let mut m = modem(port);

        run(async {
            let got = m.mqtt_connect("station-42", "broker.example.com", 1883, None, None).await;
            assert_eq!(got, Err(Error::Modem));
        });
        assert_eq!(m.transport().count("AT+CMQTTSTOP"), 1);
        assert!(!m.transport().sent("AT+CMQTTREL=0"));
    }

    #[test]
    fn failed_broker_connection_releases_and_stops() {
        let mut port = ScriptedPort::new();
        port.on("AT+CMQTTSTART", "OK\r\n+CMQTTSTART: 0\r\n");
        port.on("AT+CMQTTACCQ=0,\"station-42\",0", "OK\r\n");
        port.on(
            "AT+CMQTTCONNECT=0,\"tcp://broker.example.com:1883\",120,1",
            "OK\r\n+CMQTTCONNECT: 0,12\r\n",
        );
        port.on("AT+CMQTTREL=0", "OK\r\n");
        port.on("AT+CMQTTSTOP", "OK\r\n");
        let mut m = modem(port);

        run(async {
            let got = m.mqtt_connect("station-42", "broker.example.com", 1883, None, None).await;
            assert_eq!(got, Err(Error::Modem));
        });
        assert_eq!(m.transport().count("AT+CMQTTREL=0"), 1);
        assert_eq!(m.transport().count("AT+CMQTTSTOP"), 1);
    }

    #[test]
    fn disconnect_walks_the_full_teardown() {
        let mut port = ScriptedPort::new();
        port.on("AT+CMQTTDISC=0,60", "OK\r\n+CMQTTDISC: 0,0\r\n");
        port.on("AT+CMQTTREL=0", "OK\r\n");
        port.on("AT+CMQTTSTOP", "OK\r\n");
        let mut m = modem(port);

        run(async {
            assert_eq!(m.mqtt_disconnect().await, Ok(()));
        });
        assert!(m.transport().sent("AT+CMQTTDISC=0,60"));
        assert!(m.transport().sent("AT+CMQTTREL=0"));
        assert!(m.transport().sent("AT+CMQTTSTOP"));
    }

    #[test]
    fn publish_surfaces_a_rejected_message() {
        let mut port = ScriptedPort::new();
        port.on("AT+CMQTTTOPIC=0,8", ">");
        port.on("measures", "OK\r\n");
        port.on("AT+CMQTTPAYLOAD=0,4", ">");
        port.on("22,7", "OK\r\n");
        port.on("AT+CMQTTPUB=0,1,15,0", "OK\r\n+CMQTTPUB: 0,13\r\n");
        let mut m = modem(port);

        run(async {
            let got = m.mqtt_publish("measures", b"22,7", 1, 0, 15).await;
            assert_eq!(got, Err(Error::Modem));
        });
    }
}
