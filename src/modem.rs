//! Hayes modem emulation.
//!
//! [`HayesModem`] owns the command/data state machine that sits between the
//! vintage client and the VesperNet server. In command mode it answers AT
//! commands on the serial endpoint; `ATD` dials the server, runs the
//! credential/negotiation handshake, announces `CONNECT`, and hands both
//! endpoints to the bridge engine. When the bridge returns, the outcome
//! decides whether the carrier survives (`+++` escape keeps the TCP session
//! for a later `ATO`) or the modem hangs up.
//!
//! Response formatting follows the classic contract: verbose results are
//! `\r\n<word>\r\n`, non-verbose results are the single-digit codes
//! (`OK`=0, `CONNECT`=1, `NO CARRIER`=3, `ERROR`=4, `NO DIALTONE`=6,
//! `BUSY`=7) followed by CR. S-registers are stored and echoed but drive no
//! behaviour; that matches the modems this emulation stands in for closely
//! enough for every driver we have met.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bridge::{self, BridgeOutcome, BridgeSettings};
use crate::codec::StreamCodec;
use crate::config::Config;
use crate::endpoint::{Endpoint, EndpointError};
use crate::handshake::{self, HandshakeError, Negotiated};
use crate::hayes::{self, AtCommand, CommandBuffer};
use crate::transport;

/// Deadline for the TCP connect on dial.
const DIAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Command ↔ data state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemMode {
    Command,
    Data,
}

/// The emulated modem.
pub struct HayesModem {
    config: Arc<Config>,
    cancel: watch::Receiver<bool>,
    mode: ModemMode,
    connected: bool,
    link: Option<Endpoint>,
    registers: [u8; 256],
    echo: bool,
    verbose: bool,
    compression_req: bool,
    error_correction_req: bool,
    negotiated: Option<Negotiated>,
    command_buffer: CommandBuffer,
}

fn default_registers() -> [u8; 256] {
    let mut registers = [0u8; 256];
    registers[2] = 43; // escape character '+'
    registers[3] = 13; // CR
    registers[4] = 10; // LF
    registers[5] = 8; // BS
    registers[6] = 2; // blind dial wait
    registers[7] = 50; // carrier wait
    registers[12] = 50; // escape guard time, not consulted
    registers
}

impl HayesModem {
    pub fn new(config: Arc<Config>, cancel: watch::Receiver<bool>) -> Self {
        Self {
            config,
            cancel,
            mode: ModemMode::Command,
            connected: false,
            link: None,
            registers: default_registers(),
            echo: true,
            verbose: true,
            compression_req: false,
            error_correction_req: true,
            negotiated: None,
            command_buffer: CommandBuffer::new(),
        }
    }

    pub fn mode(&self) -> ModemMode {
        self.mode
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Drive the modem until the serial endpoint goes away or the supervisor
    /// cancels. Owns the serial endpoint for the whole emulation session.
    pub async fn run(mut self, serial: Endpoint) -> Result<(), EndpointError> {
        info!("Modem emulation started - waiting for AT commands");
        let mut serial = serial;
        let buffer_size = self.config.bridge.buffer_size;
        let mut cancel = self.cancel.clone();

        loop {
            if *cancel.borrow() {
                break;
            }
            let result = tokio::select! {
                _ = cancel.changed() => continue,
                r = serial.read(buffer_size) => r,
            };
            let data = result?;
            if data.is_empty() {
                if !serial.is_alive() {
                    info!("Serial endpoint closed, ending modem emulation");
                    break;
                }
                continue;
            }

            // Clients that skip ATO: raw PPP while a carrier is parked in
            // command mode re-enters data mode immediately.
            if self.connected
                && self.mode == ModemMode::Command
                && self.command_buffer.pending().is_empty()
                && hayes::looks_like_ppp(&data)
            {
                info!("PPP data detected - entering data mode immediately");
                let forwarded = match self.link.as_mut() {
                    Some(link) => link.write(&data).await,
                    None => Ok(0),
                };
                if let Err(e) = forwarded {
                    warn!("Carrier lost before data-mode re-entry: {e}");
                    self.drop_link().await;
                    self.send_no_carrier(&mut serial).await?;
                    continue;
                }
                serial = self.enter_bridge(serial).await?;
                continue;
            }

            let segments = self.command_buffer.push(&data);
            for segment in segments {
                match hayes::extract_at_command(&segment) {
                    Some(cmd) => {
                        info!("Processing command: {cmd}");
                        serial = self.execute(cmd, serial).await?;
                    }
                    None => {
                        if segment.iter().any(|b| !b.is_ascii_whitespace()) {
                            debug!("Discarding non-command segment ({} bytes)", segment.len());
                            self.send_error(&mut serial).await?;
                        }
                    }
                }
            }
        }

        self.drop_link().await;
        Ok(())
    }

    /// Dispatch one parsed command. Takes and returns the serial endpoint
    /// because dial/online hand it to the bridge engine wholesale.
    async fn execute(
        &mut self,
        cmd: String,
        mut serial: Endpoint,
    ) -> Result<Endpoint, EndpointError> {
        match hayes::classify(&cmd) {
            AtCommand::Dial(number) => {
                serial = self.handle_dial(&number, serial).await?;
            }
            AtCommand::Online => {
                serial = self.handle_online(serial).await?;
            }
            AtCommand::Hangup => {
                info!("Hangup command received");
                self.drop_link().await;
                self.mode = ModemMode::Command;
                self.send_ok(&mut serial).await?;
            }
            AtCommand::Answer => {
                // Nothing ever rings here
                self.send_no_carrier(&mut serial).await?;
            }
            AtCommand::Reset | AtCommand::Factory => {
                self.registers = default_registers();
                self.echo = true;
                self.verbose = true;
                self.compression_req = false;
                self.error_correction_req = true;
                self.send_ok(&mut serial).await?;
            }
            AtCommand::Echo(on) => {
                self.echo = on;
                self.send_ok(&mut serial).await?;
            }
            AtCommand::Verbose(on) => {
                self.verbose = on;
                self.send_ok(&mut serial).await?;
            }
            AtCommand::Identify(page) => {
                self.send_identity(page, &mut serial).await?;
            }
            AtCommand::SetRegister(index, value) => {
                self.registers[usize::from(index)] = value;
                self.send_ok(&mut serial).await?;
            }
            AtCommand::QueryRegister(index) => {
                let value = self.registers[usize::from(index)];
                self.send_info(&mut serial, &format!("{value:03}")).await?;
                self.send_ok(&mut serial).await?;
            }
            AtCommand::SelectRegister(_) => {
                self.send_ok(&mut serial).await?;
            }
            AtCommand::Compression(level) => {
                self.compression_req = level > 0;
                self.send_ok(&mut serial).await?;
            }
            AtCommand::SignalQuality => {
                self.send_info(&mut serial, "+CSQ: 31,99").await?;
                self.send_ok(&mut serial).await?;
            }
            AtCommand::Manufacturer => {
                self.send_info(&mut serial, "VesperNet").await?;
                self.send_ok(&mut serial).await?;
            }
            AtCommand::Model => {
                self.send_info(&mut serial, "Crossbridge 336").await?;
                self.send_ok(&mut serial).await?;
            }
            AtCommand::Revision => {
                self.send_info(&mut serial, env!("CARGO_PKG_VERSION")).await?;
                self.send_ok(&mut serial).await?;
            }
            AtCommand::Invalid => {
                self.send_error(&mut serial).await?;
            }
            AtCommand::Attention | AtCommand::Speaker | AtCommand::Generic(_) => {
                self.send_ok(&mut serial).await?;
            }
        }
        Ok(serial)
    }

    /// `ATD` — open the TCP session, authenticate, negotiate, CONNECT, and
    /// bridge. Any failure along the way ends in `NO CARRIER` and command
    /// mode; the client decides whether to redial.
    async fn handle_dial(
        &mut self,
        number: &str,
        mut serial: Endpoint,
    ) -> Result<Endpoint, EndpointError> {
        info!("Dial command: ATD{number}");
        self.drop_link().await;

        let server = &self.config.server;
        let mut link = match transport::dial(
            &server.host,
            server.port,
            DIAL_CONNECT_TIMEOUT,
            self.config.read_timeout(),
            self.config.write_timeout(),
        )
        .await
        {
            Ok(link) => link,
            Err(e) => {
                warn!("Dial failed: {e}");
                self.send_no_carrier(&mut serial).await?;
                return Ok(serial);
            }
        };

        let carry = match handshake::authenticate(&mut link, &server.username, &server.password)
            .await
        {
            Ok(carry) => carry,
            Err(e) => {
                warn!("Dial aborted: {e}");
                link.close().await;
                self.send_no_carrier(&mut serial).await?;
                return Ok(serial);
            }
        };

        let leftover = match handshake::negotiate(&mut link, carry).await {
            Ok((negotiated, leftover)) => {
                self.negotiated = Some(negotiated);
                leftover
            }
            Err(HandshakeError::NegotiationTimeout) => {
                warn!("Speed negotiation failed, using fallback");
                self.negotiated = Some(Negotiated {
                    speed: self.config.modem.connect_speed,
                    connection_type: "V.34+".to_string(),
                });
                Vec::new()
            }
            Err(e) => {
                warn!("Dial aborted: {e}");
                link.close().await;
                self.send_no_carrier(&mut serial).await?;
                return Ok(serial);
            }
        };
        link.set_read_timeout(self.config.read_timeout());

        if self.config.modem.chatter {
            self.send_dial_chatter(&mut serial).await?;
        }
        let connect = self.connect_response();
        serial.write(&connect).await?;

        if let Some(n) = &self.negotiated {
            info!(
                "Dial successful - DTE: {}, negotiated: {} bps ({})",
                self.config.serial.baud_rate, n.speed, n.connection_type
            );
        }

        if !leftover.is_empty() {
            serial.write(&leftover).await?;
        }

        self.link = Some(link);
        self.connected = true;
        self.enter_bridge(serial).await
    }

    /// `ATO` — back online on the parked carrier.
    async fn handle_online(&mut self, mut serial: Endpoint) -> Result<Endpoint, EndpointError> {
        if !self.connected || self.link.is_none() {
            warn!("ATO command but no active connection");
            self.send_no_carrier(&mut serial).await?;
            return Ok(serial);
        }
        info!("ATO command - returning to online mode");
        let connect = self.connect_response();
        serial.write(&connect).await?;
        self.enter_bridge(serial).await
    }

    /// Hand both endpoints to the bridge engine and absorb its outcome.
    async fn enter_bridge(&mut self, serial: Endpoint) -> Result<Endpoint, EndpointError> {
        let link = self.link.take().expect("bridge entered without a link");
        let settings = BridgeSettings {
            escape_enabled: true,
            buffer_size: self.config.bridge.buffer_size,
            inactivity_timeout: self.config.inactivity_timeout(),
            codec: self.armed_codec(),
        };
        self.mode = ModemMode::Data;

        let (outcome, mut serial, link) =
            bridge::run(serial, link, &settings, self.cancel.clone()).await;

        self.mode = ModemMode::Command;
        match outcome {
            BridgeOutcome::EscapeToCommand => {
                // Carrier stays up for ATO
                self.link = Some(link);
                self.send_ok(&mut serial).await?;
                info!("Returned to command mode via escape sequence");
            }
            BridgeOutcome::LcpTerminate
            | BridgeOutcome::PeerClosed
            | BridgeOutcome::Inactivity
            | BridgeOutcome::ServerSilent
            | BridgeOutcome::ClientHangup
            | BridgeOutcome::IoError => {
                self.link = Some(link);
                self.drop_link().await;
                info!("Connection ended ({}) - ready for new commands", outcome.as_str());
            }
        }
        Ok(serial)
    }

    /// The codec is armed only when both sides opted in during command-mode
    /// setup: the config switch and an `AT%C<n>` request.
    fn armed_codec(&self) -> Option<StreamCodec> {
        (self.config.bridge.enable_compression && self.compression_req).then(StreamCodec::new)
    }

    async fn drop_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.connected = false;
    }

    /// The mandatory `CONNECT` line: digits equal the negotiated speed,
    /// suffixes derive from it. Non-verbose mode collapses to code 1.
    fn connect_response(&self) -> Vec<u8> {
        if !self.verbose {
            return b"1\r".to_vec();
        }
        let (speed, connection_type) = match &self.negotiated {
            Some(n) => (n.speed, n.connection_type.as_str()),
            None => (self.config.modem.connect_speed, "V.34+"),
        };
        let line = if connection_type.contains("ISDN") {
            if connection_type.contains("64") {
                "CONNECT ISDN 64000".to_string()
            } else if connection_type.contains("112") {
                "CONNECT ISDN 112000/2B".to_string()
            } else if connection_type.contains("128") {
                "CONNECT ISDN 128000/2B+D".to_string()
            } else if connection_type.contains("192") {
                "CONNECT ISDN 192000/3B".to_string()
            } else if connection_type.contains("256") {
                "CONNECT ISDN 256000/4B".to_string()
            } else {
                format!("CONNECT ISDN {speed}")
            }
        } else if speed <= 2400 {
            format!("CONNECT {speed}")
        } else if speed <= 9600 {
            format!("CONNECT {speed}/ARQ")
        } else if speed <= 33600 {
            format!("CONNECT {speed}/ARQ/V42BIS")
        } else if speed <= 56000 {
            format!("CONNECT {speed}/ARQ/V90")
        } else {
            format!("CONNECT {speed}/ARQ")
        };
        format!("\r\n{line}\r\n").into_bytes()
    }

    /// Cosmetic call-progress lines before CONNECT. Timings roughly mimic a
    /// real trainer; drivers ignore them but humans watching a terminal
    /// expect the theatre.
    async fn send_dial_chatter(&self, serial: &mut Endpoint) -> Result<(), EndpointError> {
        let isdn = self
            .negotiated
            .as_ref()
            .is_some_and(|n| n.connection_type.contains("ISDN"));

        if isdn {
            self.send_info(serial, "Dialing ISDN number...").await?;
            tokio::time::sleep(Duration::from_millis(800)).await;
            self.send_info(serial, "ISDN call setup...").await?;
            tokio::time::sleep(Duration::from_millis(1000)).await;
            self.send_info(serial, "B-channel connected").await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
        } else {
            self.send_info(serial, "Dialing...").await?;
            tokio::time::sleep(Duration::from_millis(1000)).await;
            self.send_info(serial, "Ringing...").await?;
            tokio::time::sleep(Duration::from_millis(1500)).await;
            self.send_info(serial, "Carrier detected").await?;
            tokio::time::sleep(Duration::from_millis(800)).await;
        }

        if let Some(n) = &self.negotiated {
            self.send_info(serial, &format!("Protocol: {}", n.connection_type))
                .await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            if isdn {
                self.send_info(serial, "Compression: STAC/LZS").await?;
                tokio::time::sleep(Duration::from_millis(300)).await;
                self.send_info(serial, "Error Correction: LAPD").await?;
            } else {
                if n.speed >= 9600 {
                    self.send_info(serial, "Compression: V.42bis").await?;
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                if n.speed >= 2400 {
                    self.send_info(serial, "Error Correction: LAP-M").await?;
                }
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        Ok(())
    }

    async fn send_identity(&self, page: u8, serial: &mut Endpoint) -> Result<(), EndpointError> {
        match page {
            0 => {
                self.send_info(serial, "VesperNet Hayes Compatible Modem")
                    .await?;
            }
            1 => {
                if let (true, Some(n)) = (self.connected, &self.negotiated) {
                    self.send_info(
                        serial,
                        &format!("Connected at {} bps ({})", n.speed, n.connection_type),
                    )
                    .await?;
                    self.send_info(
                        serial,
                        &format!("DTE Speed: {} bps", self.config.serial.baud_rate),
                    )
                    .await?;
                    self.send_info(serial, &format!("DCE Speed: {} bps", n.speed))
                        .await?;
                } else {
                    self.send_info(serial, "Not connected").await?;
                }
            }
            3 => {
                self.send_info(serial, &format!("vnbridge {}", env!("CARGO_PKG_VERSION")))
                    .await?;
            }
            4 => {
                if let Some(n) = &self.negotiated {
                    self.send_info(serial, &format!("Line Speed: {} bps", n.speed))
                        .await?;
                    self.send_info(serial, &format!("Protocol: {}", n.connection_type))
                        .await?;
                } else {
                    self.send_info(serial, "No active connection").await?;
                }
                let echo = if self.echo { "E1" } else { "E0" };
                let verbose = if self.verbose { "V1" } else { "V0" };
                let compression = if self.compression_req { "%C1" } else { "%C0" };
                let correction = if self.error_correction_req { "\\N3" } else { "\\N0" };
                self.send_info(
                    serial,
                    &format!("Settings: {echo} {verbose} {compression} {correction}"),
                )
                .await?;
            }
            _ => {}
        }
        self.send_ok(serial).await
    }

    async fn send_result(
        &self,
        serial: &mut Endpoint,
        word: &str,
        code: &str,
    ) -> Result<(), EndpointError> {
        let response = if self.verbose {
            format!("\r\n{word}\r\n")
        } else {
            format!("{code}\r")
        };
        serial.write(response.as_bytes()).await?;
        Ok(())
    }

    async fn send_ok(&self, serial: &mut Endpoint) -> Result<(), EndpointError> {
        self.send_result(serial, "OK", "0").await
    }

    async fn send_error(&self, serial: &mut Endpoint) -> Result<(), EndpointError> {
        self.send_result(serial, "ERROR", "4").await
    }

    async fn send_no_carrier(&self, serial: &mut Endpoint) -> Result<(), EndpointError> {
        self.send_result(serial, "NO CARRIER", "3").await
    }

    /// Informational line, always verbose-formatted.
    async fn send_info(&self, serial: &mut Endpoint, text: &str) -> Result<(), EndpointError> {
        serial.write(format!("\r\n{text}\r\n").as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_modem(verbose: bool) -> HayesModem {
        let config: Config = toml::from_str("").unwrap();
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        let mut modem = HayesModem::new(Arc::new(config), rx);
        modem.verbose = verbose;
        modem
    }

    #[test]
    fn register_defaults_match_the_classic_map() {
        let modem = test_modem(true);
        assert_eq!(modem.registers[0], 0);
        assert_eq!(modem.registers[2], 43);
        assert_eq!(modem.registers[3], 13);
        assert_eq!(modem.registers[4], 10);
        assert_eq!(modem.registers[5], 8);
        assert_eq!(modem.registers[6], 2);
        assert_eq!(modem.registers[7], 50);
        assert_eq!(modem.registers[12], 50);
    }

    #[test]
    fn connect_line_suffixes_follow_speed() {
        let mut modem = test_modem(true);
        for (speed, expected) in [
            (1200, "\r\nCONNECT 1200\r\n"),
            (9600, "\r\nCONNECT 9600/ARQ\r\n"),
            (14400, "\r\nCONNECT 14400/ARQ/V42BIS\r\n"),
            (28800, "\r\nCONNECT 28800/ARQ/V42BIS\r\n"),
            (33600, "\r\nCONNECT 33600/ARQ/V42BIS\r\n"),
            (56000, "\r\nCONNECT 56000/ARQ/V90\r\n"),
            (64000, "\r\nCONNECT 64000/ARQ\r\n"),
        ] {
            modem.negotiated = Some(Negotiated {
                speed,
                connection_type: "V.34+".to_string(),
            });
            assert_eq!(modem.connect_response(), expected.as_bytes(), "{speed}");
        }
    }

    #[test]
    fn connect_line_isdn_variants() {
        let mut modem = test_modem(true);
        modem.negotiated = Some(Negotiated {
            speed: 128_000,
            connection_type: "ISDN-128".to_string(),
        });
        assert_eq!(modem.connect_response(), b"\r\nCONNECT ISDN 128000/2B+D\r\n");
    }

    #[test]
    fn connect_line_without_negotiation_uses_fallback() {
        let modem = test_modem(true);
        assert_eq!(modem.connect_response(), b"\r\nCONNECT 33600/ARQ/V42BIS\r\n");
    }

    #[test]
    fn non_verbose_connect_is_code_one() {
        let modem = test_modem(false);
        assert_eq!(modem.connect_response(), b"1\r");
    }

    #[test]
    fn codec_arms_only_with_both_opt_ins() {
        let mut modem = test_modem(true);
        assert!(modem.armed_codec().is_none());
        modem.compression_req = true;
        assert!(modem.armed_codec().is_none());
        let mut config: Config = toml::from_str("").unwrap();
        config.bridge.enable_compression = true;
        modem.config = Arc::new(config);
        assert!(modem.armed_codec().is_some());
        modem.compression_req = false;
        assert!(modem.armed_codec().is_none());
    }
}
