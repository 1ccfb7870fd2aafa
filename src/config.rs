//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `VNBRIDGE_USERNAME`, `VNBRIDGE_PASSWORD`,
//!    `VNBRIDGE_DEVICE`, `VNBRIDGE_SERVER` (`host:port`)
//! 2. **Config file** — path via `--config <path>`, or `vnbridge.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! host = "vespernet.example.net"
//! port = 6060
//! username = "guest"
//! password = "guest"
//!
//! [serial]
//! device = "/dev/ttyUSB0"   # or COM3, unix:/tmp/vmodem.sock, tcp:host:port
//! baud_rate = 38400
//!
//! [modem]
//! emulate = true
//! connect_speed = 33600
//! chatter = true            # cosmetic Dialing/Ringing lines before CONNECT
//!
//! [bridge]
//! buffer_size = 8192
//! read_timeout_ms = 100
//! write_timeout_secs = 5
//! inactivity_timeout_secs = 300
//! connection_retries = 3
//! enable_compression = false
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub modem: ModemConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// VesperNet server address and credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Access concentrator hostname or address.
    #[serde(default)]
    pub host: String,
    /// Access concentrator port (default 6060).
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Account name, sent as the first line of the session.
    #[serde(default)]
    pub username: String,
    /// Account password. Override with `VNBRIDGE_PASSWORD`.
    #[serde(default)]
    pub password: String,
}

/// Serial endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Device string: `COM<n>`, `/dev/<name>`, `unix:<path>` or `tcp:<host>:<port>`.
    #[serde(default)]
    pub device: String,
    /// Baud rate for physical ports (default 38400). Ignored for socket devices.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// Hayes emulation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ModemConfig {
    /// Emulate a Hayes modem on the serial side (default true). When false
    /// the bridge runs in direct mode: authenticate, negotiate, then raw PPP.
    #[serde(default = "default_emulate")]
    pub emulate: bool,
    /// Fallback CONNECT speed when the server does not negotiate (default 33600).
    #[serde(default = "default_connect_speed")]
    pub connect_speed: u32,
    /// Emit cosmetic Dialing/Ringing/Carrier lines before CONNECT (default true).
    #[serde(default = "default_chatter")]
    pub chatter: bool,
}

/// Bridge engine tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Per-read buffer size in bytes (default 8192).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Read deadline per operation in milliseconds (default 100).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Write deadline per operation in seconds (default 5).
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// Hang up after this many seconds with no traffic in either direction
    /// (default 300).
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    /// Direct-mode dial attempts before giving up (default 3).
    #[serde(default = "default_connection_retries")]
    pub connection_retries: u32,
    /// Allow the data-stream codec when the client also requests it via
    /// `AT%C` (default false).
    #[serde(default)]
    pub enable_compression: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Force debug-level logging with per-chunk hex dumps (default false).
    #[serde(default)]
    pub debug: bool,
}

fn default_server_port() -> u16 {
    6060
}
fn default_baud_rate() -> u32 {
    38400
}
fn default_emulate() -> bool {
    true
}
fn default_connect_speed() -> u32 {
    33600
}
fn default_chatter() -> bool {
    true
}
fn default_buffer_size() -> usize {
    8192
}
fn default_read_timeout_ms() -> u64 {
    100
}
fn default_write_timeout_secs() -> u64 {
    5
}
fn default_inactivity_timeout_secs() -> u64 {
    300
}
fn default_connection_retries() -> u32 {
    3
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_server_port(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            baud_rate: default_baud_rate(),
        }
    }
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            emulate: default_emulate(),
            connect_speed: default_connect_speed(),
            chatter: default_chatter(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_secs: default_write_timeout_secs(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            connection_retries: default_connection_retries(),
            enable_compression: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            debug: false,
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file and fails loudly on error.
    /// Otherwise looks for `vnbridge.toml` in the current directory, falling
    /// back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("vnbridge.toml").exists() {
            let content =
                std::fs::read_to_string("vnbridge.toml").expect("Failed to read vnbridge.toml");
            toml::from_str(&content).expect("Failed to parse vnbridge.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                serial: SerialConfig::default(),
                modem: ModemConfig::default(),
                bridge: BridgeConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(user) = std::env::var("VNBRIDGE_USERNAME") {
            config.server.username = user;
        }
        if let Ok(pass) = std::env::var("VNBRIDGE_PASSWORD") {
            config.server.password = pass;
        }
        if let Ok(device) = std::env::var("VNBRIDGE_DEVICE") {
            config.serial.device = device;
        }
        if let Ok(server) = std::env::var("VNBRIDGE_SERVER") {
            if let Some((host, port)) = server.rsplit_once(':') {
                if let Ok(p) = port.parse() {
                    config.server.host = host.to_string();
                    config.server.port = p;
                }
            } else {
                config.server.host = server;
            }
        }

        config
    }

    /// Validate the configuration, returning one message per problem.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.server.host.is_empty() {
            errors.push("server.host must be set".to_string());
        }
        if self.server.username.is_empty() {
            errors.push("server.username must be set".to_string());
        }
        if self.serial.device.is_empty() {
            errors.push("serial.device must be set".to_string());
        }
        if self.bridge.buffer_size == 0 {
            errors.push("bridge.buffer_size must be positive".to_string());
        }
        if self.bridge.read_timeout_ms == 0 {
            errors.push("bridge.read_timeout_ms must be positive".to_string());
        }
        if self.bridge.write_timeout_secs == 0 {
            errors.push("bridge.write_timeout_secs must be positive".to_string());
        }
        errors
    }

    /// Per-operation read deadline.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge.read_timeout_ms)
    }

    /// Per-operation write deadline.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge.write_timeout_secs)
    }

    /// Inactivity watchdog threshold.
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge.inactivity_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_classic_modem_settings() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.serial.baud_rate, 38400);
        assert_eq!(config.modem.connect_speed, 33600);
        assert!(config.modem.emulate);
        assert_eq!(config.bridge.inactivity_timeout_secs, 300);
        assert_eq!(config.server.port, 6060);
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            host = "198.51.100.7"
            username = "u"
            password = "p"

            [serial]
            device = "unix:/tmp/vmodem.sock"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.host, "198.51.100.7");
        assert_eq!(config.server.port, 6060);
        assert_eq!(config.bridge.buffer_size, 8192);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn validate_reports_missing_fields() {
        let config: Config = toml::from_str("").unwrap();
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("server.host")));
        assert!(errors.iter().any(|e| e.contains("serial.device")));
    }
}
