//! # Configuration Management
//!
//! Centralized configuration for the relay client engine.
//!
//! This module provides structured configuration for the command connection, the
//! rate-limited dispatcher, the datagram channel, room housekeeping and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`RELAY_CLIENT_*`)
//!
//! A [`ClientConfig`] is cloned into each connection attempt and never mutated by the
//! engine afterwards.

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default TCP port of the relay command channel
pub const DEFAULT_COMMAND_PORT: u16 = 7777;

/// Default UDP port of the relay datagram channel
pub const DEFAULT_DATAGRAM_PORT: u16 = 7778;

/// Secret mixed with the session id to derive the datagram key.
/// Must match the relay's value.
pub const DEFAULT_SHARED_SECRET: &str = "RacingRelayUdpSecret2024";

/// Largest datagram the client will send or accept
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Longest command-channel line accepted before the line is discarded
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct NetworkConfig {
    /// Command connection settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Outbound rate limiting
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Datagram channel settings
    #[serde(default)]
    pub datagram: DatagramConfig,

    /// Room housekeeping
    #[serde(default)]
    pub room: RoomConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("RELAY_CLIENT_HOST") {
            config.client.host = host;
        }

        if let Ok(name) = std::env::var("RELAY_CLIENT_SERVER_NAME") {
            config.client.server_name = name;
        }

        if let Ok(port) = std::env::var("RELAY_CLIENT_COMMAND_PORT") {
            config.client.command_port = port
                .parse()
                .map_err(|_| ProtocolError::Config(format!("Invalid command port: {port}")))?;
        }

        if let Ok(port) = std::env::var("RELAY_CLIENT_DATAGRAM_PORT") {
            config.client.datagram_port = port
                .parse()
                .map_err(|_| ProtocolError::Config(format!("Invalid datagram port: {port}")))?;
        }

        if let Ok(thumbprint) = std::env::var("RELAY_CLIENT_PINNED_THUMBPRINT") {
            config.client.trust_mode = TrustMode::PinnedThumbprint(thumbprint);
        }

        if let Ok(attempts) = std::env::var("RELAY_CLIENT_MAX_RETRY_ATTEMPTS") {
            if let Ok(val) = attempts.parse::<u32>() {
                config.client.max_retry_attempts = val;
            }
        }

        if let Ok(timeout) = std::env::var("RELAY_CLIENT_READ_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.read_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(secret) = std::env::var("RELAY_CLIENT_SHARED_SECRET") {
            config.datagram.shared_secret = secret;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::Config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.client.validate());
        errors.extend(self.dispatch.validate());
        errors.extend(self.datagram.validate());
        errors.extend(self.room.validate());
        errors.extend(self.logging.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// How the server certificate is validated during the TLS handshake
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrustMode {
    /// Accept any certificate (development relays with self-signed certs)
    #[default]
    AcceptSelfSigned,
    /// Accept only the certificate whose SHA-256 thumbprint matches (hex)
    PinnedThumbprint(String),
    /// Validate against the platform root store
    SystemTrust,
}

impl TrustMode {
    /// Decode the pinned thumbprint, accepting `:` separators and either case.
    pub fn pinned_hash(&self) -> Option<Result<Vec<u8>>> {
        match self {
            TrustMode::PinnedThumbprint(hex_str) => {
                let cleaned: String = hex_str.chars().filter(|c| *c != ':').collect();
                Some(hex::decode(cleaned).map_err(|e| {
                    ProtocolError::Config(format!("Invalid pinned thumbprint: {e}"))
                }))
            }
            _ => None,
        }
    }
}

/// Command connection configuration. Immutable per connection attempt.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ClientConfig {
    /// Relay host name or IP address
    pub host: String,

    /// Name presented for SNI and certificate validation
    pub server_name: String,

    /// TLS command channel port
    pub command_port: u16,

    /// UDP datagram channel port
    pub datagram_port: u16,

    /// Certificate trust policy
    #[serde(default)]
    pub trust_mode: TrustMode,

    /// Bound on TCP connect + TLS handshake + welcome line
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Per-call line read timeout
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,

    /// Per-call line write timeout
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,

    /// Connect attempts before `ConnectionFailed` is surfaced
    pub max_retry_attempts: u32,

    /// Backoff base: attempt `n` waits `2^n * base`
    #[serde(with = "duration_serde")]
    pub retry_base_delay: Duration,

    /// Upper bound on a single backoff delay
    #[serde(with = "duration_serde")]
    pub retry_max_delay: Duration,

    /// Reconnect automatically when an established connection drops
    pub auto_reconnect: bool,

    /// Idle time before a keepalive PING is queued
    #[serde(with = "duration_serde")]
    pub keepalive_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            server_name: String::from("localhost"),
            command_port: DEFAULT_COMMAND_PORT,
            datagram_port: DEFAULT_DATAGRAM_PORT,
            trust_mode: TrustMode::default(),
            connect_timeout: timeout::CONNECT_TIMEOUT,
            read_timeout: timeout::DEFAULT_TIMEOUT,
            write_timeout: timeout::DEFAULT_TIMEOUT,
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(8),
            auto_reconnect: true,
            keepalive_interval: timeout::KEEPALIVE_INTERVAL,
        }
    }
}

impl ClientConfig {
    /// `host:port` of the command channel
    pub fn command_addr(&self) -> String {
        format!("{}:{}", self.host, self.command_port)
    }

    /// `host:port` of the datagram channel
    pub fn datagram_addr(&self) -> String {
        format!("{}:{}", self.host, self.datagram_port)
    }

    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.host.is_empty() {
            errors.push("Host cannot be empty".to_string());
        }

        if self.server_name.is_empty() {
            errors.push("Server name cannot be empty".to_string());
        }

        if self.command_port == 0 {
            errors.push("Command port must be non-zero".to_string());
        }

        if self.datagram_port == 0 {
            errors.push("Datagram port must be non-zero".to_string());
        }

        if let Some(Err(e)) = self.trust_mode.pinned_hash() {
            errors.push(e.to_string());
        } else if let Some(Ok(hash)) = self.trust_mode.pinned_hash() {
            if hash.len() != 32 {
                errors.push(format!(
                    "Pinned thumbprint has {} bytes (expected 32 for SHA-256)",
                    hash.len()
                ));
            }
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 120 {
            errors.push("Connect timeout too long (maximum: 120s)".to_string());
        }

        if self.read_timeout.as_millis() < 100 {
            errors.push("Read timeout too short (minimum: 100ms)".to_string());
        }

        if self.write_timeout.as_millis() < 100 {
            errors.push("Write timeout too short (minimum: 100ms)".to_string());
        }

        if self.max_retry_attempts == 0 {
            errors.push("Max retry attempts must be greater than 0".to_string());
        } else if self.max_retry_attempts > 16 {
            errors.push(format!(
                "Max retry attempts too large: {} (maximum: 16)",
                self.max_retry_attempts
            ));
        }

        if self.retry_base_delay.as_millis() < 10 {
            errors.push("Retry base delay too short (minimum: 10ms)".to_string());
        }

        if self.retry_max_delay < self.retry_base_delay {
            errors.push("Retry max delay cannot be smaller than the base delay".to_string());
        }

        if self.keepalive_interval.as_millis() < 100 {
            errors.push("Keepalive interval too short (minimum: 100ms)".to_string());
        } else if self.keepalive_interval >= self.read_timeout {
            errors.push(
                "Keepalive interval must be shorter than the read timeout".to_string(),
            );
        }

        errors
    }
}

/// Outbound rate limiting
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DispatchConfig {
    /// Minimum gap between two command-channel writes
    #[serde(with = "duration_serde")]
    pub command_interval: Duration,

    /// Minimum gap between two datagram writes
    #[serde(with = "duration_serde")]
    pub datagram_interval: Duration,

    /// Drain timer period
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,

    /// Commands queued beyond this are rejected
    pub max_command_queue: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command_interval: Duration::from_millis(100),
            datagram_interval: Duration::from_millis(50),
            tick_interval: Duration::from_millis(10),
            max_command_queue: 256,
        }
    }
}

impl DispatchConfig {
    /// Validate dispatcher configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.tick_interval.is_zero() {
            errors.push("Tick interval must be greater than 0".to_string());
        } else if self.tick_interval > self.datagram_interval
            || self.tick_interval > self.command_interval
        {
            errors.push(
                "Tick interval must not exceed the command or datagram interval".to_string(),
            );
        }

        if self.max_command_queue == 0 {
            errors.push("Command queue limit must be greater than 0".to_string());
        }

        errors
    }
}

/// Datagram channel configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DatagramConfig {
    /// Secret mixed into the per-session key
    pub shared_secret: String,

    /// Largest packet sent or accepted, in bytes
    pub max_packet_size: usize,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            shared_secret: DEFAULT_SHARED_SECRET.to_string(),
            max_packet_size: MAX_DATAGRAM_SIZE,
        }
    }
}

impl DatagramConfig {
    /// Validate datagram configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.shared_secret.is_empty() {
            errors.push("Shared secret cannot be empty".to_string());
        }

        if self.max_packet_size < 64 {
            errors.push("Max packet size too small (minimum: 64 bytes)".to_string());
        } else if self.max_packet_size > 65_507 {
            errors.push(format!(
                "Max packet size too large: {} (UDP maximum is 65507)",
                self.max_packet_size
            ));
        }

        errors
    }
}

/// Room housekeeping configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RoomConfig {
    /// How often the roster is re-requested while in a room
    #[serde(with = "duration_serde")]
    pub roster_refresh_interval: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            roster_refresh_interval: Duration::from_secs(3),
        }
    }
}

impl RoomConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.roster_refresh_interval.as_millis() < 250 {
            errors.push("Roster refresh interval too short (minimum: 250ms)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("relay-client"),
            log_level: Level::INFO,
            log_to_console: true,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
