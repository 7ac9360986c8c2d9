//! # Configuration Management
//!
//! Centralized configuration for an opwire server.
//!
//! ## Sections
//! - `server`: listen address, transport, admission capacity, deadlines, certificate pair
//! - `quic`: multiplexed-transport tuning (ignored by TCP and UDP)
//! - `logging`: subscriber setup consumed by [`crate::utils::logging::init_logging`]
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables prefixed `OPWIRE_` via `from_env()`
//! - Direct instantiation with defaults
//!
//! Durations are written as milliseconds.
//!
//! ## Security Considerations
//! - A certificate/key pair enables TLS on TCP and DTLS on UDP; QUIC requires one
//! - The read deadline bounds how long an idle peer can hold a session open

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Default admission capacity of the concurrency governor
pub const DEFAULT_WORKER_CAPACITY: usize = 100_000;

/// Default QUIC concurrent stream limit (per direction)
pub const DEFAULT_MAX_STREAMS: u32 = 1000;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub quic: QuicConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from `OPWIRE_*` environment variables on top of defaults
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = var("OPWIRE_ADDRESS") {
            config.server.address = addr;
        }
        if let Some(kind) = var("OPWIRE_TRANSPORT") {
            config.server.transport = kind.parse()?;
        }
        if let Some(capacity) = var("OPWIRE_WORKER_CAPACITY") {
            config.server.worker_capacity = parse_var("OPWIRE_WORKER_CAPACITY", &capacity)?;
        }
        if let Some(ms) = var("OPWIRE_READ_TIMEOUT_MS") {
            config.server.read_timeout =
                Duration::from_millis(parse_var("OPWIRE_READ_TIMEOUT_MS", &ms)?);
        }
        if let Some(ms) = var("OPWIRE_SHUTDOWN_GRACE_MS") {
            config.server.shutdown_grace =
                Duration::from_millis(parse_var("OPWIRE_SHUTDOWN_GRACE_MS", &ms)?);
        }
        if let Some(path) = var("OPWIRE_CERT_FILE") {
            config.server.cert_file = Some(PathBuf::from(path));
        }
        if let Some(path) = var("OPWIRE_KEY_FILE") {
            config.server.key_file = Some(PathBuf::from(path));
        }
        if let Some(debug) = var("OPWIRE_DEBUG") {
            config.server.debug = parse_var("OPWIRE_DEBUG", &debug)?;
        }
        if let Some(level) = var("OPWIRE_LOG_LEVEL") {
            config.logging.log_level = Level::from_str(&level).map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid OPWIRE_LOG_LEVEL: {level}"))
            })?;
        }

        Ok(config)
    }

    /// Logging section with `server.debug` applied
    pub fn effective_logging(&self) -> LoggingConfig {
        let mut logging = self.logging.clone();
        if self.server.debug && logging.log_level < Level::DEBUG {
            logging.log_level = Level::DEBUG;
        }
        logging
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
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        if self.server.transport == TransportKind::Quic {
            errors.extend(self.quic.validate());
            if !self.server.has_certificate() {
                errors.push("QUIC transport requires cert_file and key_file".to_string());
            }
        }
        errors.extend(self.logging.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ProtocolError::ConfigError(format!("Invalid {name}: {value}")))
}

/// Which socket model the server listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Udp,
    Quic,
}

impl FromStr for TransportKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "quic" => Ok(Self::Quic),
            other => Err(ProtocolError::ConfigError(format!(
                "Unknown transport '{other}' (expected tcp, udp or quic)"
            ))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Quic => "quic",
        })
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    pub transport: TransportKind,

    /// Maximum number of handler chains running at once
    pub worker_capacity: usize,

    /// Idle deadline for a single frame read
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,

    /// How long shutdown waits for in-flight handlers
    #[serde(with = "duration_serde")]
    pub shutdown_grace: Duration,

    /// PEM certificate chain; enables TLS / DTLS together with `key_file`
    pub cert_file: Option<PathBuf>,

    /// PEM private key
    pub key_file: Option<PathBuf>,

    /// Raise the log level to debug
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            transport: TransportKind::Tcp,
            worker_capacity: DEFAULT_WORKER_CAPACITY,
            read_timeout: timeout::READ_TIMEOUT,
            shutdown_grace: timeout::SHUTDOWN_GRACE,
            cert_file: None,
            key_file: None,
            debug: false,
        }
    }
}

impl ServerConfig {
    pub fn has_certificate(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }

    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:9000')",
                self.address
            ));
        }

        if self.worker_capacity == 0 {
            errors.push("Worker capacity must be greater than 0".to_string());
        } else if self.worker_capacity > 1_000_000 {
            errors.push(format!(
                "Worker capacity too large: {} (max: 1,000,000)",
                self.worker_capacity
            ));
        }

        if self.read_timeout.as_millis() < 100 {
            errors.push("Read timeout too short (minimum: 100ms)".to_string());
        }

        if self.shutdown_grace.as_secs() > 60 {
            errors.push("Shutdown grace period too long (maximum: 60s)".to_string());
        }

        if self.cert_file.is_some() != self.key_file.is_some() {
            errors.push("cert_file and key_file must be set together".to_string());
        }

        errors
    }
}

/// QUIC transport tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuicConfig {
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    #[serde(with = "duration_serde")]
    pub keep_alive: Duration,

    /// Also bounds TLS handshakes on TCP and DTLS handshakes on UDP
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Concurrent bidirectional and unidirectional streams per connection
    pub max_streams: u32,

    /// Accept 0-RTT early data
    pub allow_0rtt: bool,

    /// Accept unreliable datagrams alongside streams
    pub enable_datagrams: bool,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            idle_timeout: timeout::QUIC_IDLE_TIMEOUT,
            keep_alive: timeout::QUIC_KEEP_ALIVE,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            max_streams: DEFAULT_MAX_STREAMS,
            allow_0rtt: false,
            enable_datagrams: true,
        }
    }
}

impl QuicConfig {
    /// Validate QUIC configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.keep_alive >= self.idle_timeout {
            errors.push(format!(
                "QUIC keep-alive ({}ms) must be shorter than the idle timeout ({}ms)",
                self.keep_alive.as_millis(),
                self.idle_timeout.as_millis()
            ));
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("QUIC handshake timeout too short (minimum: 100ms)".to_string());
        }

        if self.max_streams == 0 {
            errors.push("QUIC max_streams must be greater than 0".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("opwire"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
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

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
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
