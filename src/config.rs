//! # Configuration Management
//!
//! Centralized configuration for the connection stack.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables (`MACHONET_*`) via `from_env()`
//! - Direct instantiation with defaults
//!
//! The `[protocol]` section holds the version constants a client must present
//! during the handshake. A client built for a different server release is
//! rejected on the first frame.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max allowed frame payload size (e.g. 16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Whether outgoing payloads are compressed by default
pub const ENABLE_COMPRESSION: bool = true;

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Handshake constants
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Framing and compression configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("MACHONET_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(max) = std::env::var("MACHONET_MAX_CONNECTIONS") {
            if let Ok(val) = max.parse::<usize>() {
                config.server.max_connections = val;
            }
        }

        if let Ok(timeout) = std::env::var("MACHONET_SHUTDOWN_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.server.shutdown_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(version) = std::env::var("MACHONET_PROJECT_VERSION") {
            config.protocol.project_version = version;
        }

        if let Ok(count) = std::env::var("MACHONET_CLUSTER_USER_COUNT") {
            if let Ok(val) = count.parse::<i64>() {
                config.protocol.cluster_user_count = val;
            }
        }

        if let Ok(enabled) = std::env::var("MACHONET_COMPRESSION") {
            if let Ok(val) = enabled.parse::<bool>() {
                config.transport.compression_enabled = val;
            }
        }

        if let Ok(json) = std::env::var("MACHONET_LOG_JSON") {
            if let Ok(val) = json.parse::<bool>() {
                config.logging.json_format = val;
            }
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
        errors.extend(self.protocol.validate());
        errors.extend(self.transport.validate());
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

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:26000")
    pub address: String,

    /// Maximum number of concurrent client connections
    pub max_connections: usize,

    /// Time to wait for open connections during graceful shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:26000"),
            max_connections: 1000,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:26000')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Version constants and cluster identity presented during the handshake
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtocolConfig {
    /// Build date stamp the client was compiled against
    pub birthday: i64,

    /// Wire protocol revision
    pub macho_version: i64,

    /// Client release number
    pub version_number: f64,

    /// Client build number
    pub build_version: i64,

    /// Project identifier, e.g. "EVE-EVE-TRANQUILITY@ccp"
    pub project_version: String,

    /// Boot codename reported in the server handshake
    pub codename: String,

    /// Boot region reported in the server handshake
    pub region: String,

    /// Login queue position; there is no real queue
    pub queue_position: i64,

    /// User count reported to clients
    pub cluster_user_count: i64,

    /// Node id of this proxy
    pub proxy_node_id: i64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            birthday: 170_472,
            macho_version: 219,
            version_number: 7.31,
            build_version: 360_229,
            project_version: String::from("EVE-EVE-TRANQUILITY@ccp"),
            codename: String::from("EVE-EVE-TRANQUILITY"),
            region: String::from("ccp"),
            queue_position: 1,
            cluster_user_count: 100,
            proxy_node_id: 0xFFAA,
        }
    }
}

impl ProtocolConfig {
    /// Validate protocol configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.project_version.is_empty() {
            errors.push("Project version cannot be empty".to_string());
        }

        if !self.version_number.is_finite() || self.version_number <= 0.0 {
            errors.push(format!(
                "Invalid version number: {} (must be a positive number)",
                self.version_number
            ));
        }

        if self.macho_version <= 0 {
            errors.push("Macho version must be greater than 0".to_string());
        }

        if self.queue_position < 0 {
            errors.push("Queue position cannot be negative".to_string());
        }

        if self.cluster_user_count < 0 {
            errors.push("Cluster user count cannot be negative".to_string());
        }

        errors
    }
}

/// Framing and compression configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum allowed frame payload size in bytes
    pub max_payload_size: usize,

    /// Whether to compress outgoing payloads
    pub compression_enabled: bool,

    /// zlib compression level (0-9)
    pub compression_level: u32,

    /// Minimum payload size (bytes) before compression is applied
    #[serde(default)]
    pub compression_threshold_bytes: usize,

    /// Capacity of the per-connection outgoing buffer
    pub send_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
            compression_enabled: ENABLE_COMPRESSION,
            compression_level: 6,
            compression_threshold_bytes: 512,
            send_buffer_size: 256 * 1024,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_payload_size
            ));
        }

        if self.compression_enabled {
            if self.compression_level > 9 {
                errors.push(format!(
                    "Invalid compression level: {} (valid range: 0-9)",
                    self.compression_level
                ));
            }

            if self.compression_threshold_bytes > self.max_payload_size {
                errors.push(
                    "Compression threshold cannot be larger than max payload size".to_string(),
                );
            }
        }

        if self.send_buffer_size < 4096 {
            errors.push("Send buffer size too small (minimum: 4 KB)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level used when `RUST_LOG` is unset
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,

    /// Whether to include span events (new/close) in the output
    #[serde(default)]
    pub log_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("machonet"),
            log_level: Level::INFO,
            json_format: false,
            log_spans: false,
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
