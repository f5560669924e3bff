//! Host configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via PROTOCHANNEL_CONFIG)
//! 3. Environment variables

use protochannel_core::{
    DiskStreamManager, MemoryStreamManager, StreamLimits, StreamManager, DEFAULT_MAX_BUFFERED,
    DEFAULT_MAX_STREAMS, DEFAULT_MAX_STREAM_SIZE,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Host configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    /// Protocol numbers accepted during the handshake.
    pub protocol: ProtocolConfig,
    pub tls: TlsConfig,
    /// Limits and storage for incoming streams.
    pub streams: StreamConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("PROTOCHANNEL_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.protocol.apply_env_overrides();
        self.tls.apply_env_overrides();
        self.streams.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.protocol.validate()?;
        self.tls.validate()?;
        if self.network.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Connections beyond this are closed right after accept.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], protochannel_protocol::DEFAULT_PORT)),
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_parse("PROTOCHANNEL_BIND") {
            self.bind_addr = addr;
        }
        if let Some(max) = env_parse("PROTOCHANNEL_MAX_CONNECTIONS") {
            self.max_connections = max;
        }
    }
}

/// Range of protocol numbers the host accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub min: u32,
    pub max: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self { min: 1, max: 1 }
    }
}

impl ProtocolConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(min) = env_parse("PROTOCHANNEL_PROTOCOL_MIN") {
            self.min = min;
        }
        if let Some(max) = env_parse("PROTOCHANNEL_PROTOCOL_MAX") {
            self.max = max;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min > self.max {
            return Err(ConfigError::Validation(format!(
                "protocol min {} is greater than max {}",
                self.min, self.max
            )));
        }
        Ok(())
    }

    pub fn contains(&self, protocol: u32) -> bool {
        protocol >= self.min && protocol <= self.max
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Path to PEM-encoded server certificate file.
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key file.
    pub key_path: Option<PathBuf>,
    /// Require client certificate authentication (mTLS).
    pub require_client_cert: bool,
    /// Path to PEM-encoded CA certificate(s) for verifying client certs.
    /// Required if require_client_cert is true.
    pub client_ca_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("PROTOCHANNEL_TLS_ENABLED") {
            self.enabled = enabled;
        }
        if let Ok(path) = std::env::var("PROTOCHANNEL_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("PROTOCHANNEL_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Some(require) = env_flag("PROTOCHANNEL_TLS_REQUIRE_CLIENT_CERT") {
            self.require_client_cert = require;
        }
        if let Ok(path) = std::env::var("PROTOCHANNEL_TLS_CLIENT_CA") {
            self.client_ca_path = Some(PathBuf::from(path));
        }
    }

    /// Validates TLS configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.cert_path.is_none() {
            return Err(ConfigError::Validation(
                "TLS enabled but cert_path not set".to_string(),
            ));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::Validation(
                "TLS enabled but key_path not set".to_string(),
            ));
        }
        if self.require_client_cert && self.client_ca_path.is_none() {
            return Err(ConfigError::Validation(
                "mTLS enabled but client_ca_path not set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Incoming stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Spool streams to temporary files here instead of keeping them in memory.
    pub spool_dir: Option<PathBuf>,
    /// Streams declaring more bytes than this are rejected.
    pub max_stream_size: u64,
    /// Streams one connection may hold before handlers take them.
    pub max_streams_per_connection: usize,
    /// Declared bytes one connection may hold across those streams.
    pub max_buffered_per_connection: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            spool_dir: None,
            max_stream_size: DEFAULT_MAX_STREAM_SIZE,
            max_streams_per_connection: DEFAULT_MAX_STREAMS,
            max_buffered_per_connection: DEFAULT_MAX_BUFFERED,
        }
    }
}

impl StreamConfig {
    /// Builds the sink provider for incoming streams.
    pub fn manager(&self) -> Arc<dyn StreamManager> {
        match &self.spool_dir {
            Some(dir) => Arc::new(DiskStreamManager::new(dir.clone(), self.max_stream_size)),
            None => Arc::new(MemoryStreamManager::new(self.max_stream_size)),
        }
    }

    pub fn limits(&self) -> StreamLimits {
        StreamLimits {
            max_streams: self.max_streams_per_connection,
            max_buffered: self.max_buffered_per_connection,
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("PROTOCHANNEL_STREAM_DIR") {
            self.spool_dir = Some(PathBuf::from(dir));
        }
        if let Some(max) = env_parse("PROTOCHANNEL_MAX_STREAM_SIZE") {
            self.max_stream_size = max;
        }
        if let Some(max) = env_parse("PROTOCHANNEL_MAX_STREAMS_PER_CONNECTION") {
            self.max_streams_per_connection = max;
        }
        if let Some(max) = env_parse("PROTOCHANNEL_MAX_BUFFERED_PER_CONNECTION") {
            self.max_buffered_per_connection = max;
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("PROTOCHANNEL_METRICS_ENABLED") {
            self.enabled = enabled;
        }
        if let Some(addr) = env_parse("PROTOCHANNEL_METRICS_BIND") {
            self.bind_addr = addr;
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Serde helpers for SocketAddr (kept as a string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
