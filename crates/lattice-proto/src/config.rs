//! Configuration system for Lattice
//!
//! Supports TOML configuration files with sensible defaults. Every
//! option maps to one observable transport or host behavior; there are
//! no implicit globals. TLS is configured here but terminated by an
//! external layer plugged in at the transport seam.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::chunk::{DEFAULT_CHUNK_POOL_SIZE, DEFAULT_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Default host endpoint.
pub const DEFAULT_PORT: u16 = 4488;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host/listener settings
    pub host: HostConfig,
    /// Client/connect settings
    pub client: ClientConfig,
}

impl Config {
    /// Load from a TOML file, falling back to defaults when absent.
    pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Config::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_owned(), e.to_string()))?;
        Config::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.host.transport.validate()?;
        self.client.transport.validate()?;
        if self.host.endpoints.is_empty() {
            return Err(ConfigError::Invalid("host.endpoints must not be empty"));
        }
        Ok(())
    }
}

/// Chunk-transport tuning shared by both endpoint roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Size of one chunk in bytes (header included)
    pub chunk_size: usize,
    /// Number of chunks in the pool
    pub chunk_pool_size: usize,
    /// Outbound chunks queued per connection before senders block
    pub max_queued_chunk_count: usize,
    /// Silence before a keep-alive probe is sent (seconds)
    pub inactivity_interval_secs: u64,
    /// Silence before the connection is closed (seconds)
    pub inactivity_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_pool_size: DEFAULT_CHUNK_POOL_SIZE,
            max_queued_chunk_count: 64,
            inactivity_interval_secs: 10,
            inactivity_timeout_secs: 30,
        }
    }
}

impl TransportConfig {
    pub fn inactivity_interval(&self) -> Duration {
        Duration::from_secs(self.inactivity_interval_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(ConfigError::Invalid("chunk_size is below the framing minimum"));
        }
        if self.max_queued_chunk_count == 0 {
            return Err(ConfigError::Invalid("max_queued_chunk_count must be > 0"));
        }
        if self.chunk_pool_size == 0 {
            return Err(ConfigError::Invalid("chunk_pool_size must be > 0"));
        }
        if self.inactivity_timeout_secs <= self.inactivity_interval_secs {
            return Err(ConfigError::Invalid(
                "inactivity_timeout_secs must exceed inactivity_interval_secs",
            ));
        }
        Ok(())
    }
}

/// Host/listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Addresses to listen on
    pub endpoints: Vec<SocketAddr>,
    /// Listener accept queue depth
    pub backlog_size: u32,
    /// Connections beyond this are closed right after accept
    pub max_open_conn_count: usize,
    /// TLS termination mode
    pub tls: TlsMode,
    pub transport: TransportConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))],
            backlog_size: 128,
            max_open_conn_count: 64,
            tls: TlsMode::Off,
            transport: TransportConfig::default(),
        }
    }
}

/// Client/connect configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host endpoint to connect to
    pub endpoint: SocketAddr,
    /// TLS mode expected from the host
    pub tls: TlsMode,
    /// Accept the host descriptor on a version-stamp match alone,
    /// skipping the structural comparison
    pub accept_by_version: bool,
    /// Connect handshake timeout (seconds)
    pub connect_timeout_secs: u64,
    pub transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            tls: TlsMode::Off,
            accept_by_version: true,
            connect_timeout_secs: 10,
            transport: TransportConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// TLS termination mode. The TLS layer itself plugs in at the transport
/// seam; this setting describes the handshake contract expected of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum TlsMode {
    /// Plain TCP
    #[default]
    Off,
    /// Mutual TLS: both peers present certificates
    Mutual {
        cert_path: PathBuf,
        key_path: PathBuf,
        ca_path: PathBuf,
    },
    /// Per-SNI certificate selection on the host
    SniMap { certs: HashMap<String, CertPaths> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Configuration faults.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {0}: {1}")]
    Io(PathBuf, String),

    #[error("cannot parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.host.backlog_size, 128);
        assert_eq!(config.host.transport.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.client.tls, TlsMode::Off);
        assert!(config.client.accept_by_version);
    }

    #[test]
    fn test_parse_partial_file() {
        let config = Config::from_str(
            r#"
            [host]
            endpoints = ["0.0.0.0:9000"]
            max_open_conn_count = 8

            [host.transport]
            chunk_size = 4096

            [client]
            endpoint = "10.0.0.5:9000"
            "#,
        )
        .unwrap();
        assert_eq!(config.host.endpoints[0].port(), 9000);
        assert_eq!(config.host.max_open_conn_count, 8);
        assert_eq!(config.host.transport.chunk_size, 4096);
        // Unset fields keep their defaults.
        assert_eq!(config.host.transport.chunk_pool_size, DEFAULT_CHUNK_POOL_SIZE);
        assert_eq!(config.client.endpoint.port(), 9000);
    }

    #[test]
    fn test_tls_modes_parse() {
        let config = Config::from_str(
            r#"
            [host.tls]
            mode = "mutual"
            cert_path = "/etc/lattice/host.pem"
            key_path = "/etc/lattice/host.key"
            ca_path = "/etc/lattice/ca.pem"
            "#,
        )
        .unwrap();
        assert!(matches!(config.host.tls, TlsMode::Mutual { .. }));
    }

    #[test]
    fn test_tiny_chunk_size_rejected() {
        let result = Config::from_str(
            r#"
            [host.transport]
            chunk_size = 8
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_timeouts_rejected() {
        let result = Config::from_str(
            r#"
            [host.transport]
            inactivity_interval_secs = 30
            inactivity_timeout_secs = 10
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_missing_path_gives_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/lattice.toml")).unwrap();
        assert_eq!(config.host.backlog_size, 128);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[host]\nbacklog_size = 7").unwrap();
        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.host.backlog_size, 7);
    }
}
