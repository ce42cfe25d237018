//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside a config directory.
pub const CONFIG_FILE: &str = "config.ron";

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Server endpoint and connect timeout.
    pub connection: ConnectionConfig,
    /// Automatic reconnection after a dropped connection.
    pub reconnect: ReconnectConfig,
    /// Optional TLS on top of TCP.
    pub tls: TlsConfig,
    /// Wire framing limits.
    pub framing: FramingConfig,
    /// Logging settings.
    pub log: LogConfig,
}

/// Server endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Host name or IP address of the server.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Per-attempt connect timeout in milliseconds (TCP connect + TLS handshake).
    pub timeout_ms: u64,
}

/// Reconnection policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum reconnect attempts after a drop. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Delay before each attempt in milliseconds. 0 retries immediately.
    pub interval_ms: u64,
    /// Growth factor applied to the delay after every failed attempt (1.0 = fixed).
    pub backoff_multiplier: f64,
    /// Upper bound for the delay in milliseconds.
    pub max_interval_ms: u64,
    /// Jitter fraction (0.0 - 1.0) applied as +/- to each delay.
    pub jitter: f64,
}

/// TLS configuration. Paths point to PEM files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    /// Wrap the TCP stream in TLS.
    pub enabled: bool,
    /// CA bundle used to verify the server. Falls back to the webpki roots.
    pub ca_cert: Option<PathBuf>,
    /// Client certificate chain for mutual TLS.
    pub client_cert: Option<PathBuf>,
    /// Private key matching `client_cert`.
    pub client_key: Option<PathBuf>,
    /// Verify the server certificate. Disable only against test servers.
    pub verify_peer: bool,
    /// SNI / verification name override. Defaults to the connection host.
    pub server_name: Option<String>,
}

/// Framing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FramingConfig {
    /// Largest accepted frame payload in bytes.
    pub max_payload_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive (e.g. "info", "debug,tsp_client=trace").
    pub level: String,
    /// Directory for JSON log files in debug builds.
    pub dir: Option<PathBuf>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 13400,
            timeout_ms: 1000,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            interval_ms: 500,
            backoff_multiplier: 1.0,
            max_interval_ms: 30_000,
            jitter: 0.0,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ca_cert: None,
            client_cert: None,
            client_key: None,
            verify_peer: true,
            server_name: None,
        }
    }
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

impl Config {
    /// Platform default config directory (`$XDG_CONFIG_HOME/tsp` on Linux).
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tsp"))
    }

    /// Read `config.ron` from `config_dir`, writing the defaults there first
    /// if the file does not exist yet.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let config = ron::from_str(&text).map_err(ConfigError::ParseError)?;
                log::info!("Using config {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save(config_dir)?;
                log::info!("Wrote default config to {}", path.display());
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadError(e)),
        }
    }

    /// Write `config.ron` into `config_dir`, creating the directory.
    ///
    /// The file is replaced atomically so a concurrent reader never sees a
    /// partial document.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let text = ron::ser::to_string_pretty(
            self,
            ron::ser::PrettyConfig::new()
                .depth_limit(2)
                .struct_names(false),
        )
        .map_err(ConfigError::SerializeError)?;

        let tmp = config_dir.join(format!("{CONFIG_FILE}.tmp"));
        std::fs::write(&tmp, text).map_err(ConfigError::WriteError)?;
        std::fs::rename(&tmp, config_dir.join(CONFIG_FILE)).map_err(ConfigError::WriteError)
    }

    /// Re-read `config.ron`; `None` when nothing changed.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let text = std::fs::read_to_string(config_dir.join(CONFIG_FILE))
            .map_err(ConfigError::ReadError)?;
        let fresh: Self = ron::from_str(&text).map_err(ConfigError::ParseError)?;

        if fresh == *self {
            return Ok(None);
        }
        log::info!("Config changed on disk");
        Ok(Some(fresh))
    }
}
