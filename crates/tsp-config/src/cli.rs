//! Command-line overrides for the client configuration.

use std::path::PathBuf;

use clap::Args;

use crate::{Config, ConfigError};

/// Connection flags shared by every `tsp` subcommand.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Args, Debug, Clone, Default)]
pub struct CliArgs {
    /// Server host.
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Server port.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Per-attempt connect timeout in milliseconds.
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Maximum reconnect attempts after a drop (-1 retries forever).
    #[arg(long, global = true, allow_negative_numbers = true)]
    pub max_reconnects: Option<i64>,

    /// Delay between reconnect attempts in milliseconds.
    #[arg(long, global = true)]
    pub reconnect_interval_ms: Option<u64>,

    /// Enable TLS.
    #[arg(long, global = true)]
    pub tls: bool,

    /// Skip server certificate verification (test servers only).
    #[arg(long, global = true)]
    pub insecure: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

impl CliArgs {
    /// Directory holding `config.ron`: `--config` or the platform default.
    pub fn config_dir(&self) -> Result<PathBuf, ConfigError> {
        self.config
            .clone()
            .or_else(Config::default_dir)
            .ok_or(ConfigError::NoConfigDir)
    }
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref host) = args.host {
            self.connection.host = host.clone();
        }
        if let Some(port) = args.port {
            self.connection.port = port;
        }
        if let Some(timeout) = args.timeout_ms {
            self.connection.timeout_ms = timeout;
        }
        if let Some(max) = args.max_reconnects {
            // Any negative value means "unbounded", as in the classic -1 convention.
            self.reconnect.max_attempts = u32::try_from(max).ok();
        }
        if let Some(interval) = args.reconnect_interval_ms {
            self.reconnect.interval_ms = interval;
        }
        if args.tls {
            self.tls.enabled = true;
        }
        if args.insecure {
            self.tls.verify_peer = false;
        }
        if let Some(ref level) = args.log_level {
            self.log.level = level.clone();
        }
    }
}
