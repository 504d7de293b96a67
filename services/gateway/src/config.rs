//! Gateway configuration
//!
//! Loaded from a TOML file resolved via `--config`, then the CONFIG_PATH
//! env var, then `iflow-gateway.toml` in the working directory. The keys
//! file (accounts and client bindings) is separate and managed by
//! [`iflow_pool::KeysStore`]; this config only points at it.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
}

/// Listener and upstream timing settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Path to the keys file holding accounts and client bindings
    pub keys_path: PathBuf,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Background token refresh settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// How often the sweep runs
    pub interval_secs: u64,
    /// Refresh credentials expiring within this window
    pub margin_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            margin_secs: 600,
        }
    }
}

fn default_timeout() -> u64 {
    300
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        if config.server.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if config.refresh.interval_secs == 0 {
            return Err(common::Error::Config(
                "refresh interval_secs must be greater than 0".into(),
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("iflow-gateway.toml")
    }
}
