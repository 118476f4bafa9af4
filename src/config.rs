//! Configuration loading.
//!
//! Two layers of on-disk TOML, both under the bot's settings directory:
//! - `settings/global.toml`: process-wide knobs (data dir, worker pool
//!   capacity, quit grace delay, API keys). Optional; defaults apply.
//! - `settings/<network>.toml`: one file per network the supervisor may
//!   start. A network without a settings file cannot be started.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Process-wide configuration (`settings/global.toml`).
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Directory for per-handler state files, relative to the base dir.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Maximum number of off-thread handler executions running at once.
    #[serde(default = "default_worker_capacity")]
    pub worker_capacity: usize,

    /// Seconds to wait after the last session quits before the process
    /// exits, so quit handshakes can complete.
    #[serde(default = "default_quit_grace_secs")]
    pub quit_grace_secs: u64,

    /// API keys for handlers that call external services, keyed by
    /// service name (e.g. "twitch").
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            worker_capacity: default_worker_capacity(),
            quit_grace_secs: default_quit_grace_secs(),
            api_keys: HashMap::new(),
        }
    }
}

impl BotConfig {
    /// Load global configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BotConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load global configuration, falling back to defaults when the file
    /// does not exist. Parse errors are still reported.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_worker_capacity() -> usize {
    8
}

fn default_quit_grace_secs() -> u64 {
    2
}

/// Per-network connection settings (`settings/<network>.toml`).
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Server address as host:port (e.g. "irc.example.net:6667").
    pub server: String,
    /// Nickname to register with.
    pub nickname: String,
    /// Realname for the USER command.
    #[serde(default = "default_realname")]
    pub realname: String,
    /// Optional server password (PASS).
    #[serde(default)]
    pub server_password: Option<String>,
    /// Channels to join once registered.
    #[serde(default)]
    pub channels: Vec<String>,
}

impl NetworkConfig {
    /// Path of the settings file for `network` under `settings_dir`.
    pub fn path_for(settings_dir: &Path, network: &str) -> std::path::PathBuf {
        settings_dir.join(format!("{network}.toml"))
    }

    /// Whether settings exist on disk for `network`.
    pub fn exists(settings_dir: &Path, network: &str) -> bool {
        Self::path_for(settings_dir, network).is_file()
    }

    /// Load the settings for one network.
    pub fn load(settings_dir: &Path, network: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(Self::path_for(settings_dir, network))?;
        let config: NetworkConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

fn default_realname() -> String {
    "botherd".to_string()
}
