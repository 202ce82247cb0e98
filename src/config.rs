//! Configuration
//!
//! TOML configuration shared by the CLI and the lobby server. The default
//! location is platform specific:
//! - Linux: ~/.config/pairup/config.toml
//! - Windows: %APPDATA%\pairup\config.toml
//! - macOS: ~/Library/Application Support/pairup/config.toml

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::session::MediaConstraints;

/// Application name used for configuration directory
const APP_NAME: &str = "pairup";

/// Delay between readiness and offer creation (ms)
const DEFAULT_SETTLE_DELAY_MS: u64 = 250;

const DEFAULT_DATA_CHANNEL_LABEL: &str = "chat";

const DEFAULT_EVENT_BUFFER: usize = 64;

const DEFAULT_PORT: u16 = 8080;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

/// Lobby server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// TLS certificate (PEM)
    #[serde(default)]
    pub cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[serde(default)]
    pub key: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
            cert: None,
            key: None,
        }
    }
}

/// Participant session settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Pause between readiness and offer creation; 0 disables it
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Label of the chat data channel opened by the initiator
    #[serde(default = "default_data_channel_label")]
    pub data_channel_label: String,

    /// Initial video constraint
    #[serde(default = "default_true")]
    pub video: bool,

    /// Initial audio constraint
    #[serde(default = "default_true")]
    pub audio: bool,

    /// Capacity of the session event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Lobby server URL (ws:// or wss://)
    #[serde(default)]
    pub signaling_url: Option<String>,
}

fn default_settle_delay_ms() -> u64 {
    DEFAULT_SETTLE_DELAY_MS
}

fn default_data_channel_label() -> String {
    DEFAULT_DATA_CHANNEL_LABEL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            data_channel_label: default_data_channel_label(),
            video: true,
            audio: true,
            event_buffer: DEFAULT_EVENT_BUFFER,
            signaling_url: None,
        }
    }
}

impl SessionConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Constraints in effect before the user toggles anything
    pub fn initial_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            video: self.video,
            audio: self.audio,
        }
    }
}

impl Config {
    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server port must not be 0".to_string()));
        }

        if self.server.cert.is_some() != self.server.key.is_some() {
            return Err(ConfigError::Invalid(
                "both cert and key must be provided for TLS".to_string(),
            ));
        }

        if let Some(ref url) = self.session.signaling_url {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(ConfigError::Invalid(format!(
                    "signaling URL {} must start with ws:// or wss://",
                    url
                )));
            }
        }

        if self.session.data_channel_label.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "data channel label must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Default configuration file path
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
}
