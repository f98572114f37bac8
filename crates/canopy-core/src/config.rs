//! Configuration system for Canopy.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CANOPY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/canopy/config.toml
//!   3. ~/.config/canopy/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CanopyConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub directory: DirectoryConfig,
    pub share: ShareConfig,
    pub exchange: ExchangeConfig,
    pub registration: RegistrationConfig,
    pub nat: NatConfig,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name this peer registers under.
    pub peer_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local UDP bind address. Port 0 = OS-assigned.
    pub bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Base URL of the HTTP peer directory.
    pub url: String,
    /// Name the rendezvous server registers under in the directory.
    pub server_name: String,
    /// Skip TLS certificate verification (the public directory is self-signed).
    pub accept_invalid_certs: bool,
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// File or directory to serve. Empty = share nothing.
    pub path: PathBuf,
    /// Directory nesting limit while building the content tree.
    pub max_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub handshake_timeout_ms: u64,
    pub handshake_retries: u32,
    pub datum_deadline_ms: u64,
    pub datum_read_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Pause between failed registration rounds.
    pub retry_delay_secs: u64,
    /// How long to wait for the server's PublicKey and Root after HelloReply.
    pub setup_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    /// No keep-alive reply for this long means the registration is lost.
    pub silence_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// Direct Hello attempts before asking the server to relay.
    pub direct_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Remote tree nesting limit.
    pub max_depth: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            peer_name: "canopy".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".to_string(),
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            url: "https://jch.irif.fr:8443".to_string(),
            server_name: "jch.irif.fr".to_string(),
            accept_invalid_certs: true,
            http_timeout_secs: 5,
        }
    }
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            max_depth: 64,
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            handshake_retries: 3,
            datum_deadline_ms: 30_000,
            datum_read_timeout_ms: 2_000,
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: 5,
            setup_timeout_secs: 15,
            keepalive_interval_secs: 30,
            silence_window_secs: 180,
        }
    }
}

impl Default for NatConfig {
    fn default() -> Self {
        Self { direct_attempts: 3 }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self { max_depth: 64 }
    }
}

// ── Durations ─────────────────────────────────────────────────────────────────

impl ExchangeConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn datum_deadline(&self) -> Duration {
        Duration::from_millis(self.datum_deadline_ms)
    }

    pub fn datum_read_timeout(&self) -> Duration {
        Duration::from_millis(self.datum_read_timeout_ms)
    }
}

impl RegistrationConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn silence_window(&self) -> Duration {
        Duration::from_secs(self.silence_window_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("canopy")
}

fn home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CanopyConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            CanopyConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse one config file without consulting the environment.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CANOPY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CanopyConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CANOPY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("CANOPY_IDENTITY__PEER_NAME") {
            self.identity.peer_name = v;
        }
        if let Some(v) = var("CANOPY_NETWORK__BIND_ADDR") {
            self.network.bind_addr = v;
        }
        if let Some(v) = var("CANOPY_DIRECTORY__URL") {
            self.directory.url = v;
        }
        if let Some(v) = var("CANOPY_DIRECTORY__SERVER_NAME") {
            self.directory.server_name = v;
        }
        if let Some(v) = var("CANOPY_DIRECTORY__ACCEPT_INVALID_CERTS") {
            self.directory.accept_invalid_certs = v == "true" || v == "1";
        }
        if let Some(v) = var("CANOPY_SHARE__PATH") {
            self.share.path = PathBuf::from(v);
        }
    }
}
