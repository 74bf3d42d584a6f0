//! Client settings file
//!
//! Everything the connection URI does not carry: probe deadline, relay
//! chunk size, TLS policy, the network settings handed to the host, and
//! the log level. TOML or JSON, picked by file extension. Every field has a
//! default, so an empty file is valid.
//!
//! ```toml
//! [tunnel]
//! probe_timeout_secs = 10
//! tls = "webpki"
//!
//! [network]
//! mtu = 1400
//! dns = ["1.1.1.1"]
//!
//! [logging]
//! level = "debug"
//! ```

use crate::interface::NetworkSettings;
use crate::relay::MAX_CHUNK;
use crate::tls::TlsMode;
use crate::transport::DEFAULT_USER_AGENT;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Smallest MTU every IPv4 host must accept
const MIN_MTU: u16 = 576;

/// Settings file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsFormat {
    Toml,
    Json,
}

/// Top-level settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub tunnel: TunnelSettings,
    pub network: NetworkSettings,
    pub logging: LoggingSettings,
}

/// Session tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Reachability probe deadline
    pub probe_timeout_secs: u64,
    /// Largest chunk handed to the interface per write
    pub max_chunk: usize,
    /// User-Agent sent with the WebSocket upgrade
    pub user_agent: String,
    /// Server certificate policy
    pub tls: TlsMode,
    /// Bound on the WebSocket close during teardown
    pub close_timeout_millis: u64,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 10,
            max_chunk: MAX_CHUNK,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            tls: TlsMode::default(),
            close_timeout_millis: 2000,
        }
    }
}

impl TunnelSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_millis)
    }

    /// `max_chunk` clamped to what the relay accepts
    pub fn effective_max_chunk(&self) -> usize {
        self.max_chunk.clamp(1, MAX_CHUNK)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing` filter directive, e.g. "info" or "vless_tunnel=debug"
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ClientSettings {
    /// Load from a `.toml` or `.json` file
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let format = match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => SettingsFormat::Toml,
            "json" => SettingsFormat::Json,
            other => return Err(SettingsError::UnsupportedFormat(other.to_string())),
        };

        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::Io(format!("{}: {}", path.display(), e)))?;
        let settings = Self::from_str_as(&content, format)?;

        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Parse from a string in the given format
    pub fn from_str_as(content: &str, format: SettingsFormat) -> Result<Self, SettingsError> {
        match format {
            SettingsFormat::Toml => Self::from_toml(content),
            SettingsFormat::Json => Self::from_json(content),
        }
    }

    /// Parse and validate TOML
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Self =
            toml::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse and validate JSON
    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        let settings: Self =
            serde_json::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values a session cannot run with
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.tunnel.probe_timeout_secs == 0 {
            return Err(SettingsError::Invalid(
                "tunnel.probe_timeout_secs must be positive".into(),
            ));
        }
        if self.tunnel.user_agent.trim().is_empty() {
            return Err(SettingsError::Invalid("tunnel.user_agent is empty".into()));
        }
        if self.network.mtu < MIN_MTU {
            return Err(SettingsError::Invalid(format!(
                "network.mtu {} is below {}",
                self.network.mtu, MIN_MTU
            )));
        }
        Ok(())
    }
}

/// Settings errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported settings format: {0:?}")]
    UnsupportedFormat(String),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}
