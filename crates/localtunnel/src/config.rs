//! Client configuration
//!
//! Connection settings can be stored in `~/.config/localtunnel/config.toml`.
//! Runtime options like the local port are provided by the caller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::{Client, DEFAULT_ENDPOINT};

/// Default local host to proxy to
pub const DEFAULT_LOCAL_HOST: &str = "localhost";

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeouts applied by a [`Client`] and the tunnels it creates.
///
/// `None` disables the corresponding timeout. A dial timeout counts as a
/// dial error. The read timeout bounds how long a connection may stay idle
/// in both directions and counts as a relay error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub dial_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub handshake_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Some(DEFAULT_DIAL_TIMEOUT),
            read_timeout: None,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
        }
    }
}

/// localtunnel client configuration (parsed from TOML)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker base URL
    pub endpoint: Option<String>,

    /// Host of the local server to expose
    pub local_host: Option<String>,

    /// Requested subdomain (None = assigned by the broker)
    pub subdomain: Option<String>,

    /// Data-plane dial timeout, 0 disables it
    pub dial_timeout_secs: Option<u64>,

    /// Idle read timeout on relayed sockets, 0 disables it
    pub read_timeout_secs: Option<u64>,

    /// Registration request timeout, 0 disables it
    pub handshake_timeout_secs: Option<u64>,
}

impl ClientConfig {
    /// Get the default config directory path
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("localtunnel")
    }

    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from a specific path
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load configuration, returning None if it doesn't exist
    pub fn try_load_default() -> Option<Self> {
        let path = Self::default_path();
        if !path.exists() {
            return None;
        }
        match Self::load(&path) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("Ignoring unreadable config {:?}: {}", path, e);
                None
            }
        }
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::info!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Some(endpoint) = &self.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                errors.push(format!("Endpoint must be an http(s) URL: {}", endpoint));
            }
        }

        if matches!(&self.local_host, Some(h) if h.trim().is_empty()) {
            errors.push("Local host cannot be empty".to_string());
        }

        if matches!(&self.subdomain, Some(s) if s.trim().is_empty()) {
            errors.push("Subdomain cannot be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT)
    }

    pub fn local_host(&self) -> &str {
        self.local_host.as_deref().unwrap_or(DEFAULT_LOCAL_HOST)
    }

    /// Timeouts with unset values falling back to the defaults
    pub fn options(&self) -> ClientOptions {
        let defaults = ClientOptions::default();
        ClientOptions {
            dial_timeout: seconds(self.dial_timeout_secs, defaults.dial_timeout),
            read_timeout: seconds(self.read_timeout_secs, defaults.read_timeout),
            handshake_timeout: seconds(self.handshake_timeout_secs, defaults.handshake_timeout),
        }
    }

    /// Build a client for the configured endpoint and timeouts
    pub fn client(&self) -> Client {
        Client::with_options(self.endpoint(), self.options())
    }
}

fn seconds(value: Option<u64>, default: Option<Duration>) -> Option<Duration> {
    match value {
        None => default,
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
    }
}
