//! Server configuration
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables, then by command-line flags (applied in `main`).
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:3000"
//!
//! [broker.default_destination]
//! memory_quota_bytes = 67108864
//! ```

use std::fs;
use std::path::Path;

use gatemq_types::{BrokerConfig, ConnectionConfig};
use serde::Deserialize;
use thiserror::Error;

pub const ENV_BIND_ADDR: &str = "GATEMQ_BIND_ADDR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid broker configuration: {0}")]
    Broker(#[from] gatemq_types::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ListenConfig,
    pub broker: BrokerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Address of the admin HTTP API
    pub bind_addr: String,

    /// Settings of the connection used for publishes made through the API
    pub publisher: ConnectionConfig,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            // An HTTP caller gets a 503 rather than a hanging request
            publisher: ConnectionConfig::default().with_reject_on_full(true),
        }
    }
}

impl ServerConfig {
    /// Load from `path` (defaults only if `None`), apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml(&fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            self.server.bind_addr = addr;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        self.server.publisher.validate()?;
        Ok(())
    }
}
