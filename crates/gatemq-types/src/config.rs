//! Broker configuration
//!
//! Deserialized from the `[broker]` table of the server's TOML file.
//! Destination overrides are keyed by destination reference, e.g.
//!
//! ```toml
//! [broker.destinations."queue://orders"]
//! memory_quota_bytes = 1048576
//! exclusive = true
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionConfig;
use crate::destination::{DestinationConfig, DestinationKey, DestinationRef};
use crate::error::{Error, Result};

/// Broker-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Applied to destinations without an explicit entry
    #[serde(default)]
    pub default_destination: DestinationConfig,

    /// Per-destination overrides keyed by reference
    #[serde(default)]
    pub destinations: HashMap<String, DestinationConfig>,

    /// Applied to connections opened without explicit settings
    #[serde(default)]
    pub default_connection: ConnectionConfig,

    /// How often expired messages are swept (0 = never)
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// Buffer size of the broker event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_maintenance_interval() -> u64 {
    60
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_destination: DestinationConfig::default(),
            destinations: HashMap::new(),
            default_connection: ConnectionConfig::default(),
            maintenance_interval_secs: default_maintenance_interval(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl BrokerConfig {
    /// Add or replace an override for one destination
    pub fn with_destination(mut self, reference: impl Into<String>, config: DestinationConfig) -> Self {
        self.destinations.insert(reference.into(), config);
        self
    }

    /// Reject unusable quotas and windows before the broker starts
    pub fn validate(&self) -> Result<()> {
        self.default_destination.validate()?;
        self.default_connection.validate()?;

        let mut seen = HashSet::new();
        for (reference, config) in &self.destinations {
            let parsed = reference.parse::<DestinationRef>()?;
            if !seen.insert(parsed.key().clone()) {
                return Err(Error::Config(format!(
                    "destination {} is configured more than once",
                    parsed.key()
                )));
            }
            config.validate().map_err(|e| match e {
                Error::QuotaMisconfigured(msg) => {
                    Error::QuotaMisconfigured(format!("{reference}: {msg}"))
                }
                other => other,
            })?;
        }

        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Effective configuration for a destination. An `exclusive` tag on
    /// the configured reference counts like `exclusive = true`.
    pub fn destination_config(&self, key: &DestinationKey) -> DestinationConfig {
        self.destinations
            .iter()
            .find_map(|(reference, config)| {
                let parsed = reference.parse::<DestinationRef>().ok()?;
                (parsed.key() == key).then(|| {
                    let mut config = config.clone();
                    config.exclusive |= parsed.is_exclusive();
                    config
                })
            })
            .unwrap_or_else(|| self.default_destination.clone())
    }
}
