//! Agent configuration.
//!
//! Loaded from a JSON document; every field has a default so an empty object
//! is a valid configuration. Durations are given in milliseconds.
//!
//! ```json
//! {
//!   "queue_capacity": 4096,
//!   "retry": { "max_attempts": 5, "initial_delay": 250 },
//!   "trim": { "remove_empty_folders": true, "max_age": 259200000 },
//!   "event_filter": "*.*:4,Transport:3",
//!   "upload_interval": 300000,
//!   "plugins": ["FileShareEtwCsvUploader", "AzureBlobFolderUploader"]
//! }
//! ```

use crate::filter::{EventFilter, FilterError};
use crate::plugin::{PluginFlags, RegistryError};
use crate::retry::RetryConfig;
use crate::trim::TrimConfig;
use dca_queue::DeliveryConfig;
use serde::Deserialize;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding [`AgentConfig::queue_capacity`].
pub const QUEUE_CAPACITY_ENV: &str = "DCA_QUEUE_CAPACITY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    UnknownPlugin(#[from] RegistryError),
    #[error("invalid event filter: {0}")]
    Filter(#[from] FilterError),
    #[error("{var}={value:?} is not a valid value")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Slots of each pass's delivery queue.
    pub queue_capacity: usize,
    /// Budget for consumer callbacks and session resolution.
    pub retry: RetryConfig,
    pub trim: TrimConfig,
    /// `<task>.<event type>:<level>` rules; everything up to `Informational` if unset.
    pub event_filter: Option<String>,
    /// How often collected events are uploaded. A delivery round gets a
    /// quarter of it.
    #[serde(with = "opt_millis")]
    pub upload_interval: Option<Duration>,
    /// Names of the enabled plugins.
    pub plugins: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DeliveryConfig::default().capacity,
            retry: RetryConfig::default(),
            trim: TrimConfig::default(),
            event_filter: None,
            upload_interval: None,
            plugins: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Parses a JSON document, rejecting unknown plugin names and bad filters.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.plugin_flags()?;
        config.event_filter()?;
        Ok(config)
    }

    /// Reads `path` (defaults if `None`) and applies environment overrides.
    pub fn from_env_and_file(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_json(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.with_env_overrides(|var| std::env::var(var).ok())
    }

    /// Applies overrides looked up through `lookup`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(QUEUE_CAPACITY_ENV) {
            self.queue_capacity = value
                .trim()
                .parse()
                .ok()
                .filter(|&capacity: &usize| capacity > 0)
                .ok_or(ConfigError::InvalidEnv {
                    var: QUEUE_CAPACITY_ENV,
                    value,
                })?;
        }
        Ok(self)
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig::with_capacity(self.queue_capacity)
    }

    pub fn plugin_flags(&self) -> Result<PluginFlags, ConfigError> {
        Ok(PluginFlags::from_names(&self.plugins)?)
    }

    pub fn event_filter(&self) -> Result<EventFilter, ConfigError> {
        match &self.event_filter {
            Some(filter) => Ok(EventFilter::parse(filter)?),
            None => Ok(EventFilter::default()),
        }
    }

    /// Time budget of one delivery round.
    pub fn delivery_pass_length(&self) -> Option<Duration> {
        self.upload_interval.map(|interval| interval / 4)
    }
}

/// Serde adapter for durations written as whole milliseconds.
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// [`millis`] for optional durations; `null` or a missing field is `None`.
pub mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => super::millis::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
