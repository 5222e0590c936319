//! Read-only, indexed view of a validated [`RouterConfig`].
//!
//! Every other component looks configuration up through [`ConfigStore`]
//! rather than walking the raw config vectors.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use super::validation::{self, ConfigError};
use super::{loader, CategoryRule, ChannelConfig, RouterConfig};
use crate::routing::{Category, ChannelId};

/// Effective breaker settings for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Time the breaker stays open before a half-open trial.
    pub cooldown: Duration,
}

/// Validated configuration with lookup indexes.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    config: RouterConfig,
    channels: HashMap<ChannelId, ChannelConfig>,
    chains: HashMap<Category, Vec<ChannelId>>,
    latency_targets: HashMap<Category, u64>,
}

impl ConfigStore {
    /// Validate `config` and build the lookup indexes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] listing every violated constraint.
    pub fn from_config(config: RouterConfig) -> Result<Self, ConfigError> {
        validation::validate_all(&config)?;
        Ok(Self::index(config))
    }

    /// Load, validate and index a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] from reading, parsing or validating the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::index(loader::load_from_file(path)?))
    }

    /// Parse, validate and index TOML content.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] from parsing or validating the content.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(Self::index(loader::load_from_str(content, "<inline>")?))
    }

    // Callers guarantee `config` has passed validation.
    fn index(config: RouterConfig) -> Self {
        let channels = config
            .channels
            .iter()
            .map(|c| (ChannelId::new(c.id.clone()), c.clone()))
            .collect();

        let chains = config
            .categories
            .iter()
            .map(|c| {
                (
                    Category::new(c.name.clone()),
                    c.chain.iter().map(|id| ChannelId::new(id.clone())).collect(),
                )
            })
            .collect();

        let latency_targets = config
            .categories
            .iter()
            .filter_map(|c| c.latency_target_ms.map(|ms| (Category::new(c.name.clone()), ms)))
            .collect();

        Self {
            config,
            channels,
            chains,
            latency_targets,
        }
    }

    /// The underlying configuration.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Look up a channel definition.
    pub fn channel(&self, id: &ChannelId) -> Option<&ChannelConfig> {
        self.channels.get(id)
    }

    /// All configured channel ids, in declaration order.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.config
            .channels
            .iter()
            .map(|c| ChannelId::new(c.id.clone()))
            .collect()
    }

    /// The ordered chain configured for `category`, or `None` if unknown.
    pub fn chain(&self, category: &Category) -> Option<&[ChannelId]> {
        self.chains.get(category).map(Vec::as_slice)
    }

    /// Informational latency target for `category`.
    pub fn latency_target_ms(&self, category: &Category) -> Option<u64> {
        self.latency_targets.get(category).copied()
    }

    /// Classification rules in declaration order.
    pub fn rules(&self) -> &[CategoryRule] {
        &self.config.rules
    }

    /// Category used when no rule matches.
    pub fn default_category(&self) -> Category {
        Category::new(self.config.router.default_category.clone())
    }

    /// Telemetry ring-buffer capacity.
    pub fn telemetry_capacity(&self) -> usize {
        self.config.router.telemetry_capacity
    }

    /// Effective breaker settings for `id`: the channel override if present,
    /// else the `[breaker]` defaults.
    pub fn breaker_settings(&self, id: &ChannelId) -> BreakerSettings {
        let defaults = &self.config.breaker;
        let channel = self.channels.get(id);
        BreakerSettings {
            failure_threshold: channel
                .and_then(|c| c.failure_threshold)
                .unwrap_or(defaults.failure_threshold),
            cooldown: Duration::from_secs(
                channel
                    .and_then(|c| c.cooldown_s)
                    .unwrap_or(defaults.cooldown_s),
            ),
        }
    }
}
