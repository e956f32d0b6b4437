//! Engine configuration values and validation
//!
//! Everything here is node-local tuning or protocol header values. Consensus
//! size constants (input/output byte costs) live in [`crate::ledger::unit`].

use serde::{Deserialize, Serialize};

use crate::error::{AaError, Result};

/// Unit header values stamped on composed units
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Unit format version
    #[serde(default = "default_version")]
    pub version: String,
    /// Network discriminator
    #[serde(default = "default_alt")]
    pub alt: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            alt: default_alt(),
        }
    }
}

/// Limits applied while executing triggers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// `bounce_fees.base` when a definition omits it
    #[serde(default = "default_bounce_fee")]
    pub default_bounce_fee: u64,
    /// Responses allowed per primary trigger, secondaries included
    #[serde(default = "default_max_responses")]
    pub max_responses_per_primary_trigger: usize,
    /// Base outputs below this amount are never spent by AAs
    #[serde(default = "default_min_base_output")]
    pub min_base_output_amount: u64,
    /// Template nodes visited between cooperative yields
    #[serde(default = "default_yield_every")]
    pub yield_every_nodes: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_bounce_fee: default_bounce_fee(),
            max_responses_per_primary_trigger: default_max_responses(),
            min_base_output_amount: default_min_base_output(),
            yield_every_nodes: default_yield_every(),
        }
    }
}

/// Event bus sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventsConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

impl EngineConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.protocol.version.is_empty() {
            return Err(AaError::InvalidConfig {
                message: "protocol.version must not be empty".to_string(),
            });
        }
        if self.protocol.alt.is_empty() {
            return Err(AaError::InvalidConfig {
                message: "protocol.alt must not be empty".to_string(),
            });
        }
        if self.execution.default_bounce_fee == 0 {
            return Err(AaError::InvalidConfig {
                message: "execution.default_bounce_fee must be greater than 0".to_string(),
            });
        }
        if self.execution.max_responses_per_primary_trigger == 0 {
            return Err(AaError::InvalidConfig {
                message: "execution.max_responses_per_primary_trigger must be greater than 0"
                    .to_string(),
            });
        }
        if self.execution.yield_every_nodes == 0 {
            return Err(AaError::InvalidConfig {
                message: "execution.yield_every_nodes must be greater than 0".to_string(),
            });
        }
        if self.events.channel_capacity == 0 {
            return Err(AaError::InvalidConfig {
                message: "events.channel_capacity must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

fn default_version() -> String {
    "4.0".to_string()
}

fn default_alt() -> String {
    "1".to_string()
}

fn default_bounce_fee() -> u64 {
    10_000
}

fn default_max_responses() -> usize {
    10
}

fn default_min_base_output() -> u64 {
    60
}

fn default_yield_every() -> u64 {
    100
}

fn default_channel_capacity() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.execution.default_bounce_fee, 10_000);
        assert_eq!(config.execution.max_responses_per_primary_trigger, 10);
        assert_eq!(config.execution.min_base_output_amount, 60);
        assert_eq!(config.execution.yield_every_nodes, 100);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = EngineConfig::default();
        config.execution.yield_every_nodes = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.execution.max_responses_per_primary_trigger = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.protocol.alt.clear();
        assert!(config.validate().is_err());
    }
}
