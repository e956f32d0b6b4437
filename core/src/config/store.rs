//! Configuration loading
//!
//! Layers an optional TOML file under `AA_ENGINE__<SECTION>__<KEY>`
//! environment overrides, e.g. `AA_ENGINE__EXECUTION__YIELD_EVERY_NODES=50`.

use std::path::Path;

use crate::config::EngineConfig;
use crate::error::{AaError, Result};

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "AA_ENGINE";

impl EngineConfig {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without touching the environment
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| AaError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| AaError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_file_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            file,
            "[execution]\ndefault_bounce_fee = 20000\nmax_responses_per_primary_trigger = 5\n"
        )
        .expect("write");

        let config = EngineConfig::load(Some(file.path())).expect("load");
        assert_eq!(config.execution.default_bounce_fee, 20_000);
        assert_eq!(config.execution.max_responses_per_primary_trigger, 5);
        // untouched sections keep their defaults
        assert_eq!(config.execution.min_base_output_amount, 60);
        assert_eq!(config.protocol.alt, "1");
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempfile::tempdir().expect("temp dir");
        let result = EngineConfig::load(Some(&dir.path().join("absent.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn invalid_values_fail_validation() {
        let result = EngineConfig::from_toml_str("[execution]\nyield_every_nodes = 0\n");
        assert!(matches!(result, Err(AaError::InvalidConfig { .. })));
    }

    #[test]
    fn toml_rendering_parses_back() {
        let config = EngineConfig::default();
        let rendered = config.to_toml().expect("render");
        let parsed = EngineConfig::from_toml_str(&rendered).expect("parse");
        assert_eq!(parsed, config);
    }
}
