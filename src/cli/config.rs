use std::path::Path;

use aa_engine_core::EngineConfig;
use anyhow::{Context, Result};
use console::Style;

pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
    EngineConfig::load(path).context("Failed to load configuration")
}

pub fn handle_show(config: &EngineConfig) -> Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}

pub fn handle_check(path: Option<&Path>) -> Result<()> {
    load(path)?;
    let source = path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "defaults".to_string());
    println!("{} configuration from {}", Style::new().green().apply_to("valid"), source);
    Ok(())
}
