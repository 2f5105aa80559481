//! Load and validate agent config from a YAML file.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::settings::AgentConfig;

/// Load config from YAML, apply defaults, and validate it.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AgentConfig> {
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
    let config: AgentConfig = serde_yaml::from_str(&raw).context("parsing config file")?;
    config.validate()?;
    Ok(config)
}
