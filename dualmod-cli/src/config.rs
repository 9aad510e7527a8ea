//! Configuration handling for the dualmod CLI

use anyhow::{Context, Result};
use dualmod_loader::LoaderConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "dualmod.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub loader: LoaderConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Print JSON instead of text where a command supports both
    #[serde(default)]
    pub json: bool,

    /// Print the cycle report after `check`
    #[serde(default = "default_true")]
    pub show_cycles: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            json: false,
            show_cycles: default_true(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Load configuration from file or use defaults
pub fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => read_config(&path),
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                read_config(default_path)
            } else {
                Ok(Config::default())
            }
        }
    }
}

fn read_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}
