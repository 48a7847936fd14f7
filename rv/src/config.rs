//! Configuration for rendezvous

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::store::STATE_FILE_NAME;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the persisted barrier table
    #[serde(rename = "state-dir")]
    pub state_dir: PathBuf,

    /// Log level for the `rv` binary (trace, debug, info, warn, error)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rendezvous")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            log_level: None,
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// An explicit path must load. The project-local `.rendezvous.yml` and
    /// the user config are tried in turn, and defaults apply when neither is
    /// usable.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".rendezvous.yml");
        let user_config = dirs::config_dir().map(|dir| dir.join("rendezvous").join("rendezvous.yml"));

        for path in [Some(local_config), user_config].iter().flatten() {
            if path.exists() {
                match Self::load_from_file(path) {
                    Ok(config) => return Ok(config),
                    Err(e) => tracing::warn!("Failed to load config from {}: {}", path.display(), e),
                }
            }
        }

        tracing::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::debug!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Full path of the persisted barrier table
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE_NAME)
    }
}
