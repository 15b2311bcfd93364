//! YAML configuration for the `parley` binary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_root: PathBuf,
    pub provider: ProviderConfig,
    pub selector: Option<SelectorConfig>,
    pub console: ConsoleConfig,
    pub server: ServerConfig,
    /// Session checkpoint interval in seconds.
    pub sync_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub id: String,
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorConfig {
    /// `"provider/model"` used by the agent selector.
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Highest permission level offered at the console prompt (1..=3).
    pub upper_bound: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from(".data"),
            provider: ProviderConfig::default(),
            selector: None,
            console: ConsoleConfig::default(),
            server: ServerConfig::default(),
            sync_interval_secs: 3,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: "openai".into(),
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self { upper_bound: 3 }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8623".into(),
        }
    }
}

impl Config {
    /// Load from a YAML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_yaml::from_str(&contents)
                .with_context(|| format!("invalid config file {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("cannot read {}", path.display())),
        }
    }

    pub fn agents_path(&self) -> PathBuf {
        self.data_root.join("agents").join("registry.json")
    }

    pub fn users_path(&self) -> PathBuf {
        self.data_root.join("users").join("registry.json")
    }

    pub fn permissions_path(&self) -> PathBuf {
        self.data_root.join("users").join("permissions.json")
    }

    pub fn sessions_path(&self) -> PathBuf {
        self.data_root.join("sessions")
    }
}
