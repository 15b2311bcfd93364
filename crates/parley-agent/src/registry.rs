//! Named catalog of agent configurations, persisted as a single JSON file,
//! plus in-memory factories for programmatically registered agents.
//! Configs are hydrated into agents on demand.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parley_provider::ProviderRegistry;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::default::{DefaultAgent, HandoffAgent};
use crate::tool::{ToolBinder, ToolRef};
use crate::Agent;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no agent registered with name \"{0}\"")]
    UnknownAgent(String),
    #[error("agent with name \"{0}\" already exists")]
    DuplicateAgent(String),
    #[error("cannot hydrate agent \"{name}\": {reason}")]
    Hydration { name: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

fn default_max_tokens() -> u32 {
    1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// `"provider/model"` identifier resolved through the provider registry.
    pub model: String,
    pub instructions: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub tools: Vec<ToolRef>,
    #[serde(default)]
    pub tool_configs: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub handoff: bool,
    pub settings: AgentSettings,
}

type AgentFactory = Arc<dyn Fn() -> Box<dyn Agent> + Send + Sync>;

struct FactoryEntry {
    description: String,
    factory: AgentFactory,
}

pub struct AgentRegistry {
    path: PathBuf,
    providers: Arc<ProviderRegistry>,
    binder: ToolBinder,
    configs: Mutex<Vec<AgentConfig>>,
    factories: std::sync::Mutex<HashMap<String, FactoryEntry>>,
}

impl AgentRegistry {
    /// Open the registry file, creating parent directories as needed. A
    /// missing file is an empty registry.
    pub async fn open(
        path: impl AsRef<Path>,
        providers: Arc<ProviderRegistry>,
        binder: ToolBinder,
    ) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let configs = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if !contents.is_empty() => serde_json::from_str(&contents)?,
            _ => Vec::new(),
        };
        Ok(Self {
            path,
            providers,
            binder,
            configs: Mutex::new(configs),
            factories: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Hydrate an agent from a factory or persisted config.
    pub async fn create_agent(&self, name: &str) -> Result<Box<dyn Agent>, RegistryError> {
        if let Some(factory) = {
            let factories = self.factories.lock().expect("factories lock");
            factories.get(name).map(|entry| entry.factory.clone())
        } {
            return Ok(factory());
        }

        let config = {
            let configs = self.configs.lock().await;
            configs
                .iter()
                .find(|c| c.name == name)
                .cloned()
                .ok_or_else(|| RegistryError::UnknownAgent(name.to_string()))?
        };

        let (provider, model_id) =
            self.providers
                .resolve(&config.settings.model)
                .map_err(|e| RegistryError::Hydration {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?;
        let tools = self.binder.bind(&config.settings.tools);

        let agent: Box<dyn Agent> = if config.handoff {
            Box::new(HandoffAgent::new(
                name,
                config.settings,
                provider,
                model_id,
                tools,
            ))
        } else {
            Box::new(DefaultAgent::new(
                name,
                config.settings,
                provider,
                model_id,
                tools,
            ))
        };
        Ok(agent)
    }

    pub async fn registered_names(&self) -> HashSet<String> {
        self.descriptions().await.into_keys().collect()
    }

    /// Agent names mapped to their descriptions, configs and factories both.
    pub async fn descriptions(&self) -> HashMap<String, String> {
        let mut descriptions: HashMap<String, String> = {
            let configs = self.configs.lock().await;
            configs
                .iter()
                .map(|c| (c.name.clone(), c.description.clone()))
                .collect()
        };
        let factories = self.factories.lock().expect("factories lock");
        for (name, entry) in factories.iter() {
            descriptions.insert(name.clone(), entry.description.clone());
        }
        descriptions
    }

    pub async fn add_config(&self, config: AgentConfig) -> Result<(), RegistryError> {
        {
            let factories = self.factories.lock().expect("factories lock");
            if factories.contains_key(&config.name) {
                return Err(RegistryError::DuplicateAgent(config.name));
            }
        }
        let mut configs = self.configs.lock().await;
        if configs.iter().any(|c| c.name == config.name) {
            return Err(RegistryError::DuplicateAgent(config.name));
        }
        configs.push(config);
        self.persist(&configs).await
    }

    pub async fn remove_config(&self, name: &str) -> Result<(), RegistryError> {
        let mut configs = self.configs.lock().await;
        let before = configs.len();
        configs.retain(|c| c.name != name);
        if configs.len() == before {
            return Err(RegistryError::UnknownAgent(name.to_string()));
        }
        self.persist(&configs).await
    }

    pub fn add_factory(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        factory: AgentFactory,
    ) {
        let mut factories = self.factories.lock().expect("factories lock");
        factories.insert(
            name.into(),
            FactoryEntry {
                description: description.into(),
                factory,
            },
        );
    }

    async fn persist(&self, configs: &[AgentConfig]) -> Result<(), RegistryError> {
        let contents = serde_json::to_string_pretty(configs)?;
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }
}
