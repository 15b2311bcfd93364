mod config;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{theme::ColorfulTheme, Password};
use parley_agent::{
    AgentConfig, AgentRegistry, AgentSettings, SelectorSettings, ToolBinder,
};
use parley_core::{SelectorFactory, SessionManager};
use parley_provider::{OpenAiCompatProvider, ProviderRegistry};
use parley_server::RequestServer;
use parley_gateway::TerminalGateway;
use parley_user::{ConsoleHandler, PermissionStore, RequestHandler, User, UserRegistry};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use config::Config;

#[derive(Parser)]
#[command(name = "parley", version, about = "multi-gateway conversational hub")]
struct Cli {
    #[arg(long, default_value = "parley.yaml", help = "Path to the config file")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with agents in a terminal session.
    Run {
        #[arg(long, default_value = "assistant")]
        agent: String,
        #[arg(long)]
        user: String,
    },
    /// Serve the remote request channel over websockets.
    Serve {
        #[arg(long)]
        addr: Option<String>,
    },
    /// Register a user, optionally with secrets and gateway mappings.
    RegisterUser {
        #[arg(long)]
        name: String,
        #[arg(long)]
        password: String,
        #[arg(long, help = "JSON file with {secrets: {..}, mappings: {..}}")]
        profile: Option<PathBuf>,
    },
    /// Add an agent configuration to the registry.
    AddAgent {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: String,
        #[arg(long, help = "Model as provider/model")]
        model: String,
        #[arg(long)]
        instructions: String,
        #[arg(long, help = "Parse handoff delegations from replies")]
        handoff: bool,
    },
}

#[derive(Debug, Default, Deserialize)]
struct UserProfile {
    #[serde(default)]
    secrets: HashMap<String, String>,
    #[serde(default)]
    mappings: HashMap<String, String>,
}

fn build_providers(config: &Config) -> Arc<ProviderRegistry> {
    let mut providers = ProviderRegistry::new();
    let api_key = std::env::var(&config.provider.api_key_env).unwrap_or_default();
    providers.register(
        config.provider.id.clone(),
        Arc::new(OpenAiCompatProvider::new(api_key, config.provider.base_url.clone())),
    );
    Arc::new(providers)
}

async fn build_agent_registry(
    config: &Config,
    providers: Arc<ProviderRegistry>,
) -> Result<Arc<AgentRegistry>> {
    let registry = AgentRegistry::open(config.agents_path(), providers, ToolBinder::new())
        .await
        .context("opening agent registry")?;
    Ok(Arc::new(registry))
}

fn build_selector(
    config: &Config,
    providers: &ProviderRegistry,
) -> Result<Option<SelectorFactory>> {
    let Some(selector) = &config.selector else {
        return Ok(None);
    };
    let (provider, model_id) = providers
        .resolve(&selector.model)
        .context("resolving selector model")?;
    Ok(Some(SelectorFactory {
        provider,
        model_id,
        settings: SelectorSettings::default(),
    }))
}

async fn run_terminal(config: Config, agent: String, user: String) -> Result<()> {
    let providers = build_providers(&config);
    let agents = build_agent_registry(&config, providers.clone()).await?;
    let users = Arc::new(UserRegistry::open(config.users_path()).await?);
    let permissions = Arc::new(PermissionStore::open(config.permissions_path()).await?);
    let handler: Arc<dyn RequestHandler> =
        Arc::new(ConsoleHandler::new(config.console.upper_bound));

    let mut manager = SessionManager::new(config.sessions_path(), agents, handler)
        .with_user_registry(users.clone())
        .with_permission_store(permissions);
    if let Some(selector) = build_selector(&config, &providers)? {
        manager = manager.with_selector(selector);
    }
    let manager = Arc::new(manager);

    // console sessions authenticate interactively before the loop starts
    let password = prompt_password(&user)?;
    if !users.authenticate(&user, &password).await {
        anyhow::bail!("authentication failed for user \"{user}\"");
    }

    let gateway = TerminalGateway::start(manager, agent, user);
    gateway
        .session()
        .sync(Duration::from_secs(config.sync_interval_secs));
    gateway.run().await?;
    gateway.session().shutdown();
    Ok(())
}

fn prompt_password(user: &str) -> Result<String> {
    let password = Password::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Password for {user}"))
        .allow_empty_password(false)
        .interact()?;
    Ok(password)
}

async fn run_server(config: Config, addr: Option<String>) -> Result<()> {
    let users = Arc::new(UserRegistry::open(config.users_path()).await?);
    let server = RequestServer::new(users);
    let addr = addr.unwrap_or(config.server.addr);
    server.serve(&addr).await
}

async fn register_user(
    config: Config,
    name: String,
    password: String,
    profile: Option<PathBuf>,
) -> Result<()> {
    let profile = match profile {
        Some(path) => {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            serde_json::from_str::<UserProfile>(&contents)?
        }
        None => UserProfile::default(),
    };

    let users = UserRegistry::open(config.users_path()).await?;
    let user = User {
        name: name.clone(),
        secrets: profile.secrets,
        mappings: profile.mappings,
    };
    users.register(user, &password).await?;
    println!("registered user {name}");
    Ok(())
}

async fn add_agent(
    config: Config,
    name: String,
    description: String,
    model: String,
    instructions: String,
    handoff: bool,
) -> Result<()> {
    let providers = build_providers(&config);
    let agents = build_agent_registry(&config, providers).await?;
    agents
        .add_config(AgentConfig {
            name: name.clone(),
            description,
            handoff,
            settings: AgentSettings {
                model,
                instructions,
                max_tokens: 1024,
                tools: vec![],
                tool_configs: HashMap::new(),
            },
        })
        .await?;
    println!("registered agent {name}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Run { agent, user } => run_terminal(config, agent, user).await,
        Commands::Serve { addr } => run_server(config, addr).await,
        Commands::RegisterUser {
            name,
            password,
            profile,
        } => register_user(config, name, password, profile).await,
        Commands::AddAgent {
            name,
            description,
            model,
            instructions,
            handoff,
        } => add_agent(config, name, description, model, instructions, handoff).await,
    }
}
