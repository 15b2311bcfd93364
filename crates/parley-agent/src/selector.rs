//! LLM-backed router for unaddressed messages. Keeps its own conversation
//! history so routing context accumulates across turns; the history is the
//! selector's opaque state and round-trips through the session document.

use std::sync::Arc;

use anyhow::Result;
use parley_provider::{LlmMessage, LlmProvider, LlmRequest, Role, ToolCall};
use parley_schema::Message;
use serde::{Deserialize, Serialize};

use crate::prompt::format_message;
use crate::registry::AgentRegistry;

pub const SELECTOR_INSTRUCTIONS: &str = "\
You route messages in a group conversation between humans and agents. \
For each message, decide whether one of the registered agents should answer it. \
Select an agent only when the message clearly calls for that agent's capabilities; \
casual conversation between humans selects no one. \
Reply with a single JSON object and nothing else: \
{\"agent_name\": <name or null>, \"query\": <rephrased query for the agent or null>, \
\"reasoning\": <one short sentence>}. \
The registered agents and their capabilities are listed in the catalog tool result.";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSelection {
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SelectorSettings {
    pub model: String,
    pub instructions: String,
    pub max_tokens: u32,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            instructions: SELECTOR_INSTRUCTIONS.to_string(),
            max_tokens: 512,
        }
    }
}

pub struct AgentSelector {
    registry: Arc<AgentRegistry>,
    provider: Arc<dyn LlmProvider>,
    model_id: String,
    settings: SelectorSettings,
    history: Vec<LlmMessage>,
}

impl AgentSelector {
    pub fn new(
        registry: Arc<AgentRegistry>,
        provider: Arc<dyn LlmProvider>,
        model_id: impl Into<String>,
        settings: SelectorSettings,
    ) -> Self {
        Self {
            registry,
            provider,
            model_id: model_id.into(),
            settings,
            history: Vec::new(),
        }
    }

    /// Record a message without selecting. Used for messages that are not up
    /// for routing (system, agent-to-user, user-to-agent).
    pub async fn add(&mut self, message: &Message) {
        self.seed_if_empty().await;
        self.history.push(LlmMessage::user(format_message(message)));
        self.push_empty_selection();
    }

    /// Record the message, ask the model, record its trace, and return the
    /// parsed selection. A malformed reply yields an empty selection.
    pub async fn run(&mut self, message: &Message) -> Result<AgentSelection> {
        self.seed_if_empty().await;
        self.history.push(LlmMessage::user(format_message(message)));

        let response = self
            .provider
            .chat(LlmRequest {
                model: self.model_id.clone(),
                system: None,
                messages: self.history.clone(),
                max_tokens: self.settings.max_tokens,
                tools: vec![],
            })
            .await?;

        self.history.push(LlmMessage::assistant(&response.text));
        Ok(parse_selection(&response.text))
    }

    pub fn get_state(&self) -> serde_json::Value {
        serde_json::to_value(&self.history).unwrap_or(serde_json::Value::Null)
    }

    pub fn set_state(&mut self, state: serde_json::Value) -> Result<()> {
        self.history = serde_json::from_value(state)?;
        Ok(())
    }

    /// First touch seeds the system instructions and a synthetic catalog
    /// lookup, so the model can route without a live round-trip per turn.
    async fn seed_if_empty(&mut self) {
        if !self.history.is_empty() {
            return;
        }
        self.history
            .push(LlmMessage::system(&self.settings.instructions));

        let descriptions = self.registry.descriptions().await;
        let mut catalog: Vec<String> = descriptions
            .iter()
            .map(|(name, description)| format!("{name}: {description}"))
            .collect();
        catalog.sort();

        self.history.push(LlmMessage {
            role: Role::Assistant,
            content: String::new(),
            tool_call_id: None,
            tool_calls: vec![ToolCall {
                id: "catalog".into(),
                name: "get_registered_agents".into(),
                arguments: serde_json::json!({}),
            }],
        });
        self.history
            .push(LlmMessage::tool_result("catalog", catalog.join("\n")));
    }

    /// A declined routing turn is still visible to the model as an explicit
    /// empty selection.
    fn push_empty_selection(&mut self) {
        self.history.push(LlmMessage::assistant(
            r#"{"agent_name": null, "query": null, "reasoning": null}"#,
        ));
    }
}

fn parse_selection(text: &str) -> AgentSelection {
    let trimmed = strip_code_fence(text.trim());
    match serde_json::from_str(trimmed) {
        Ok(selection) => selection,
        Err(err) => {
            tracing::warn!("selector returned unparseable selection: {err}");
            AgentSelection::default()
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches('\n')
        .trim_end_matches('`')
        .trim_end_matches('\n')
        .trim()
}
