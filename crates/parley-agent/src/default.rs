//! Model-backed agents: `DefaultAgent` drives a permission-gated tool loop,
//! `HandoffAgent` additionally delegates follow-up queries to other agents.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parley_provider::{LlmMessage, LlmProvider, LlmRequest, Role, ToolCall, ToolSpec};
use parley_schema::{AgentRequest, AgentResponse, Message, PermissionLevel};
use tokio::sync::mpsc;

use crate::registry::AgentSettings;
use crate::request::{FeedbackRequest, PermissionRequest};
use crate::tool::BoundTool;
use crate::{prompt, substitution, Agent, AgentEvent};

/// Built-in tool that routes a question to the human instead of executing
/// anything. Handled before the permission gate.
pub const ASK_USER_TOOL: &str = "ask_user";

fn ask_user_spec() -> ToolSpec {
    ToolSpec {
        name: ASK_USER_TOOL.into(),
        description: "Ask the user a question and wait for their answer.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "question": {"type": "string", "description": "The question for the user."}
            },
            "required": ["question"]
        }),
    }
}

pub struct DefaultAgent {
    name: String,
    settings: AgentSettings,
    provider: Arc<dyn LlmProvider>,
    model_id: String,
    tools: Vec<BoundTool>,
    history: Vec<LlmMessage>,
}

impl DefaultAgent {
    pub fn new(
        name: impl Into<String>,
        settings: AgentSettings,
        provider: Arc<dyn LlmProvider>,
        model_id: impl Into<String>,
        tools: Vec<BoundTool>,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            provider,
            model_id: model_id.into(),
            tools,
            history: Vec::new(),
        }
    }

    /// Run the tool-calling loop for one formatted input and return the
    /// model's final text. Permission and feedback events go out through
    /// `events`; the loop suspends until each is answered.
    async fn run_turn(
        &mut self,
        input: String,
        secrets: &HashMap<String, String>,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<String> {
        let vars = substitution::merged_vars(secrets);
        let configs = substitution::resolve_config(&self.settings.tool_configs, &vars);

        let mut specs: Vec<ToolSpec> = self.tools.iter().map(|t| t.spec.clone()).collect();
        specs.push(ask_user_spec());

        self.history.push(LlmMessage::user(input));

        loop {
            let response = self
                .provider
                .chat(LlmRequest {
                    model: self.model_id.clone(),
                    system: Some(self.settings.instructions.clone()),
                    messages: self.history.clone(),
                    max_tokens: self.settings.max_tokens,
                    tools: specs.clone(),
                })
                .await?;

            self.history.push(LlmMessage {
                role: Role::Assistant,
                content: response.text.clone(),
                tool_call_id: None,
                tool_calls: response.tool_calls.clone(),
            });

            if response.tool_calls.is_empty() {
                return Ok(response.text);
            }

            for call in response.tool_calls {
                let result = self.handle_tool_call(&call, &configs, events).await?;
                self.history.push(LlmMessage::tool_result(call.id, result));
            }
        }
    }

    async fn handle_tool_call(
        &self,
        call: &ToolCall,
        configs: &HashMap<String, serde_json::Value>,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<String> {
        if call.name == ASK_USER_TOOL {
            let question = call.arguments["question"].as_str().unwrap_or_default();
            let (request, rx) = FeedbackRequest::new(question);
            events
                .send(AgentEvent::Feedback(request))
                .await
                .map_err(|_| anyhow!("event channel closed"))?;
            return Ok(rx.await.unwrap_or_default());
        }

        let kwargs = call.arguments.as_object().cloned().unwrap_or_default();
        let (request, rx) = PermissionRequest::new(&call.name, Vec::new(), kwargs);
        events
            .send(AgentEvent::Permission(request))
            .await
            .map_err(|_| anyhow!("event channel closed"))?;
        let level = rx.await.unwrap_or(PermissionLevel::Deny);
        if !level.granted() {
            return Ok(format!("Permission to call {} was denied", call.name));
        }

        let Some(tool) = self.tools.iter().find(|t| t.spec.name == call.name) else {
            return Ok(format!("Tool {} is not available", call.name));
        };
        let config = configs
            .get(&call.name)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        match (tool.func)(call.arguments.clone(), config).await {
            Ok(serde_json::Value::String(text)) => Ok(text),
            Ok(value) => Ok(value.to_string()),
            Err(err) => Ok(format!("Tool {} failed: {err}", call.name)),
        }
    }

    fn state(&self) -> serde_json::Value {
        serde_json::to_value(&self.history).unwrap_or(serde_json::Value::Null)
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<()> {
        self.history = serde_json::from_value(state)?;
        Ok(())
    }
}

#[async_trait]
impl Agent for DefaultAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &mut self,
        request: AgentRequest,
        updates: Vec<Message>,
        secrets: HashMap<String, String>,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<()> {
        let receiver = self.name.clone();
        let input = prompt::format_input(&request, &receiver, &updates, &request.threads);
        let text = self.run_turn(input, &secrets, &events).await?;
        events
            .send(AgentEvent::Response(AgentResponse::final_text(text)))
            .await
            .map_err(|_| anyhow!("event channel closed"))?;
        Ok(())
    }

    fn get_state(&self) -> serde_json::Value {
        self.state()
    }

    fn set_state(&mut self, state: serde_json::Value) -> Result<()> {
        self.restore(state)
    }
}

const HANDOFF_INSTRUCTIONS: &str = "\n\nWhen another agent should continue with a follow-up task, \
end your reply with a line `Handoffs:` followed by one line per delegation in the form \
`@agent-name: follow-up query`. Omit the block entirely when no delegation is needed.";

pub struct HandoffAgent {
    inner: DefaultAgent,
}

impl HandoffAgent {
    pub fn new(
        name: impl Into<String>,
        mut settings: AgentSettings,
        provider: Arc<dyn LlmProvider>,
        model_id: impl Into<String>,
        tools: Vec<BoundTool>,
    ) -> Self {
        settings.instructions.push_str(HANDOFF_INSTRUCTIONS);
        Self {
            inner: DefaultAgent::new(name, settings, provider, model_id, tools),
        }
    }
}

/// Split a model reply into its body and a trailing `Handoffs:` block of
/// `@agent: query` lines.
pub fn parse_handoffs(text: &str) -> (String, HashMap<String, String>) {
    let Some(marker) = text.rfind("\nHandoffs:") else {
        return (text.to_string(), HashMap::new());
    };

    let (body, block) = text.split_at(marker);
    let mut handoffs = HashMap::new();
    for line in block.lines().skip(1) {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('@') else {
            continue;
        };
        if let Some((agent, query)) = rest.split_once(':') {
            let (agent, query) = (agent.trim(), query.trim());
            if !agent.is_empty() && !query.is_empty() {
                handoffs.insert(agent.to_string(), query.to_string());
            }
        }
    }

    if handoffs.is_empty() {
        (text.to_string(), handoffs)
    } else {
        (body.trim_end().to_string(), handoffs)
    }
}

#[async_trait]
impl Agent for HandoffAgent {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(
        &mut self,
        request: AgentRequest,
        updates: Vec<Message>,
        secrets: HashMap<String, String>,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<()> {
        let receiver = self.inner.name.clone();
        let input = prompt::format_input(&request, &receiver, &updates, &request.threads);
        let text = self.inner.run_turn(input, &secrets, &events).await?;
        let (body, handoffs) = parse_handoffs(&text);
        events
            .send(AgentEvent::Response(AgentResponse {
                text: body,
                is_final: true,
                handoffs,
            }))
            .await
            .map_err(|_| anyhow!("event channel closed"))?;
        Ok(())
    }

    fn get_state(&self) -> serde_json::Value {
        self.inner.state()
    }

    fn set_state(&mut self, state: serde_json::Value) -> Result<()> {
        self.inner.restore(state)
    }
}
