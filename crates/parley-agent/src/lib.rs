pub mod prompt;
pub mod registry;
pub mod request;
pub mod selector;
pub mod substitution;
pub mod tool;

mod default;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parley_schema::{AgentRequest, AgentResponse, Message};
use tokio::sync::mpsc;

pub use default::{DefaultAgent, HandoffAgent};
pub use registry::{AgentConfig, AgentRegistry, AgentSettings, RegistryError};
pub use request::{ConfirmationRequest, FeedbackRequest, PermissionRequest};
pub use selector::{AgentSelection, AgentSelector, SelectorSettings};
pub use tool::{BoundTool, ToolBinder, ToolFn, ToolRef};

/// What an agent run yields: responses, permission requests, and feedback
/// requests, delivered through a channel per invocation. The consumer reads
/// until the channel closes.
#[derive(Debug)]
pub enum AgentEvent {
    Response(AgentResponse),
    Permission(PermissionRequest),
    Feedback(FeedbackRequest),
}

/// A named responder inside a session. `run` produces events on the given
/// channel; `get_state`/`set_state` round-trip the agent's opaque history
/// through the persisted session document.
#[async_trait]
pub trait Agent: Send {
    fn name(&self) -> &str;

    /// Acquire session-scoped resources. Called once by the worker before
    /// it processes any item.
    async fn begin_session(&mut self) -> Result<()> {
        Ok(())
    }

    /// Process one request. `updates` are the session messages the agent has
    /// not yet seen; `secrets` parameterize tool configuration for this
    /// request scope. Events must be emitted in the order they occur.
    async fn run(
        &mut self,
        request: AgentRequest,
        updates: Vec<Message>,
        secrets: HashMap<String, String>,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<()>;

    fn get_state(&self) -> serde_json::Value;

    fn set_state(&mut self, state: serde_json::Value) -> Result<()>;
}
