pub mod manager;
pub mod session;
mod worker;

use async_trait::async_trait;
use parley_schema::AgentResponse;

pub use manager::{SelectorFactory, SessionManager};
pub use session::Session;

/// The narrow contract the core uses to reach back into a transport.
/// Sessions hold gateways weakly; ownership flows down from the process
/// root that owns the manager and all gateways.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// UI hint: the selector started working on a message.
    async fn handle_selector_activation(&self, _message_id: &str, _session_id: &str) {}

    /// UI hint: an agent invocation was enqueued for a message.
    async fn handle_agent_activation(&self, _message_id: &str, _session_id: &str) {}

    /// Emit an outbound response on the transport.
    async fn handle_agent_response(
        &self,
        response: &AgentResponse,
        sender: &str,
        receiver: &str,
        session_id: &str,
    );
}
