//! Interactive console gateway: one user, one session, leading mentions to
//! address agents, `thread:` references resolved as context.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use parley_core::{Gateway, Session, SessionManager};
use parley_schema::{AgentRequest, AgentResponse};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;

use crate::utils::{extract_initial_mention, extract_thread_references, format_response};

pub struct TerminalGateway {
    manager: Arc<SessionManager>,
    session: Arc<Session>,
    username: String,
    current_agent: Mutex<String>,
    idle: Notify,
}

impl TerminalGateway {
    /// Create the gateway with a fresh session bound to it.
    pub fn start(
        manager: Arc<SessionManager>,
        initial_agent: impl Into<String>,
        username: impl Into<String>,
    ) -> Arc<Self> {
        let session = manager.create_session(None);
        let gateway = Arc::new(Self {
            manager,
            session: session.clone(),
            username: username.into(),
            current_agent: Mutex::new(initial_agent.into()),
            idle: Notify::new(),
        });
        let as_gateway: Arc<dyn Gateway> = gateway.clone();
        session.set_gateway(&as_gateway);
        gateway
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn current_agent(&self) -> String {
        self.current_agent.lock().expect("current agent lock").clone()
    }

    /// Prompt-respond loop until the user types `exit`.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let current = self.current_agent();
            println!(
                "Message from {} to {current} (or @mention another agent):",
                self.username
            );
            let Some(line) = lines.next_line().await? else {
                break;
            };
            let line = line.trim().to_string();
            if line == "exit" {
                break;
            }
            if line.is_empty() {
                continue;
            }

            let (mention, body) = extract_initial_mention(&line);
            let receiver = mention.unwrap_or(current);
            let thread_refs = extract_thread_references(&body);
            let threads = self.manager.load_threads(&thread_refs).await;

            self.session
                .invoke(
                    AgentRequest::new(body, self.username.clone()).with_threads(threads),
                    &receiver,
                )
                .await;

            // wait for the turn to finish before prompting again
            self.idle.notified().await;
        }
        Ok(())
    }
}

#[async_trait]
impl Gateway for TerminalGateway {
    async fn handle_agent_response(
        &self,
        response: &AgentResponse,
        sender: &str,
        receiver: &str,
        _session_id: &str,
    ) {
        if sender != "system" {
            *self.current_agent.lock().expect("current agent lock") = sender.to_string();
        }
        let current = self.current_agent();
        println!("Message from {current} to {receiver}:");
        println!("{}", format_response(&response.text, &response.handoffs));

        // handoffs keep the turn going; the final plain response frees the prompt
        if response.handoffs.is_empty() {
            self.idle.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_agent::{AgentRegistry, ToolBinder};
    use parley_provider::ProviderRegistry;
    use parley_user::{ConsoleHandler, RequestHandler};
    use std::collections::HashMap;

    async fn manager(dir: &tempfile::TempDir) -> Arc<SessionManager> {
        let registry = AgentRegistry::open(
            dir.path().join("agents.json"),
            Arc::new(ProviderRegistry::new()),
            ToolBinder::new(),
        )
        .await
        .unwrap();
        Arc::new(SessionManager::new(
            dir.path().join("sessions"),
            Arc::new(registry),
            Arc::new(ConsoleHandler::default()) as Arc<dyn RequestHandler>,
        ))
    }

    #[tokio::test]
    async fn responses_move_the_current_agent() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = TerminalGateway::start(manager(&dir).await, "bot", "alice");
        assert_eq!(gateway.current_agent(), "bot");

        gateway
            .handle_agent_response(
                &AgentResponse::final_text("hi"),
                "search",
                "alice",
                "s1",
            )
            .await;
        assert_eq!(gateway.current_agent(), "search");

        // system responses keep the current agent
        gateway
            .handle_agent_response(
                &AgentResponse::final_text("nope"),
                "system",
                "alice",
                "s1",
            )
            .await;
        assert_eq!(gateway.current_agent(), "search");
    }

    #[tokio::test]
    async fn handoff_responses_do_not_release_the_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = TerminalGateway::start(manager(&dir).await, "bot", "alice");

        let with_handoffs = AgentResponse {
            text: "delegating".into(),
            is_final: true,
            handoffs: HashMap::from([("search".to_string(), "find X".to_string())]),
        };
        gateway
            .handle_agent_response(&with_handoffs, "bot", "alice", "s1")
            .await;
        // a plain final response afterwards releases the prompt exactly once
        gateway
            .handle_agent_response(&AgentResponse::final_text("done"), "search", "alice", "s1")
            .await;

        tokio::time::timeout(std::time::Duration::from_secs(1), gateway.idle.notified())
            .await
            .expect("prompt should be released by the final response");
    }
}
