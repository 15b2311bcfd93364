//! Factory, loader, and persistence boundary for sessions. One manager per
//! process; it shares the registry, user registry, permission store, and
//! request handler across all sessions.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use parley_agent::{AgentRegistry, AgentSelector, SelectorSettings};
use parley_provider::LlmProvider;
use parley_schema::{SessionState, Thread};
use parley_user::{PermissionStore, RequestHandler, UserRegistry};
use tokio::sync::Mutex;

use crate::session::Session;

/// How sessions build their selector: a resolved provider plus settings.
pub struct SelectorFactory {
    pub provider: Arc<dyn LlmProvider>,
    pub model_id: String,
    pub settings: SelectorSettings,
}

pub struct SessionManager {
    root_dir: PathBuf,
    agent_registry: Arc<AgentRegistry>,
    user_registry: Option<Arc<UserRegistry>>,
    permission_store: Option<Arc<PermissionStore>>,
    request_handler: Arc<dyn RequestHandler>,
    selector: Option<SelectorFactory>,
    save_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(
        root_dir: impl Into<PathBuf>,
        agent_registry: Arc<AgentRegistry>,
        request_handler: Arc<dyn RequestHandler>,
    ) -> Self {
        Self {
            root_dir: root_dir.into(),
            agent_registry,
            user_registry: None,
            permission_store: None,
            request_handler,
            selector: None,
            save_lock: Mutex::new(()),
        }
    }

    pub fn with_user_registry(mut self, registry: Arc<UserRegistry>) -> Self {
        self.user_registry = Some(registry);
        self
    }

    pub fn with_permission_store(mut self, store: Arc<PermissionStore>) -> Self {
        self.permission_store = Some(store);
        self
    }

    pub fn with_selector(mut self, factory: SelectorFactory) -> Self {
        self.selector = Some(factory);
        self
    }

    pub fn agent_registry(&self) -> &Arc<AgentRegistry> {
        &self.agent_registry
    }

    pub(crate) fn user_registry(&self) -> Option<Arc<UserRegistry>> {
        self.user_registry.clone()
    }

    pub(crate) fn permission_store(&self) -> Option<Arc<PermissionStore>> {
        self.permission_store.clone()
    }

    pub(crate) fn request_handler(&self) -> Arc<dyn RequestHandler> {
        self.request_handler.clone()
    }

    pub(crate) fn build_selector(&self) -> Option<AgentSelector> {
        self.selector.as_ref().map(|factory| {
            AgentSelector::new(
                self.agent_registry.clone(),
                factory.provider.clone(),
                factory.model_id.clone(),
                factory.settings.clone(),
            )
        })
    }

    /// Build a fresh session bound to this manager.
    pub fn create_session(self: &Arc<Self>, id: Option<String>) -> Arc<Session> {
        Session::new(id, self)
    }

    /// Reconstruct a session from its persisted state. Missing or unreadable
    /// state is treated as no session.
    pub async fn load_session(self: &Arc<Self>, id: &str) -> Result<Option<Arc<Session>>> {
        if !self.session_saved(id).await {
            return Ok(None);
        }
        let state = match self.load_session_state(id).await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!("failed to read session {id}, treating as missing: {err}");
                return Ok(None);
            }
        };
        let session = self.create_session(Some(id.to_string()));
        session.restore(state).await?;
        Ok(Some(session))
    }

    pub fn session_path(&self, id: &str) -> PathBuf {
        self.root_dir.join(format!("{id}.json"))
    }

    pub async fn session_saved(&self, id: &str) -> bool {
        tokio::fs::try_exists(self.session_path(id))
            .await
            .unwrap_or(false)
    }

    pub async fn save_session_state(&self, id: &str, state: &SessionState) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        tokio::fs::create_dir_all(&self.root_dir).await?;
        let contents = serde_json::to_string_pretty(state)?;
        tokio::fs::write(self.session_path(id), contents).await?;
        Ok(())
    }

    pub async fn load_session_state(&self, id: &str) -> Result<SessionState> {
        let contents = tokio::fs::read_to_string(self.session_path(id)).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Load another session's messages as a read-only context thread.
    pub async fn load_thread(&self, id: &str) -> Result<Thread> {
        let state = self.load_session_state(id).await?;
        Ok(Thread {
            session_id: id.to_string(),
            messages: state.messages,
        })
    }

    /// Resolve thread references in input order, silently skipping ids with
    /// no persisted session.
    pub async fn load_threads(&self, ids: &[String]) -> Vec<Thread> {
        let mut threads = Vec::new();
        for id in ids {
            if !self.session_saved(id).await {
                continue;
            }
            match self.load_thread(id).await {
                Ok(thread) => threads.push(thread),
                Err(err) => tracing::warn!("failed to load thread {id}: {err}"),
            }
        }
        threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_agent::{ConfirmationRequest, FeedbackRequest, PermissionRequest, ToolBinder};
    use parley_provider::ProviderRegistry;
    use parley_schema::Message;
    use std::collections::HashMap;

    struct NullHandler;

    #[async_trait]
    impl RequestHandler for NullHandler {
        async fn handle_permission_request(
            &self,
            request: PermissionRequest,
            _sender: &str,
            _receiver: &str,
            _session_id: &str,
        ) {
            request.deny();
        }

        async fn handle_feedback_request(
            &self,
            request: FeedbackRequest,
            _sender: &str,
            _receiver: &str,
            _session_id: &str,
        ) {
            request.respond("");
        }

        async fn handle_confirmation_request(
            &self,
            request: ConfirmationRequest,
            _sender: &str,
            _receiver: &str,
            _session_id: &str,
        ) {
            request.reject(None);
        }
    }

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
            Arc::new(NullHandler),
        ))
    }

    fn state_with_messages(messages: Vec<Message>) -> SessionState {
        SessionState {
            messages,
            agents: HashMap::new(),
            selector: None,
        }
    }

    #[tokio::test]
    async fn save_load_roundtrip_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir).await;

        let state = state_with_messages(vec![
            Message::new("alice", Some("bot".into()), "hello").with_id("m1"),
            Message::new("bot", Some("alice".into()), "hi"),
        ]);
        mgr.save_session_state("s1", &state).await.unwrap();
        let loaded = mgr.load_session_state("s1").await.unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn load_session_returns_none_for_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir).await;
        assert!(mgr.load_session("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_session_restores_messages() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir).await;

        let state = state_with_messages(vec![Message::new("alice", None, "hi").with_id("m1")]);
        mgr.save_session_state("s1", &state).await.unwrap();

        let session = mgr.load_session("s1").await.unwrap().unwrap();
        assert_eq!(session.messages().await, state.messages);
        assert!(session.contains("m1").await);
    }

    #[tokio::test]
    async fn unreadable_state_treated_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir).await;
        tokio::fs::create_dir_all(dir.path().join("sessions"))
            .await
            .unwrap();
        tokio::fs::write(mgr.session_path("broken"), "{not json")
            .await
            .unwrap();
        assert!(mgr.load_session("broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_threads_skips_unknown_and_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir).await;

        mgr.save_session_state("a", &state_with_messages(vec![Message::new("u", None, "1")]))
            .await
            .unwrap();
        mgr.save_session_state("b", &state_with_messages(vec![Message::new("u", None, "2")]))
            .await
            .unwrap();

        let threads = mgr
            .load_threads(&["b".into(), "ghost".into(), "a".into()])
            .await;
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].session_id, "b");
        assert_eq!(threads[1].session_id, "a");
    }
}
