//! The conversational state machine: owns the message log and the worker
//! set, arbitrates human-in-the-loop requests, and routes unaddressed
//! messages through the selector.
//!
//! Callers (gateways) serialize `update`/`invoke` per session; internal
//! state sits behind its own mutexes so detached selection tasks and worker
//! dispatches re-enter safely.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use parley_agent::{
    Agent, AgentSelector, ConfirmationRequest, FeedbackRequest, PermissionRequest,
};
use parley_schema::{
    AgentRequest, AgentResponse, ConfirmationResponse, Message, PermissionLevel, SessionState,
};
use parley_user::{PermissionStore, RequestHandler, UserRegistry};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::manager::SessionManager;
use crate::worker::AgentWorker;
use crate::Gateway;

struct MessageLog {
    messages: Vec<Message>,
    seen_ids: HashSet<String>,
}

pub struct Session {
    id: String,
    manager: Weak<SessionManager>,
    user_registry: Option<Arc<UserRegistry>>,
    permission_store: Option<Arc<PermissionStore>>,
    request_handler: Arc<dyn RequestHandler>,
    gateway: std::sync::RwLock<Option<Weak<dyn Gateway>>>,
    log: Mutex<MessageLog>,
    workers: Mutex<HashMap<String, AgentWorker>>,
    selector: Option<Mutex<AgentSelector>>,
    cancel: CancellationToken,
    sync_started: std::sync::atomic::AtomicBool,
}

impl Session {
    pub(crate) fn new(id: Option<String>, manager: &Arc<SessionManager>) -> Arc<Self> {
        let selector = manager
            .build_selector()
            .map(Mutex::new);
        Arc::new(Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            manager: Arc::downgrade(manager),
            user_registry: manager.user_registry(),
            permission_store: manager.permission_store(),
            request_handler: manager.request_handler(),
            gateway: std::sync::RwLock::new(None),
            log: Mutex::new(MessageLog {
                messages: Vec::new(),
                seen_ids: HashSet::new(),
            }),
            workers: Mutex::new(HashMap::new()),
            selector,
            cancel: CancellationToken::new(),
            sync_started: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_gateway(&self, gateway: &Arc<dyn Gateway>) {
        *self.gateway.write().expect("gateway lock") = Some(Arc::downgrade(gateway));
    }

    fn gateway(&self) -> Option<Arc<dyn Gateway>> {
        self.gateway
            .read()
            .expect("gateway lock")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.log.lock().await.messages.clone()
    }

    /// Membership test on gateway-assigned message ids.
    pub async fn contains(&self, id: &str) -> bool {
        self.log.lock().await.seen_ids.contains(id)
    }

    /// Names addressable in this session: loaded workers plus everything
    /// the registry can hydrate.
    pub async fn agent_names(&self) -> HashSet<String> {
        let mut names: HashSet<String> =
            self.workers.lock().await.keys().cloned().collect();
        if let Some(manager) = self.manager.upgrade() {
            names.extend(manager.agent_registry().registered_names().await);
        }
        names
    }

    /// Add an agent to the session; its worker is seeded with the current
    /// message log.
    pub async fn add_agent(self: &Arc<Self>, agent: Box<dyn Agent>) {
        let seed = self.log.lock().await.messages.clone();
        let worker = AgentWorker::spawn(
            agent,
            seed,
            Arc::downgrade(self),
            self.cancel.child_token(),
        );
        self.workers
            .lock()
            .await
            .insert(worker.name().to_string(), worker);
    }

    /// Append a message to the log (ignoring ids already seen), fan it out
    /// to every worker not involved in it, and kick off selection.
    ///
    /// Boxed because `update` and `select`/`invoke` call each other
    /// (directly and via a spawned task); rustc cannot resolve the `Send`
    /// auto-trait for that mutually-recursive `async fn` cycle, so the
    /// future is erased here to break it.
    pub fn update(
        self: &Arc<Self>,
        message: Message,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            {
                let mut log = self.log.lock().await;
                if let Some(id) = &message.id {
                    if !log.seen_ids.insert(id.clone()) {
                        tracing::debug!("ignoring duplicate message id {id}");
                        return;
                    }
                }
                log.messages.push(message.clone());
            }

            {
                let workers = self.workers.lock().await;
                for (name, worker) in workers.iter() {
                    if *name != message.sender && Some(name) != message.receiver.as_ref() {
                        worker.update(message.clone());
                    }
                }
            }

            if self.selector.is_some() {
                let session = Arc::downgrade(self);
                tokio::spawn(async move {
                    let Some(session) = session.upgrade() else {
                        return;
                    };
                    if let Err(err) = session.select(&message).await {
                        tracing::warn!("selection failed: {err}");
                    }
                });
            }
        })
    }

    /// Dispatch a request to an agent. Authentication failures and unknown
    /// agents turn into system responses, never errors.
    pub async fn invoke(self: &Arc<Self>, request: AgentRequest, receiver: &str) {
        if !self.user_authenticated(&request.sender) {
            self.handle_system_response(
                format!("User \"{}\" is not authenticated", request.sender),
                &request.sender,
            )
            .await;
            return;
        }

        if !self.workers.lock().await.contains_key(receiver) {
            self.load_agent(receiver).await;
        }

        let enqueued = {
            let workers = self.workers.lock().await;
            match workers.get(receiver) {
                Some(worker) => {
                    let secrets = self.user_secrets(&request.sender);
                    worker.invoke(request.clone(), secrets);
                    true
                }
                None => false,
            }
        };

        if enqueued {
            if let (Some(id), Some(gateway)) = (&request.id, self.gateway()) {
                gateway.handle_agent_activation(id, &self.id).await;
            }
            let message = Message {
                sender: request.sender.clone(),
                receiver: Some(receiver.to_string()),
                text: request.query.clone(),
                handoffs: None,
                id: request.id.clone(),
            };
            self.update(message).await;
        } else {
            // detached so the gateway is never blocked on its own callback
            let session = self.clone();
            let sender = request.sender.clone();
            let receiver = receiver.to_string();
            tokio::spawn(async move {
                session
                    .handle_system_response(
                        format!("Agent \"{receiver}\" does not exist"),
                        &sender,
                    )
                    .await;
            });
        }
    }

    /// Route one agent response: log it, fan out its handoffs as new
    /// invocations, and emit it on the gateway.
    pub(crate) async fn handle_agent_response(
        self: &Arc<Self>,
        response: AgentResponse,
        sender: &str,
        receiver: &str,
    ) {
        let message = Message {
            sender: sender.to_string(),
            receiver: Some(receiver.to_string()),
            text: response.text.clone(),
            handoffs: if response.handoffs.is_empty() {
                None
            } else {
                Some(response.handoffs.clone())
            },
            id: None,
        };
        self.update(message).await;

        for (agent, query) in &response.handoffs {
            self.invoke(
                AgentRequest::new(query.clone(), receiver.to_string()),
                agent,
            )
            .await;
        }

        if let Some(gateway) = self.gateway() {
            gateway
                .handle_agent_response(&response, sender, receiver, &self.id)
                .await;
        }
    }

    /// Arbitrate a tool-permission request: a remembered decision answers
    /// immediately; otherwise the user decides and durable levels persist.
    pub(crate) async fn handle_permission_request(
        &self,
        request: PermissionRequest,
        sender: &str,
        receiver: &str,
    ) {
        if let Some(store) = &self.permission_store {
            if let Some(level) = store
                .get_permission(&request.tool_name, receiver, &self.id)
                .await
            {
                request.respond(level);
                return;
            }
        }

        let (proxy, response) = PermissionRequest::new(
            request.tool_name.clone(),
            request.tool_args.clone(),
            request.tool_kwargs.clone(),
        );
        self.request_handler
            .handle_permission_request(proxy, sender, receiver, &self.id)
            .await;
        let level = response.await.unwrap_or(PermissionLevel::Deny);

        if level.persistent() {
            if let Some(store) = &self.permission_store {
                if let Err(err) = store
                    .set_permission(&request.tool_name, receiver, &self.id, level)
                    .await
                {
                    tracing::warn!("failed to persist permission: {err}");
                }
            }
        }
        request.respond(level);
    }

    pub(crate) async fn handle_feedback_request(
        &self,
        request: FeedbackRequest,
        sender: &str,
        receiver: &str,
    ) {
        self.request_handler
            .handle_feedback_request(request, sender, receiver, &self.id)
            .await;
    }

    pub(crate) async fn handle_system_response(&self, text: String, receiver: &str) {
        if let Some(gateway) = self.gateway() {
            gateway
                .handle_agent_response(
                    &AgentResponse::final_text(text),
                    "system",
                    receiver,
                    &self.id,
                )
                .await;
        }
    }

    /// The selection subprocess spawned for every update. Messages that are
    /// intrinsically not up for routing only extend the selector's
    /// transcript; the rest may produce a confirmed invocation.
    async fn select(self: &Arc<Self>, message: &Message) -> Result<()> {
        let Some(selector) = &self.selector else {
            return Ok(());
        };

        let agent_names = self.agent_names().await;
        let receiver_is_agent = message
            .receiver
            .as_ref()
            .is_some_and(|r| agent_names.contains(r));
        if message.sender == "system"
            || agent_names.contains(&message.sender)
            || receiver_is_agent
        {
            selector.lock().await.add(message).await;
            return Ok(());
        }

        if let (Some(id), Some(gateway)) = (&message.id, self.gateway()) {
            gateway.handle_selector_activation(id, &self.id).await;
        }

        let selection = selector.lock().await.run(message).await?;

        let Some(agent_name) = selection
            .agent_name
            .filter(|name| agent_names.contains(name))
        else {
            return Ok(());
        };
        let Some(query) = selection.query.filter(|q| !q.is_empty()) else {
            return Ok(());
        };

        let (request, response) = ConfirmationRequest::new(
            &agent_name,
            &query,
            selection.reasoning.into_iter().collect(),
        );
        self.request_handler
            .handle_confirmation_request(request, &agent_name, &message.sender, &self.id)
            .await;
        let confirmation = response
            .await
            .unwrap_or_else(|_| ConfirmationResponse::rejected(None));
        if !confirmation.confirmed {
            return Ok(());
        }

        self.invoke(
            AgentRequest::new(query, message.sender.clone()),
            &agent_name,
        )
        .await;
        Ok(())
    }

    async fn load_agent(self: &Arc<Self>, name: &str) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        match manager.agent_registry().create_agent(name).await {
            Ok(agent) => self.add_agent(agent).await,
            Err(err) => tracing::debug!("could not load agent {name}: {err}"),
        }
    }

    fn user_authenticated(&self, username: &str) -> bool {
        match &self.user_registry {
            Some(registry) => registry.authenticated(username),
            None => true,
        }
    }

    fn user_secrets(&self, username: &str) -> HashMap<String, String> {
        match &self.user_registry {
            Some(registry) => registry.get_secrets(username).unwrap_or_default(),
            None => std::env::vars().collect(),
        }
    }

    /// Snapshot `{messages, agents, selector}` for persistence. Worker
    /// handles are collected first so a running agent never blocks the
    /// message path while its state is read.
    pub async fn state(&self) -> SessionState {
        let messages = self.log.lock().await.messages.clone();

        let handles: Vec<_> = {
            let workers = self.workers.lock().await;
            workers
                .iter()
                .map(|(name, worker)| (name.clone(), worker.state_handles()))
                .collect()
        };
        let mut agents = HashMap::new();
        for (name, handles) in handles {
            agents.insert(name, handles.snapshot().await);
        }

        let selector = match &self.selector {
            Some(selector) => Some(selector.lock().await.get_state()),
            None => None,
        };

        SessionState {
            messages,
            agents,
            selector,
        }
    }

    /// Restore a persisted state document: messages, then workers hydrated
    /// by name from the registry, then the selector.
    pub(crate) async fn restore(self: &Arc<Self>, state: SessionState) -> Result<()> {
        {
            let mut log = self.log.lock().await;
            log.seen_ids = state
                .messages
                .iter()
                .filter_map(|m| m.id.clone())
                .collect();
            log.messages = state.messages;
        }

        for (name, worker_state) in state.agents {
            if !self.workers.lock().await.contains_key(&name) {
                self.load_agent(&name).await;
            }
            let workers = self.workers.lock().await;
            match workers.get(&name) {
                Some(worker) => worker.set_state(worker_state).await?,
                None => tracing::warn!("agent {name} in saved session is unknown, dropping"),
            }
        }

        if let (Some(selector), Some(state)) = (&self.selector, state.selector) {
            selector.lock().await.set_state(state)?;
        }
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| anyhow!("session manager dropped"))?;
        let state = self.state().await;
        manager.save_session_state(&self.id, &state).await
    }

    /// Start the background checkpoint loop: one immediate write if no
    /// state exists yet, then one per interval. Idempotent.
    pub fn sync(self: &Arc<Self>, interval: Duration) {
        if self
            .sync_started
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        let session = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Some(session) = session.upgrade() {
                if let Some(manager) = session.manager.upgrade() {
                    if !manager.session_saved(&session.id).await {
                        if let Err(err) = session.save().await {
                            tracing::warn!("session save failed: {err}");
                        }
                    }
                }
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(session) = session.upgrade() else {
                    break;
                };
                if let Err(err) = session.save().await {
                    tracing::warn!("session save failed, retrying next sync: {err}");
                }
            }
        });
    }

    /// Stop workers (between items) and the sync loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
