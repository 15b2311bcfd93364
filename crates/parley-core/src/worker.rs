//! The per-agent actor inside a session. One task per agent serializes its
//! updates and invocations; independent agents progress in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parley_agent::{Agent, AgentEvent};
use parley_schema::{AgentRequest, AgentResponse, Message, WorkerState};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::session::Session;

enum WorkItem {
    Update(Message),
    Invoke(AgentRequest, HashMap<String, String>),
}

pub(crate) struct AgentWorker {
    name: String,
    queue: mpsc::UnboundedSender<WorkItem>,
    updates: Arc<Mutex<Vec<Message>>>,
    agent: Arc<Mutex<Box<dyn Agent>>>,
}

impl AgentWorker {
    /// Start the worker task. `seed` is a copy of the session's message log
    /// at creation, so a late-joining agent sees prior context.
    pub fn spawn(
        agent: Box<dyn Agent>,
        seed: Vec<Message>,
        session: Weak<Session>,
        cancel: CancellationToken,
    ) -> Self {
        let name = agent.name().to_string();
        let updates = Arc::new(Mutex::new(seed));
        let agent = Arc::new(Mutex::new(agent));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker_loop(
            name.clone(),
            agent.clone(),
            updates.clone(),
            rx,
            session,
            cancel,
        ));
        Self {
            name,
            queue: tx,
            updates,
            agent,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn update(&self, message: Message) {
        let _ = self.queue.send(WorkItem::Update(message));
    }

    pub fn invoke(&self, request: AgentRequest, secrets: HashMap<String, String>) {
        let _ = self.queue.send(WorkItem::Invoke(request, secrets));
    }

    /// Cloneable handles for state snapshots, so callers can release the
    /// worker map before waiting on a possibly-running agent.
    pub fn state_handles(&self) -> StateHandles {
        StateHandles {
            updates: self.updates.clone(),
            agent: self.agent.clone(),
        }
    }

    pub async fn set_state(&self, state: WorkerState) -> anyhow::Result<()> {
        *self.updates.lock().await = state.updates;
        self.agent.lock().await.set_state(state.history)
    }
}

pub(crate) struct StateHandles {
    updates: Arc<Mutex<Vec<Message>>>,
    agent: Arc<Mutex<Box<dyn Agent>>>,
}

impl StateHandles {
    pub async fn snapshot(&self) -> WorkerState {
        let updates = self.updates.lock().await.clone();
        let history = self.agent.lock().await.get_state();
        WorkerState { updates, history }
    }
}

async fn worker_loop(
    name: String,
    agent: Arc<Mutex<Box<dyn Agent>>>,
    updates: Arc<Mutex<Vec<Message>>>,
    mut queue: mpsc::UnboundedReceiver<WorkItem>,
    session: Weak<Session>,
    cancel: CancellationToken,
) {
    {
        let mut agent = agent.lock().await;
        if let Err(err) = agent.begin_session().await {
            tracing::warn!("agent {name} session setup failed: {err}");
        }
    }

    loop {
        // cancellation lands between items, never mid-invocation
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = queue.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        match item {
            WorkItem::Update(message) => {
                updates.lock().await.push(message);
            }
            WorkItem::Invoke(request, secrets) => {
                let Some(session) = session.upgrade() else {
                    break;
                };
                let sender = request.sender.clone();
                let pending = updates.lock().await.clone();

                let (events_tx, mut events_rx) = mpsc::channel(16);
                let result = {
                    let mut agent_guard = agent.lock().await;
                    let run = agent_guard.run(request, pending, secrets, events_tx);

                    let dispatch = async {
                        while let Some(event) = events_rx.recv().await {
                            match event {
                                AgentEvent::Response(response) => {
                                    session
                                        .handle_agent_response(response, &name, &sender)
                                        .await;
                                }
                                AgentEvent::Permission(request) => {
                                    session
                                        .handle_permission_request(request, &name, &sender)
                                        .await;
                                }
                                AgentEvent::Feedback(request) => {
                                    session
                                        .handle_feedback_request(request, &name, &sender)
                                        .await;
                                }
                            }
                        }
                    };

                    let (result, ()) = tokio::join!(run, dispatch);
                    result
                };

                if let Err(err) = result {
                    tracing::warn!("agent {name} run failed: {err}");
                    session
                        .handle_agent_response(
                            AgentResponse::final_text(format!("Agent \"{name}\" failed: {err}")),
                            &name,
                            &sender,
                        )
                        .await;
                }

                // the agent's own history now covers these messages
                updates.lock().await.clear();
            }
        }
    }
}
