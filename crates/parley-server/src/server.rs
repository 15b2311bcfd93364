//! Websocket server delivering permission/feedback/confirmation requests to
//! remote users. One socket per authenticated user; the first client frame
//! must be a login. Offline receivers get automatic responses so the
//! message path never blocks.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use parley_agent::{ConfirmationRequest, FeedbackRequest, PermissionRequest};
use parley_schema::{ConfirmationResponse, PermissionLevel};
use parley_user::{RequestHandler, UserRegistry};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::frames::{ClientFrame, ServerFrame};

enum PendingRequest {
    Permission(PermissionRequest),
    Feedback(FeedbackRequest),
    Confirmation(ConfirmationRequest),
}

struct ServerState {
    users: Arc<UserRegistry>,
    connections: Mutex<HashMap<String, mpsc::UnboundedSender<ServerFrame>>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

#[derive(Clone)]
pub struct RequestServer {
    state: Arc<ServerState>,
}

impl RequestServer {
    pub fn new(users: Arc<UserRegistry>) -> Self {
        Self {
            state: Arc::new(ServerState {
                users,
                connections: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws/{username}", get(ws_handler))
            .with_state(self.state.clone())
    }

    pub async fn serve(&self, addr: &str) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("request channel listening on {addr}");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    pub async fn connected(&self, username: &str) -> bool {
        self.state.connections.lock().await.contains_key(username)
    }

    async fn send_to(&self, username: &str, frame: ServerFrame) -> bool {
        let connections = self.state.connections.lock().await;
        match connections.get(username) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl RequestHandler for RequestServer {
    async fn handle_permission_request(
        &self,
        request: PermissionRequest,
        sender: &str,
        receiver: &str,
        session_id: &str,
    ) {
        if !self.connected(receiver).await {
            request.deny();
            return;
        }

        let request_id = Uuid::new_v4().to_string();
        let frame = ServerFrame::PermissionRequest {
            request_id: request_id.clone(),
            tool_name: request.tool_name.clone(),
            tool_args: request.tool_args.clone(),
            tool_kwargs: request.tool_kwargs.clone(),
            sender: sender.to_string(),
            session_id: session_id.to_string(),
        };
        self.state
            .pending
            .lock()
            .await
            .insert(request_id, PendingRequest::Permission(request));
        self.send_to(receiver, frame).await;
    }

    async fn handle_feedback_request(
        &self,
        request: FeedbackRequest,
        sender: &str,
        receiver: &str,
        session_id: &str,
    ) {
        if !self.connected(receiver).await {
            request.respond("");
            return;
        }

        let request_id = Uuid::new_v4().to_string();
        let frame = ServerFrame::FeedbackRequest {
            request_id: request_id.clone(),
            question: request.question.clone(),
            sender: sender.to_string(),
            session_id: session_id.to_string(),
        };
        self.state
            .pending
            .lock()
            .await
            .insert(request_id, PendingRequest::Feedback(request));
        self.send_to(receiver, frame).await;
    }

    async fn handle_confirmation_request(
        &self,
        request: ConfirmationRequest,
        sender: &str,
        receiver: &str,
        session_id: &str,
    ) {
        if !self.connected(receiver).await {
            request.reject(Some("User not connected".into()));
            return;
        }

        let request_id = Uuid::new_v4().to_string();
        let frame = ServerFrame::ConfirmationRequest {
            request_id: request_id.clone(),
            query: request.query.clone(),
            thoughts: request.thoughts.clone(),
            agent_name: request.agent_name.clone(),
            sender: sender.to_string(),
            session_id: session_id.to_string(),
        };
        self.state
            .pending
            .lock()
            .await
            .insert(request_id, PendingRequest::Confirmation(request));
        self.send_to(receiver, frame).await;
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(username): Path<String>,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, username, state))
}

async fn handle_socket(socket: WebSocket, username: String, state: Arc<ServerState>) {
    let (mut sink, mut stream) = socket.split();

    let login_reply = |success: bool, message: &str| ServerFrame::LoginResponse {
        success,
        message: Some(message.to_string()),
    };

    // the first frame must authenticate the user
    let login = match recv_frame(&mut stream).await {
        Some(ClientFrame::Login { username: _, password }) => password,
        Some(_) | None => {
            send_frame(&mut sink, &login_reply(false, "First message must be login")).await;
            return;
        }
    };

    if !state.users.authenticate(&username, &login).await {
        send_frame(&mut sink, &login_reply(false, "Authentication failed")).await;
        return;
    }

    let (tx, mut outbound) = mpsc::unbounded_channel();
    {
        let mut connections = state.connections.lock().await;
        if connections.contains_key(&username) {
            drop(connections);
            send_frame(&mut sink, &login_reply(false, "User already connected")).await;
            return;
        }
        connections.insert(username.clone(), tx);
    }
    send_frame(&mut sink, &login_reply(true, "Authenticated successfully")).await;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if !send_frame(&mut sink, &frame).await {
                    break;
                }
            }
            frame = recv_frame(&mut stream) => {
                let Some(frame) = frame else { break };
                handle_response(&state, frame).await;
            }
        }
    }

    state.connections.lock().await.remove(&username);
    state.users.deauthenticate(&username);
    tracing::debug!("user {username} disconnected");
}

async fn handle_response(state: &Arc<ServerState>, frame: ClientFrame) {
    let request_id = match &frame {
        ClientFrame::PermissionResponse { request_id, .. }
        | ClientFrame::FeedbackResponse { request_id, .. }
        | ClientFrame::ConfirmationResponse { request_id, .. } => request_id.clone(),
        ClientFrame::Login { .. } => return,
    };

    let Some(pending) = state.pending.lock().await.remove(&request_id) else {
        tracing::warn!("response for unknown request id {request_id}");
        return;
    };

    match (pending, frame) {
        (
            PendingRequest::Permission(request),
            ClientFrame::PermissionResponse { granted, .. },
        ) => {
            let level = PermissionLevel::try_from(granted).unwrap_or(PermissionLevel::Deny);
            request.respond(level);
        }
        (PendingRequest::Feedback(request), ClientFrame::FeedbackResponse { text, .. }) => {
            request.respond(text);
        }
        (
            PendingRequest::Confirmation(request),
            ClientFrame::ConfirmationResponse {
                confirmed, comment, ..
            },
        ) => {
            request.respond(ConfirmationResponse { confirmed, comment });
        }
        (_, frame) => {
            tracing::warn!("response frame does not match pending request kind: {frame:?}");
        }
    }
}

async fn recv_frame(
    stream: &mut futures_util::stream::SplitStream<WebSocket>,
) -> Option<ClientFrame> {
    loop {
        match stream.next().await? {
            Ok(WsMessage::Text(text)) => match serde_json::from_str(text.as_str()) {
                Ok(frame) => return Some(frame),
                Err(err) => {
                    tracing::warn!("dropping malformed client frame: {err}");
                }
            },
            Ok(WsMessage::Close(_)) => return None,
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}

async fn send_frame(
    sink: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
    frame: &ServerFrame,
) -> bool {
    let Ok(json) = serde_json::to_string(frame) else {
        return false;
    };
    sink.send(WsMessage::Text(json.into())).await.is_ok()
}
