//! Websocket client for the remote request channel: logs in, mirrors each
//! incoming request to a local handler, and returns the matching response
//! envelope. Requests are processed strictly in arrival order.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use futures_util::{SinkExt, StreamExt};
use parley_agent::{ConfirmationRequest, FeedbackRequest, PermissionRequest};
use parley_schema::PermissionLevel;
use parley_user::RequestHandler;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::frames::{ClientFrame, ServerFrame};

pub struct RequestClient {
    handler: Arc<dyn RequestHandler>,
    server_url: String,
    worker: Option<JoinHandle<()>>,
}

impl RequestClient {
    /// `server_url` is the ws base, e.g. `ws://localhost:8623`.
    pub fn new(handler: Arc<dyn RequestHandler>, server_url: impl Into<String>) -> Self {
        Self {
            handler,
            server_url: server_url.into(),
            worker: None,
        }
    }

    /// Connect and log in. On success a background task serves requests
    /// until the connection closes.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<bool> {
        let url = format!("{}/ws/{}", self.server_url, username);
        let (ws, _) = connect_async(&url).await?;
        let (mut sink, mut stream) = ws.split();

        let login = serde_json::to_string(&ClientFrame::Login {
            username: username.to_string(),
            password: password.to_string(),
        })?;
        sink.send(WsMessage::Text(login.into())).await?;

        let reply = loop {
            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    break serde_json::from_str::<ServerFrame>(text.as_str())?
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
                None => bail!("connection closed before login response"),
            }
        };
        match reply {
            ServerFrame::LoginResponse { success: true, .. } => {}
            ServerFrame::LoginResponse {
                success: false,
                message,
            } => {
                tracing::warn!(
                    "login failed: {}",
                    message.as_deref().unwrap_or("unknown error")
                );
                return Ok(false);
            }
            other => bail!("expected login response, got {other:?}"),
        }

        let handler = self.handler.clone();
        let username = username.to_string();
        self.worker = Some(tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let frame = match message {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<ServerFrame>(text.as_str()) {
                            Ok(frame) => frame,
                            Err(err) => {
                                tracing::warn!("dropping malformed server frame: {err}");
                                continue;
                            }
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                if let Some(response) = serve_request(&handler, &username, frame).await {
                    let Ok(json) = serde_json::to_string(&response) else {
                        continue;
                    };
                    if sink.send(WsMessage::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        }));
        Ok(true)
    }

    /// Wait until the server closes the connection.
    pub async fn join(&mut self) -> Result<()> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| anyhow!("not authenticated"))?;
        worker.await?;
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

impl Drop for RequestClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Rebuild the request object locally, let the handler answer it, and wrap
/// the answer in the matching response envelope.
async fn serve_request(
    handler: &Arc<dyn RequestHandler>,
    username: &str,
    frame: ServerFrame,
) -> Option<ClientFrame> {
    match frame {
        ServerFrame::PermissionRequest {
            request_id,
            tool_name,
            tool_args,
            tool_kwargs,
            sender,
            session_id,
        } => {
            let (request, response) = PermissionRequest::new(tool_name, tool_args, tool_kwargs);
            handler
                .handle_permission_request(request, &sender, username, &session_id)
                .await;
            let granted = response.await.unwrap_or(PermissionLevel::Deny);
            Some(ClientFrame::PermissionResponse {
                request_id,
                granted: granted.into(),
            })
        }
        ServerFrame::FeedbackRequest {
            request_id,
            question,
            sender,
            session_id,
        } => {
            let (request, response) = FeedbackRequest::new(question);
            handler
                .handle_feedback_request(request, &sender, username, &session_id)
                .await;
            let text = response.await.unwrap_or_default();
            Some(ClientFrame::FeedbackResponse { request_id, text })
        }
        ServerFrame::ConfirmationRequest {
            request_id,
            query,
            thoughts,
            agent_name,
            sender,
            session_id,
        } => {
            let (request, response) = ConfirmationRequest::new(agent_name, query, thoughts);
            handler
                .handle_confirmation_request(request, &sender, username, &session_id)
                .await;
            match response.await {
                Ok(confirmation) => Some(ClientFrame::ConfirmationResponse {
                    request_id,
                    confirmed: confirmation.confirmed,
                    comment: confirmation.comment,
                }),
                Err(_) => Some(ClientFrame::ConfirmationResponse {
                    request_id,
                    confirmed: false,
                    comment: None,
                }),
            }
        }
        ServerFrame::LoginResponse { .. } => None,
    }
}
