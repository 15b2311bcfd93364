//! One-shot request objects passed from agents to the human in the loop.
//! Each carries its payload plus a single-use completion slot; responding
//! consumes the request, so double responses are impossible by construction.

use parley_schema::{ConfirmationResponse, PermissionLevel};
use tokio::sync::oneshot;

/// A tool call awaiting the user's permission decision.
#[derive(Debug)]
pub struct PermissionRequest {
    pub tool_name: String,
    pub tool_args: Vec<serde_json::Value>,
    pub tool_kwargs: serde_json::Map<String, serde_json::Value>,
    responder: oneshot::Sender<PermissionLevel>,
}

impl PermissionRequest {
    pub fn new(
        tool_name: impl Into<String>,
        tool_args: Vec<serde_json::Value>,
        tool_kwargs: serde_json::Map<String, serde_json::Value>,
    ) -> (Self, oneshot::Receiver<PermissionLevel>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tool_name: tool_name.into(),
                tool_args,
                tool_kwargs,
                responder: tx,
            },
            rx,
        )
    }

    /// Render the pending call as `tool(arg, key=value)` for display.
    pub fn call(&self) -> String {
        let args = self.tool_args.iter().map(|a| a.to_string());
        let kwargs = self
            .tool_kwargs
            .iter()
            .map(|(k, v)| format!("{k}={v}"));
        let all: Vec<String> = args.chain(kwargs).collect();
        format!("{}({})", self.tool_name, all.join(", "))
    }

    pub fn respond(self, level: PermissionLevel) {
        let _ = self.responder.send(level);
    }

    pub fn deny(self) {
        self.respond(PermissionLevel::Deny);
    }

    pub fn grant_once(self) {
        self.respond(PermissionLevel::Once);
    }

    pub fn grant_session(self) {
        self.respond(PermissionLevel::Session);
    }

    pub fn grant_always(self) {
        self.respond(PermissionLevel::Always);
    }
}

/// A question from an agent awaiting free-text user feedback.
#[derive(Debug)]
pub struct FeedbackRequest {
    pub question: String,
    responder: oneshot::Sender<String>,
}

impl FeedbackRequest {
    pub fn new(question: impl Into<String>) -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                question: question.into(),
                responder: tx,
            },
            rx,
        )
    }

    pub fn respond(self, text: impl Into<String>) {
        let _ = self.responder.send(text.into());
    }
}

/// A proposed agent selection awaiting the user's go-ahead.
#[derive(Debug)]
pub struct ConfirmationRequest {
    pub agent_name: String,
    pub query: String,
    pub thoughts: Vec<String>,
    responder: oneshot::Sender<ConfirmationResponse>,
}

impl ConfirmationRequest {
    pub fn new(
        agent_name: impl Into<String>,
        query: impl Into<String>,
        thoughts: Vec<String>,
    ) -> (Self, oneshot::Receiver<ConfirmationResponse>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                agent_name: agent_name.into(),
                query: query.into(),
                thoughts,
                responder: tx,
            },
            rx,
        )
    }

    pub fn respond(self, response: ConfirmationResponse) {
        let _ = self.responder.send(response);
    }

    pub fn confirm(self) {
        self.respond(ConfirmationResponse::confirmed());
    }

    pub fn reject(self, comment: Option<String>) {
        self.respond(ConfirmationResponse::rejected(comment));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permission_request_resolves_once() {
        let (req, rx) = PermissionRequest::new("shell", vec![], serde_json::Map::new());
        req.grant_session();
        assert_eq!(rx.await.unwrap(), PermissionLevel::Session);
    }

    #[tokio::test]
    async fn dropped_request_closes_receiver() {
        let (req, rx) = FeedbackRequest::new("why?");
        drop(req);
        assert!(rx.await.is_err());
    }

    #[test]
    fn call_renders_args_and_kwargs() {
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("path".into(), serde_json::json!("/tmp/x"));
        let (req, _rx) =
            PermissionRequest::new("read_file", vec![serde_json::json!(1)], kwargs);
        assert_eq!(req.call(), r#"read_file(1, path="/tmp/x")"#);
    }

    #[tokio::test]
    async fn confirmation_carries_comment() {
        let (req, rx) = ConfirmationRequest::new("search", "find X", vec!["seems apt".into()]);
        req.reject(Some("not now".into()));
        let resp = rx.await.unwrap();
        assert!(!resp.confirmed);
        assert_eq!(resp.comment.as_deref(), Some("not now"));
    }
}
