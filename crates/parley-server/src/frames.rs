//! Wire envelopes for the remote request channel. Every non-login frame
//! carries `type` and `request_id`; unknown frames fail to parse and are
//! dropped with a warning.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Login {
        username: String,
        password: String,
    },
    PermissionResponse {
        request_id: String,
        granted: u8,
    },
    FeedbackResponse {
        request_id: String,
        text: String,
    },
    ConfirmationResponse {
        request_id: String,
        confirmed: bool,
        #[serde(default)]
        comment: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    LoginResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    PermissionRequest {
        request_id: String,
        tool_name: String,
        tool_args: Vec<serde_json::Value>,
        tool_kwargs: serde_json::Map<String, serde_json::Value>,
        sender: String,
        session_id: String,
    },
    FeedbackRequest {
        request_id: String,
        question: String,
        sender: String,
        session_id: String,
    },
    ConfirmationRequest {
        request_id: String,
        query: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        thoughts: Vec<String>,
        agent_name: String,
        sender: String,
        session_id: String,
    },
}
