use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single entry in a session's message log.
///
/// `receiver` is `None` for broadcast messages. `id` is the gateway-assigned
/// deduplication token; system-originated messages carry no id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: String,
    pub receiver: Option<String>,
    pub text: String,
    #[serde(default)]
    pub handoffs: Option<HashMap<String, String>>,
    #[serde(default)]
    pub id: Option<String>,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        receiver: Option<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver,
            text: text.into(),
            handoffs: None,
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A read-only snapshot of another session's messages, loaded as context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub session_id: String,
    pub messages: Vec<Message>,
}

/// A query addressed to an agent, with optional context threads resolved
/// from `thread:<id>` references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub query: String,
    pub sender: String,
    #[serde(default)]
    pub threads: Vec<Thread>,
    #[serde(default)]
    pub id: Option<String>,
}

impl AgentRequest {
    pub fn new(query: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            sender: sender.into(),
            threads: Vec::new(),
            id: None,
        }
    }

    pub fn with_threads(mut self, threads: Vec<Thread>) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// An agent's reply. `final=false` marks a streaming partial; `handoffs`
/// maps agent names to follow-up queries issued within the same session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub text: String,
    #[serde(rename = "final")]
    pub is_final: bool,
    #[serde(default)]
    pub handoffs: HashMap<String, String>,
}

impl AgentResponse {
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            handoffs: HashMap::new(),
        }
    }
}

/// How long a tool-use decision is remembered. Wire values 0..=3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PermissionLevel {
    Deny = 0,
    Once = 1,
    Session = 2,
    Always = 3,
}

impl PermissionLevel {
    /// Levels that survive the current prompt and are persisted.
    pub fn persistent(self) -> bool {
        matches!(self, Self::Session | Self::Always)
    }

    pub fn granted(self) -> bool {
        self != Self::Deny
    }
}

impl From<PermissionLevel> for u8 {
    fn from(level: PermissionLevel) -> u8 {
        level as u8
    }
}

impl TryFrom<u8> for PermissionLevel {
    type Error = InvalidPermissionLevel;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Deny),
            1 => Ok(Self::Once),
            2 => Ok(Self::Session),
            3 => Ok(Self::Always),
            other => Err(InvalidPermissionLevel(other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid permission level {0}, expected 0..=3")]
pub struct InvalidPermissionLevel(pub u8);

/// Answer to an agent-selection confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationResponse {
    pub confirmed: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

impl ConfirmationResponse {
    pub fn confirmed() -> Self {
        Self {
            confirmed: true,
            comment: None,
        }
    }

    pub fn rejected(comment: Option<String>) -> Self {
        Self {
            confirmed: false,
            comment,
        }
    }
}

/// Per-worker slice of the persisted session document: the pending update
/// buffer plus the agent's opaque history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub updates: Vec<Message>,
    pub history: serde_json::Value,
}

/// The persisted session document, one JSON file per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub messages: Vec<Message>,
    pub agents: HashMap<String, WorkerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_serde_roundtrip() {
        let msg = Message {
            sender: "alice".into(),
            receiver: Some("bot".into()),
            text: "hello".into(),
            handoffs: Some(HashMap::from([("search".into(), "find X".into())])),
            id: Some("m1".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let de: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(de, msg);
    }

    #[test]
    fn message_backward_compat_defaults() {
        let old_json = r#"{"sender": "alice", "receiver": null, "text": "hi"}"#;
        let msg: Message = serde_json::from_str(old_json).unwrap();
        assert_eq!(msg.handoffs, None);
        assert_eq!(msg.id, None);
    }

    #[test]
    fn agent_response_final_field_name() {
        let resp = AgentResponse::final_text("done");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["final"], serde_json::Value::Bool(true));

        let de: AgentResponse = serde_json::from_value(json).unwrap();
        assert!(de.is_final);
    }

    #[test]
    fn permission_level_wire_values() {
        for (level, wire) in [
            (PermissionLevel::Deny, 0u8),
            (PermissionLevel::Once, 1),
            (PermissionLevel::Session, 2),
            (PermissionLevel::Always, 3),
        ] {
            let json = serde_json::to_string(&level).unwrap();
            assert_eq!(json, wire.to_string());
            let de: PermissionLevel = serde_json::from_str(&json).unwrap();
            assert_eq!(de, level);
        }
        assert!(serde_json::from_str::<PermissionLevel>("4").is_err());
    }

    #[test]
    fn permission_level_persistence() {
        assert!(!PermissionLevel::Deny.persistent());
        assert!(!PermissionLevel::Once.persistent());
        assert!(PermissionLevel::Session.persistent());
        assert!(PermissionLevel::Always.persistent());
    }

    #[test]
    fn session_state_roundtrip_without_selector() {
        let state = SessionState {
            messages: vec![Message::new("alice", None, "hi")],
            agents: HashMap::from([(
                "bot".to_string(),
                WorkerState {
                    updates: vec![],
                    history: serde_json::json!([{"role": "user", "content": "hi"}]),
                },
            )]),
            selector: None,
        };
        let json = serde_json::to_string_pretty(&state).unwrap();
        assert!(!json.contains("selector"));
        let de: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(de, state);
    }
}
