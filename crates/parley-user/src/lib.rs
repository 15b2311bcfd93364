pub mod handler;
pub mod permission;
pub mod preferences;
pub mod registry;

use std::collections::HashMap;

pub use handler::{ConsoleHandler, RequestHandler};
pub use permission::PermissionStore;
pub use preferences::PreferencesStore;
pub use registry::UserRegistry;

#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("user \"{0}\" already exists")]
    AlreadyExists(String),
    #[error("user \"{0}\" is not authenticated")]
    NotAuthenticated(String),
    #[error("secret \"{key}\" not found for user \"{user}\"")]
    SecretNotFound { user: String, key: String },
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// A hub user: secrets are plaintext only in memory while authenticated;
/// mappings translate gateway usernames to this system username.
#[derive(Debug, Clone, Default)]
pub struct User {
    pub name: String,
    pub secrets: HashMap<String, String>,
    pub mappings: HashMap<String, String>,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(key.into(), value.into());
        self
    }

    pub fn with_mapping(mut self, gateway: impl Into<String>, username: impl Into<String>) -> Self {
        self.mappings.insert(gateway.into(), username.into());
        self
    }
}
