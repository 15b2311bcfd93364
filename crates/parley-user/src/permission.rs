//! Persisted tool-permission decisions. Only levels 2 (session) and 3
//! (always) are stored; a permanent entry shadows any session-scoped one.

use std::path::{Path, PathBuf};

use anyhow::Result;
use parley_schema::PermissionLevel;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PermissionEntry {
    tool_name: String,
    username: String,
    /// `None` denotes the permanent scope.
    session_id: Option<String>,
    permission: PermissionLevel,
}

pub struct PermissionStore {
    path: PathBuf,
    entries: Mutex<Vec<PermissionEntry>>,
}

impl PermissionStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if !contents.is_empty() => serde_json::from_str(&contents)?,
            _ => Vec::new(),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Permanent entry first, then the session-scoped one, else none.
    pub async fn get_permission(
        &self,
        tool_name: &str,
        username: &str,
        session_id: &str,
    ) -> Option<PermissionLevel> {
        let entries = self.entries.lock().await;
        let permanent = entries.iter().find(|e| {
            e.tool_name == tool_name && e.username == username && e.session_id.is_none()
        });
        if let Some(entry) = permanent {
            return Some(entry.permission);
        }
        entries
            .iter()
            .find(|e| {
                e.tool_name == tool_name
                    && e.username == username
                    && e.session_id.as_deref() == Some(session_id)
            })
            .map(|e| e.permission)
    }

    /// Persist a decision. Level 3 sweeps every existing row for the
    /// (tool, user) pair; level 2 upserts on (tool, user, session); levels
    /// 0 and 1 are no-ops so they never shadow existing decisions.
    pub async fn set_permission(
        &self,
        tool_name: &str,
        username: &str,
        session_id: &str,
        permission: PermissionLevel,
    ) -> Result<()> {
        if !permission.persistent() {
            return Ok(());
        }

        let mut entries = self.entries.lock().await;
        match permission {
            PermissionLevel::Always => {
                entries.retain(|e| !(e.tool_name == tool_name && e.username == username));
                entries.push(PermissionEntry {
                    tool_name: tool_name.to_string(),
                    username: username.to_string(),
                    session_id: None,
                    permission,
                });
            }
            PermissionLevel::Session => {
                let existing = entries.iter_mut().find(|e| {
                    e.tool_name == tool_name
                        && e.username == username
                        && e.session_id.as_deref() == Some(session_id)
                });
                match existing {
                    Some(entry) => entry.permission = permission,
                    None => entries.push(PermissionEntry {
                        tool_name: tool_name.to_string(),
                        username: username.to_string(),
                        session_id: Some(session_id.to_string()),
                        permission,
                    }),
                }
            }
            _ => unreachable!("persistent() gates levels 0 and 1"),
        }

        let contents = serde_json::to_string_pretty(&*entries)?;
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }
}
