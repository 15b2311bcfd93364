//! Free-text user preferences, persisted as one JSON object keyed by
//! username.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::sync::Mutex;

pub struct PreferencesStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PreferencesStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub async fn get_preferences(&self, username: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        let data = self.read_data().await?;
        Ok(data.get(username).cloned())
    }

    pub async fn set_preferences(&self, username: &str, preferences: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut data = self.read_data().await?;
        data.insert(username.to_string(), preferences.to_string());
        let contents = serde_json::to_string_pretty(&data)?;
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }

    async fn read_data(&self) -> Result<HashMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if !contents.is_empty() => Ok(serde_json::from_str(&contents)?),
            _ => Ok(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_and_get_preferences() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferencesStore::open(dir.path().join("preferences.json"))
            .await
            .unwrap();

        assert_eq!(store.get_preferences("alice").await.unwrap(), None);
        store
            .set_preferences("alice", "terse answers, metric units")
            .await
            .unwrap();
        assert_eq!(
            store.get_preferences("alice").await.unwrap().as_deref(),
            Some("terse answers, metric units")
        );
    }

    #[tokio::test]
    async fn preferences_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preferences.json");
        {
            let store = PreferencesStore::open(&path).await.unwrap();
            store.set_preferences("bob", "verbose").await.unwrap();
        }
        let reopened = PreferencesStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get_preferences("bob").await.unwrap().as_deref(),
            Some("verbose")
        );
    }
}
