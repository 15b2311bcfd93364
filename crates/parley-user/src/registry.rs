//! User registry with encrypted per-user secrets. Passwords are bcrypt
//! hashed; each secret is AES-256-GCM encrypted under a PBKDF2-HMAC-SHA256
//! key derived from the user's password, stored as base64(salt||nonce||ct).
//! The persisted file never contains plaintext.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::{User, UserError};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const PBKDF2_ROUNDS: u32 = 100_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    name: String,
    password_hash: String,
    encrypted_secrets: HashMap<String, String>,
    #[serde(default)]
    mappings: HashMap<String, String>,
}

struct AuthedUser {
    user: User,
    /// Retained so secret updates can re-encrypt with a fresh key derived
    /// from the currently-authenticated password. Never persisted.
    password: String,
}

pub struct UserRegistry {
    path: PathBuf,
    records: Mutex<Vec<UserRecord>>,
    authed: std::sync::Mutex<HashMap<String, AuthedUser>>,
}

impl UserRegistry {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, UserError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if !contents.is_empty() => serde_json::from_str(&contents)?,
            _ => Vec::new(),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
            authed: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Register a new user. The password hashes and encrypts; it is not kept.
    pub async fn register(&self, user: User, password: &str) -> Result<(), UserError> {
        {
            let records = self.records.lock().await;
            if records.iter().any(|r| r.name == user.name) {
                return Err(UserError::AlreadyExists(user.name));
            }
        }
        self.save_user(&user, password).await
    }

    async fn save_user(&self, user: &User, password: &str) -> Result<(), UserError> {
        let password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| UserError::Crypto(e.to_string()))?;

        let mut encrypted_secrets = HashMap::new();
        for (name, value) in &user.secrets {
            encrypted_secrets.insert(name.clone(), encrypt_secret(password, value)?);
        }

        let record = UserRecord {
            name: user.name.clone(),
            password_hash: BASE64.encode(password_hash.as_bytes()),
            encrypted_secrets,
            mappings: user.mappings.clone(),
        };

        let mut records = self.records.lock().await;
        if let Some(existing) = records.iter_mut().find(|r| r.name == user.name) {
            *existing = record;
        } else {
            records.push(record);
        }
        self.persist(&records).await
    }

    /// Verify the password and decrypt all secrets into memory. Any
    /// decryption failure fails the whole authentication, leaving no
    /// partial state.
    pub async fn authenticate(&self, username: &str, password: &str) -> bool {
        let record = {
            let records = self.records.lock().await;
            match records.iter().find(|r| r.name == username) {
                Some(record) => record.clone(),
                None => return false,
            }
        };

        let hash_bytes = match BASE64.decode(&record.password_hash) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let hash = match String::from_utf8(hash_bytes) {
            Ok(hash) => hash,
            Err(_) => return false,
        };
        if !bcrypt::verify(password, &hash).unwrap_or(false) {
            return false;
        }

        let mut secrets = HashMap::new();
        for (name, payload) in &record.encrypted_secrets {
            match decrypt_secret(password, payload) {
                Ok(value) => {
                    secrets.insert(name.clone(), value);
                }
                Err(err) => {
                    tracing::warn!("failed to decrypt secret {name} for {username}: {err}");
                    return false;
                }
            }
        }

        let user = User {
            name: username.to_string(),
            secrets,
            mappings: record.mappings.clone(),
        };
        self.authed.lock().expect("authed lock").insert(
            username.to_string(),
            AuthedUser {
                user,
                password: password.to_string(),
            },
        );
        true
    }

    pub fn authenticated(&self, username: &str) -> bool {
        self.authed.lock().expect("authed lock").contains_key(username)
    }

    /// Drop the in-memory plaintext for a user.
    pub fn deauthenticate(&self, username: &str) -> bool {
        self.authed
            .lock()
            .expect("authed lock")
            .remove(username)
            .is_some()
    }

    pub fn get_secrets(&self, username: &str) -> Result<HashMap<String, String>, UserError> {
        let authed = self.authed.lock().expect("authed lock");
        authed
            .get(username)
            .map(|a| a.user.secrets.clone())
            .ok_or_else(|| UserError::NotAuthenticated(username.to_string()))
    }

    pub fn get_secret(&self, username: &str, key: &str) -> Result<String, UserError> {
        let secrets = self.get_secrets(username)?;
        secrets
            .get(key)
            .cloned()
            .ok_or_else(|| UserError::SecretNotFound {
                user: username.to_string(),
                key: key.to_string(),
            })
    }

    /// Update a secret in memory and re-encrypt everything with a fresh key
    /// derived from the currently-authenticated password.
    pub async fn set_secret(
        &self,
        username: &str,
        key: &str,
        value: &str,
    ) -> Result<(), UserError> {
        let (user, password) = {
            let mut authed = self.authed.lock().expect("authed lock");
            let entry = authed
                .get_mut(username)
                .ok_or_else(|| UserError::NotAuthenticated(username.to_string()))?;
            entry.user.secrets.insert(key.to_string(), value.to_string());
            (entry.user.clone(), entry.password.clone())
        };
        self.save_user(&user, &password).await
    }

    pub async fn delete_secret(&self, username: &str, key: &str) -> Result<(), UserError> {
        let (user, password) = {
            let mut authed = self.authed.lock().expect("authed lock");
            let entry = authed
                .get_mut(username)
                .ok_or_else(|| UserError::NotAuthenticated(username.to_string()))?;
            if entry.user.secrets.remove(key).is_none() {
                return Err(UserError::SecretNotFound {
                    user: username.to_string(),
                    key: key.to_string(),
                });
            }
            (entry.user.clone(), entry.password.clone())
        };
        self.save_user(&user, &password).await
    }

    /// Inverted mapping `gateway_username -> system_username` for all users
    /// declaring the given gateway.
    pub async fn get_mappings(&self, gateway: &str) -> HashMap<String, String> {
        let records = self.records.lock().await;
        records
            .iter()
            .filter_map(|record| {
                record
                    .mappings
                    .get(gateway)
                    .map(|gateway_username| (gateway_username.clone(), record.name.clone()))
            })
            .collect()
    }

    async fn persist(&self, records: &[UserRecord]) -> Result<(), UserError> {
        let contents = serde_json::to_string_pretty(records)?;
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

fn encrypt_secret(password: &str, value: &str) -> Result<String, UserError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), value.as_bytes())
        .map_err(|e| UserError::Crypto(e.to_string()))?;

    let mut payload = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(payload))
}

fn decrypt_secret(password: &str, payload: &str) -> Result<String, UserError> {
    let bytes = BASE64
        .decode(payload)
        .map_err(|e| UserError::Crypto(e.to_string()))?;
    if bytes.len() < SALT_LEN + NONCE_LEN {
        return Err(UserError::Crypto("payload too short".into()));
    }
    let (salt, rest) = bytes.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(password, salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| UserError::Crypto(e.to_string()))?;
    String::from_utf8(plaintext).map_err(|e| UserError::Crypto(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry(dir: &tempfile::TempDir) -> UserRegistry {
        UserRegistry::open(dir.path().join("users.json"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn register_authenticate_and_read_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;

        let user = User::new("alice")
            .with_secret("API_TOKEN", "tok-123")
            .with_secret("DB_URL", "postgres://local");
        reg.register(user, "hunter2").await.unwrap();

        assert!(reg.authenticate("alice", "hunter2").await);
        assert_eq!(reg.get_secret("alice", "API_TOKEN").unwrap(), "tok-123");
        assert_eq!(reg.get_secrets("alice").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn wrong_password_fails_without_partial_state() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        reg.register(User::new("alice").with_secret("k", "v"), "hunter2")
            .await
            .unwrap();

        assert!(!reg.authenticate("alice", "wrong").await);
        assert!(!reg.authenticated("alice"));
        assert!(matches!(
            reg.get_secret("alice", "k"),
            Err(UserError::NotAuthenticated(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        reg.register(User::new("alice"), "pw").await.unwrap();
        let err = reg.register(User::new("alice"), "pw2").await.unwrap_err();
        assert!(matches!(err, UserError::AlreadyExists(name) if name == "alice"));
    }

    #[tokio::test]
    async fn persisted_file_contains_no_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let reg = UserRegistry::open(&path).await.unwrap();
        reg.register(
            User::new("alice").with_secret("API_TOKEN", "super-secret-value"),
            "hunter2",
        )
        .await
        .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!contents.contains("super-secret-value"));
        assert!(!contents.contains("hunter2"));
    }

    #[tokio::test]
    async fn set_secret_reencrypts_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        {
            let reg = UserRegistry::open(&path).await.unwrap();
            reg.register(User::new("alice").with_secret("k", "v1"), "pw")
                .await
                .unwrap();
            assert!(reg.authenticate("alice", "pw").await);
            reg.set_secret("alice", "k", "v2").await.unwrap();
            reg.set_secret("alice", "extra", "v3").await.unwrap();
        }

        let reopened = UserRegistry::open(&path).await.unwrap();
        assert!(reopened.authenticate("alice", "pw").await);
        assert_eq!(reopened.get_secret("alice", "k").unwrap(), "v2");
        assert_eq!(reopened.get_secret("alice", "extra").unwrap(), "v3");
    }

    #[tokio::test]
    async fn delete_secret_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        reg.register(User::new("alice").with_secret("k", "v"), "pw")
            .await
            .unwrap();
        assert!(reg.authenticate("alice", "pw").await);

        reg.delete_secret("alice", "k").await.unwrap();
        assert!(matches!(
            reg.get_secret("alice", "k"),
            Err(UserError::SecretNotFound { .. })
        ));
        assert!(matches!(
            reg.delete_secret("alice", "k").await,
            Err(UserError::SecretNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn deauthenticate_drops_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        reg.register(User::new("alice").with_secret("k", "v"), "pw")
            .await
            .unwrap();
        assert!(reg.authenticate("alice", "pw").await);
        assert!(reg.deauthenticate("alice"));
        assert!(!reg.authenticated("alice"));
        assert!(!reg.deauthenticate("alice"));
    }

    #[tokio::test]
    async fn mappings_invert_per_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        reg.register(User::new("alice").with_mapping("slack", "U123"), "pw")
            .await
            .unwrap();
        reg.register(User::new("bob").with_mapping("slack", "U456"), "pw")
            .await
            .unwrap();
        reg.register(User::new("carol").with_mapping("forge", "carol-gh"), "pw")
            .await
            .unwrap();

        let slack = reg.get_mappings("slack").await;
        assert_eq!(slack.len(), 2);
        assert_eq!(slack["U123"], "alice");
        assert_eq!(slack["U456"], "bob");
        assert!(reg.get_mappings("forge").await.contains_key("carol-gh"));
    }
}
