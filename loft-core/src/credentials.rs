//! Encrypted credential storage for network sources.
//!
//! Secrets (SMB username/password) never enter catalog rows or backups;
//! they live in one AES-256-GCM encrypted file beside the database,
//! keyed by source id. The key material is generated locally on first
//! use, so no OS keychain is required.
//!
//! Deleting a media source deliberately does NOT delete its stored
//! credential; callers clean up explicitly via [`CredentialStore::delete`].

use std::collections::HashMap;
use std::path::PathBuf;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CoreError, Result};

const KEY_FILE: &str = "credentials.key";
const STORE_FILE: &str = "credentials.enc";
const ENVELOPE_VERSION: u32 = 1;

/// A username/password pair. Zeroized on drop; Debug never prints the
/// password.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Keyed secret capability: put/get/delete by source id.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn put(&self, source_id: i64, credentials: Credentials) -> Result<()>;
    async fn get(&self, source_id: i64) -> Result<Option<Credentials>>;
    async fn delete(&self, source_id: i64) -> Result<()>;
}

/// On-disk envelope wrapping the encrypted credential map.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    nonce: String,
    ciphertext: String,
    encrypted_at: DateTime<Utc>,
    version: u32,
}

/// File-backed store: `credentials.enc` + `credentials.key` under the
/// data directory.
pub struct EncryptedFileStore {
    store_path: PathBuf,
    key: Zeroizing<Vec<u8>>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for EncryptedFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFileStore")
            .field("store_path", &self.store_path)
            .finish()
    }
}

impl EncryptedFileStore {
    /// Open the store under `data_dir`, generating key material on
    /// first use.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;

        let key_path = data_dir.join(KEY_FILE);
        let key = match tokio::fs::read(&key_path).await {
            Ok(bytes) if bytes.len() == 32 => Zeroizing::new(bytes),
            Ok(_) => {
                return Err(CoreError::CredentialStore(format!(
                    "corrupt key file: {}",
                    key_path.display()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let fresh = Zeroizing::new(Aes256Gcm::generate_key(OsRng).to_vec());
                tokio::fs::write(&key_path, fresh.as_slice()).await?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let perms = std::fs::Permissions::from_mode(0o600);
                    tokio::fs::set_permissions(&key_path, perms).await?;
                }
                fresh
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            store_path: data_dir.join(STORE_FILE),
            key,
            lock: Mutex::new(()),
        })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }

    async fn load(&self) -> Result<HashMap<i64, Credentials>> {
        let raw = match tokio::fs::read(&self.store_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        let envelope: Envelope = serde_json::from_slice(&raw)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(CoreError::CredentialStore(format!(
                "unsupported credential store version {}",
                envelope.version
            )));
        }
        let nonce = BASE64
            .decode(&envelope.nonce)
            .map_err(|e| CoreError::CredentialStore(format!("corrupt nonce: {e}")))?;
        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|e| CoreError::CredentialStore(format!("corrupt ciphertext: {e}")))?;
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| CoreError::CredentialStore("decryption failed (wrong key?)".into()))?;
        let plaintext = Zeroizing::new(plaintext);
        Ok(serde_json::from_slice(&plaintext)?)
    }

    async fn save(&self, map: &HashMap<i64, Credentials>) -> Result<()> {
        let plaintext = Zeroizing::new(serde_json::to_vec(map)?);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| CoreError::CredentialStore("encryption failed".into()))?;
        let envelope = Envelope {
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
            encrypted_at: Utc::now(),
            version: ENVELOPE_VERSION,
        };
        // Write-then-rename so a crash mid-write cannot corrupt the
        // store. The outer lock keeps the temp name unshared.
        let tmp_path = self.store_path.with_extension("enc.tmp");
        tokio::fs::write(&tmp_path, serde_json::to_vec_pretty(&envelope)?).await?;
        tokio::fs::rename(&tmp_path, &self.store_path).await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for EncryptedFileStore {
    async fn put(&self, source_id: i64, credentials: Credentials) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.load().await?;
        map.insert(source_id, credentials);
        self.save(&map).await
    }

    async fn get(&self, source_id: i64) -> Result<Option<Credentials>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(&source_id))
    }

    async fn delete(&self, source_id: i64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.load().await?;
        if map.remove(&source_id).is_some() {
            self.save(&map).await?;
        }
        Ok(())
    }
}

/// Volatile store for tests.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<HashMap<i64, Credentials>>,
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn put(&self, source_id: i64, credentials: Credentials) -> Result<()> {
        self.inner.lock().await.insert(source_id, credentials);
        Ok(())
    }

    async fn get(&self, source_id: i64) -> Result<Option<Credentials>> {
        Ok(self.inner.lock().await.get(&source_id).cloned())
    }

    async fn delete(&self, source_id: i64) -> Result<()> {
        self.inner.lock().await.remove(&source_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedFileStore::open(dir.path()).await.unwrap();
        store
            .put(7, Credentials::new("alice".into(), "hunter2".into()))
            .await
            .unwrap();

        // Fresh handle, same key file.
        let reopened = EncryptedFileStore::open(dir.path()).await.unwrap();
        let got = reopened.get(7).await.unwrap().unwrap();
        assert_eq!(got.username, "alice");
        assert_eq!(got.password, "hunter2");
        assert!(reopened.get(8).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_only_the_given_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedFileStore::open(dir.path()).await.unwrap();
        store
            .put(1, Credentials::new("a".into(), "1".into()))
            .await
            .unwrap();
        store
            .put(2, Credentials::new("b".into(), "2".into()))
            .await
            .unwrap();
        store.delete(1).await.unwrap();
        assert!(store.get(1).await.unwrap().is_none());
        assert!(store.get(2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rewrite_goes_through_a_temp_file_and_survives_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedFileStore::open(dir.path()).await.unwrap();
        store
            .put(1, Credentials::new("alice".into(), "hunter2".into()))
            .await
            .unwrap();

        // A stale temp file from an interrupted write must not leak
        // into the store or break the next rewrite.
        let tmp_path = dir.path().join("credentials.enc.tmp");
        std::fs::write(&tmp_path, b"garbage from a crashed write").unwrap();
        store
            .put(2, Credentials::new("bob".into(), "s3cret".into()))
            .await
            .unwrap();

        assert!(!tmp_path.exists());
        let reopened = EncryptedFileStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get(1).await.unwrap().unwrap().username, "alice");
        assert_eq!(reopened.get(2).await.unwrap().unwrap().username, "bob");
    }

    #[tokio::test]
    async fn secrets_are_not_plaintext_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedFileStore::open(dir.path()).await.unwrap();
        store
            .put(1, Credentials::new("alice".into(), "sup3rsecret".into()))
            .await
            .unwrap();
        let raw = std::fs::read_to_string(dir.path().join(STORE_FILE)).unwrap();
        assert!(!raw.contains("sup3rsecret"));
        assert!(!raw.contains("alice"));
    }
}
