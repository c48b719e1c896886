//! Persistent storage for bearer credentials.
//!
//! The SDK keeps at most two secrets: the user's auth token and an admin
//! key. Stores are synchronous; the file-backed store survives process
//! restarts.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::warn;

/// Key under which the user auth token is stored.
pub const AUTH_TOKEN_KEY: &str = "pendulum_auth_token";
/// Key under which the admin key is stored.
pub const ADMIN_KEY: &str = "pendulum_admin_key";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential file io: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential file format: {0}")]
    Format(#[from] serde_json::Error),
}

/// Key-value store for secrets.
pub trait CredentialStore: Send + Sync {
    fn load(&self, key: &str) -> Option<SecretString>;

    fn store(&self, key: &str, value: SecretString) -> Result<(), CredentialError>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), CredentialError>;
}

/// Bearer credential held by `store`; the admin key wins over the user token.
pub fn bearer_token(store: &dyn CredentialStore) -> Option<SecretString> {
    store.load(ADMIN_KEY).or_else(|| store.load(AUTH_TOKEN_KEY))
}

/// Process-local store; contents are lost on exit.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<BTreeMap<String, SecretString>>,
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self, key: &str) -> Option<SecretString> {
        self.entries.lock().get(key).cloned()
    }

    fn store(&self, key: &str, value: SecretString) -> Result<(), CredentialError> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CredentialError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// JSON file store. Every write rewrites the file through a temporary
/// sibling and a rename.
pub struct FileCredentialStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileCredentialStore {
    /// Opens the store at `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match read_entries(&path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    event = "credential_file_unreadable",
                    path = %path.display(),
                    error = %err,
                );
                BTreeMap::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let encoded = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = open_private(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, key: &str) -> Option<SecretString> {
        self.entries
            .lock()
            .get(key)
            .map(|value| SecretString::new(value.clone()))
    }

    fn store(&self, key: &str, value: SecretString) -> Result<(), CredentialError> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value.expose_secret().clone());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), CredentialError> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_none() {
            return Ok(());
        }
        self.persist(&entries)
    }
}

fn read_entries(path: &Path) -> Result<BTreeMap<String, String>, CredentialError> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::File::create(path)
}

#[cfg(test)]
mod tests {
    use secrecy::{ExposeSecret, SecretString};

    use super::{CredentialStore, FileCredentialStore, MemoryCredentialStore, AUTH_TOKEN_KEY};

    fn secret(value: &str) -> SecretString {
        SecretString::new(value.to_string())
    }

    #[test]
    fn memory_store_round_trips_and_removes() {
        let store = MemoryCredentialStore::default();
        store.store(AUTH_TOKEN_KEY, secret("abc")).expect("store");
        assert_eq!(store.load(AUTH_TOKEN_KEY).expect("load").expose_secret(), "abc");

        store.remove(AUTH_TOKEN_KEY).expect("remove");
        store.remove(AUTH_TOKEN_KEY).expect("remove twice");
        assert!(store.load(AUTH_TOKEN_KEY).is_none());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("credentials.json");

        let store = FileCredentialStore::open(&path);
        store.store(AUTH_TOKEN_KEY, secret("persisted")).expect("store");
        drop(store);

        let reopened = FileCredentialStore::open(&path);
        assert_eq!(
            reopened.load(AUTH_TOKEN_KEY).expect("load").expose_secret(),
            "persisted"
        );

        reopened.remove(AUTH_TOKEN_KEY).expect("remove");
        assert!(FileCredentialStore::open(&path).load(AUTH_TOKEN_KEY).is_none());
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, b"{not json").expect("write");

        let store = FileCredentialStore::open(&path);
        assert!(store.load(AUTH_TOKEN_KEY).is_none());
        store.store(AUTH_TOKEN_KEY, secret("fresh")).expect("overwrite");
        assert_eq!(
            FileCredentialStore::open(&path)
                .load(AUTH_TOKEN_KEY)
                .expect("load")
                .expose_secret(),
            "fresh"
        );
    }

    #[cfg(unix)]
    #[test]
    fn file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("credentials.json");
        FileCredentialStore::open(&path)
            .store(AUTH_TOKEN_KEY, secret("x"))
            .expect("store");

        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
