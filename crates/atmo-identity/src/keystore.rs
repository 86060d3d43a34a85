use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use atmo_core::{AtmoError, Result};

use crate::keys::KeyAlgorithm;

/// Persisted form of a node identity.
///
/// Key material is base64 (standard alphabet). An identity without keys is
/// the unsigned fallback created when key generation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub node_id: String,
    #[serde(default)]
    pub algorithm: Option<KeyAlgorithm>,
    #[serde(default)]
    pub public_key: Option<String>,
    /// PKCS#8 document of the private key.
    #[serde(default)]
    pub private_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StoredIdentity {
    pub fn is_signed(&self) -> bool {
        self.algorithm.is_some() && self.public_key.is_some() && self.private_key.is_some()
    }
}

/// Durable storage for a node's identity.
///
/// Platform key stores (Android Keystore, Secure Enclave, ...) plug in here.
pub trait KeyStore: Send + Sync {
    /// Load the identity, `None` if nothing has been stored yet.
    fn load(&self) -> Result<Option<StoredIdentity>>;

    /// Persist the identity, replacing any previous one.
    fn save(&self, identity: &StoredIdentity) -> Result<()>;
}

/// Stores the identity as a JSON file, readable only by the owner on unix.
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> Result<Option<StoredIdentity>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let stored = serde_json::from_str(&raw).map_err(|e| {
            AtmoError::Identity(format!("corrupt identity file {}: {}", self.path.display(), e))
        })?;
        debug!(path = %self.path.display(), "loaded identity file");
        Ok(Some(stored))
    }

    fn save(&self, identity: &StoredIdentity) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(identity)?;

        // Write next to the target and rename so a crash never leaves half a key.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "saved identity file");
        Ok(())
    }
}

/// In-process key store for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryKeyStore {
    slot: Mutex<Option<StoredIdentity>>,
    saves: Mutex<usize>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `save` was called.
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self) -> Result<Option<StoredIdentity>> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, identity: &StoredIdentity) -> Result<()> {
        *self.slot.lock() = Some(identity.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StoredIdentity {
        StoredIdentity {
            node_id: "abc".into(),
            algorithm: Some(KeyAlgorithm::Ed25519),
            public_key: Some("cHVi".into()),
            private_key: Some("cHJpdg==".into()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("nested").join("identity.json"));
        assert!(store.load().unwrap().is_none());
        store.save(&sample()).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.node_id, "abc");
        assert!(loaded.is_signed());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("identity.json"));
        store.save(&sample()).unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_file_is_identity_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = FileKeyStore::new(&path).load().unwrap_err();
        assert!(matches!(err, AtmoError::Identity(_)));
    }

    #[test]
    fn test_unsigned_identity_is_not_signed() {
        let mut id = sample();
        id.private_key = None;
        assert!(!id.is_signed());
    }
}
