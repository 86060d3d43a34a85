use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use ring::rand::SystemRandom;
use tracing::{info, warn};

use atmo_core::{AtmoError, Result, short_id};

use crate::keys::{KeyAlgorithm, NodeKeypair, PublicKey, derive_node_id};
use crate::keystore::{KeyStore, StoredIdentity};

/// A node's identity: stable id plus (normally) an exclusively owned keypair.
///
/// The private key never leaves this struct; share the store behind an `Arc`
/// and call [`IdentityStore::sign`].
pub struct IdentityStore {
    node_id: String,
    keypair: Option<NodeKeypair>,
    public_key: Option<PublicKey>,
    created_at: DateTime<Utc>,
    rng: SystemRandom,
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore")
            .field("node_id", &self.node_id)
            .field("algorithm", &self.algorithm())
            .field("signed", &self.is_signed())
            .finish()
    }
}

impl IdentityStore {
    /// Load the persisted identity, or create and persist a new one.
    ///
    /// Never fails: if no keypair can be produced the node gets an unsigned
    /// identifier and keeps running.
    pub fn load_or_create(store: &dyn KeyStore, preferred: KeyAlgorithm) -> Self {
        Self::load_or_create_with_schemes(store, &[preferred, preferred.fallback()])
    }

    /// Like [`load_or_create`](Self::load_or_create) with an explicit list of
    /// schemes to try, in order, when generating. An empty list always yields
    /// the unsigned fallback.
    pub fn load_or_create_with_schemes(store: &dyn KeyStore, schemes: &[KeyAlgorithm]) -> Self {
        let rng = SystemRandom::new();

        match store.load() {
            Ok(Some(stored)) => return Self::from_stored(stored, rng),
            Ok(None) => {}
            Err(e) => {
                // Do not overwrite a store we could not read.
                warn!(error = %e, "identity store unreadable, using a temporary unsigned identity");
                return Self::unsigned(rng);
            }
        }

        let mut generated = None;
        for &alg in schemes {
            match NodeKeypair::generate(alg, &rng) {
                Ok(pair) => {
                    generated = Some((alg, pair));
                    break;
                }
                Err(e) => warn!(algorithm = %alg, error = %e, "key generation failed"),
            }
        }

        let (identity, pkcs8) = match generated {
            Some((alg, (keypair, pkcs8))) => {
                let public_key = keypair.public_key();
                let node_id = public_key.node_id();
                info!(node_id = %short_id(&node_id), algorithm = %alg, "created node identity");
                let identity = Self {
                    node_id,
                    keypair: Some(keypair),
                    public_key: Some(public_key),
                    created_at: Utc::now(),
                    rng,
                };
                (identity, Some(pkcs8))
            }
            None => {
                warn!("no signature scheme available, falling back to an unsigned identity");
                (Self::unsigned(rng), None)
            }
        };

        if let Err(e) = store.save(&identity.to_stored(pkcs8.as_deref())) {
            warn!(error = %e, "failed to persist node identity, it will not survive a restart");
        }
        identity
    }

    fn unsigned(rng: SystemRandom) -> Self {
        Self {
            node_id: format!("unsigned-{}", uuid::Uuid::new_v4()),
            keypair: None,
            public_key: None,
            created_at: Utc::now(),
            rng,
        }
    }

    fn from_stored(stored: StoredIdentity, rng: SystemRandom) -> Self {
        let restored = match (&stored.algorithm, &stored.private_key) {
            (Some(alg), Some(private_b64)) => STANDARD
                .decode(private_b64)
                .map_err(|e| AtmoError::Identity(format!("stored private key is not base64: {e}")))
                .and_then(|pkcs8| NodeKeypair::from_pkcs8(*alg, &pkcs8, &rng)),
            _ => Err(AtmoError::Identity("stored identity has no keypair".into())),
        };

        match restored {
            Ok(keypair) => {
                let public_key = keypair.public_key();
                let derived = derive_node_id(&public_key.bytes);
                if derived != stored.node_id {
                    warn!(
                        stored = %short_id(&stored.node_id),
                        derived = %short_id(&derived),
                        "stored node id does not match its key, using the derived id"
                    );
                }
                info!(node_id = %short_id(&derived), "loaded node identity");
                Self {
                    node_id: derived,
                    keypair: Some(keypair),
                    public_key: Some(public_key),
                    created_at: stored.created_at,
                    rng,
                }
            }
            Err(e) => {
                // Keep the persisted id so the node stays addressable.
                warn!(node_id = %short_id(&stored.node_id), error = %e, "loaded identity without a usable key");
                Self {
                    node_id: stored.node_id,
                    keypair: None,
                    public_key: None,
                    created_at: stored.created_at,
                    rng,
                }
            }
        }
    }

    fn to_stored(&self, pkcs8: Option<&[u8]>) -> StoredIdentity {
        StoredIdentity {
            node_id: self.node_id.clone(),
            algorithm: self.algorithm(),
            public_key: self.public_key.as_ref().map(|pk| STANDARD.encode(&pk.bytes)),
            private_key: pkcs8.map(|der| STANDARD.encode(der)),
            created_at: self.created_at,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    pub fn algorithm(&self) -> Option<KeyAlgorithm> {
        self.public_key.as_ref().map(|pk| pk.algorithm)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether this node can sign (and therefore issue tokens).
    pub fn is_signed(&self) -> bool {
        self.keypair.is_some()
    }

    /// Sign arbitrary bytes with the node's private key.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let keypair = self
            .keypair
            .as_ref()
            .ok_or_else(|| AtmoError::Signing(format!("node {} has no private key", short_id(&self.node_id))))?;
        keypair.sign(&self.rng, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{FileKeyStore, MemoryKeyStore};

    #[test]
    fn test_create_then_load_is_stable() {
        let store = MemoryKeyStore::new();
        let first = IdentityStore::load_or_create(&store, KeyAlgorithm::Ed25519);
        let second = IdentityStore::load_or_create(&store, KeyAlgorithm::Ed25519);
        assert_eq!(first.node_id(), second.node_id());
        assert_eq!(first.public_key(), second.public_key());
        assert_eq!(store.save_count(), 1, "an existing identity must never be regenerated");
    }

    #[test]
    fn test_node_id_derived_from_public_key() {
        let store = MemoryKeyStore::new();
        let id = IdentityStore::load_or_create(&store, KeyAlgorithm::Ed25519);
        assert_eq!(id.node_id(), id.public_key().unwrap().node_id());
        assert_eq!(id.node_id().len(), 32);
    }

    #[test]
    fn test_sign_verifies_with_public_key() {
        for alg in [KeyAlgorithm::Ed25519, KeyAlgorithm::EcdsaP256] {
            let store = MemoryKeyStore::new();
            let id = IdentityStore::load_or_create(&store, alg);
            assert_eq!(id.algorithm(), Some(alg));
            let sig = id.sign(b"payload").unwrap();
            assert!(id.public_key().unwrap().verify(b"payload", &sig));
        }
    }

    #[test]
    fn test_unsigned_fallback_is_persisted_and_cannot_sign() {
        let store = MemoryKeyStore::new();
        let id = IdentityStore::load_or_create_with_schemes(&store, &[]);
        assert!(id.node_id().starts_with("unsigned-"));
        assert!(!id.is_signed());
        assert!(id.public_key().is_none());
        assert!(matches!(id.sign(b"x"), Err(AtmoError::Signing(_))));

        let again = IdentityStore::load_or_create(&store, KeyAlgorithm::Ed25519);
        assert_eq!(again.node_id(), id.node_id());
        assert!(!again.is_signed());
    }

    #[test]
    fn test_file_persistence_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let a = IdentityStore::load_or_create(&FileKeyStore::new(&path), KeyAlgorithm::Ed25519);
        let b = IdentityStore::load_or_create(&FileKeyStore::new(&path), KeyAlgorithm::Ed25519);
        assert_eq!(a.node_id(), b.node_id());
        let sig = b.sign(b"m").unwrap();
        assert!(a.public_key().unwrap().verify(b"m", &sig));
    }

    #[test]
    fn test_unreadable_store_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, "garbage").unwrap();
        let id = IdentityStore::load_or_create(&FileKeyStore::new(&path), KeyAlgorithm::Ed25519);
        assert!(!id.is_signed());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "garbage");
    }
}
