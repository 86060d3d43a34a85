#[cfg(test)]
mod tests {
    use atmo_identity::*;

    #[test]
    fn test_identity_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("identity.json");

        let first = IdentityStore::load_or_create(&FileKeyStore::new(&path), KeyAlgorithm::Ed25519);
        assert!(first.is_signed());
        assert!(path.exists());

        // Preferring another algorithm must not replace the stored key.
        let second = IdentityStore::load_or_create(&FileKeyStore::new(&path), KeyAlgorithm::EcdsaP256);
        assert_eq!(second.node_id(), first.node_id());
        assert_eq!(second.algorithm(), Some(KeyAlgorithm::Ed25519));
    }

    #[test]
    fn test_wiped_storage_gives_new_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let first = IdentityStore::load_or_create(&FileKeyStore::new(&path), KeyAlgorithm::Ed25519);
        std::fs::remove_file(&path).unwrap();
        let second = IdentityStore::load_or_create(&FileKeyStore::new(&path), KeyAlgorithm::Ed25519);
        assert_ne!(first.node_id(), second.node_id());
    }

    #[test]
    fn test_stored_identity_matches_loaded() {
        let store = MemoryKeyStore::new();
        let id = IdentityStore::load_or_create(&store, KeyAlgorithm::Ed25519);
        let stored = store.load().unwrap().unwrap();
        assert!(stored.is_signed());
        assert_eq!(stored.node_id, id.node_id());
        assert_eq!(derive_node_id(&id.public_key().unwrap().bytes), stored.node_id);
    }

    #[test]
    fn test_public_key_text_roundtrip_through_json() {
        let id = IdentityStore::load_or_create(&MemoryKeyStore::new(), KeyAlgorithm::EcdsaP256);
        let key = id.public_key().unwrap();
        let json = serde_json::to_string(key).unwrap();
        assert!(json.starts_with("\"ecdsa-p256:"));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, key);
        assert_eq!(back.node_id(), id.node_id());
    }

    #[test]
    fn test_debug_does_not_leak_key_material() {
        let id = IdentityStore::load_or_create(&MemoryKeyStore::new(), KeyAlgorithm::Ed25519);
        let dbg = format!("{id:?}");
        assert!(dbg.contains(id.node_id()));
        assert!(!dbg.contains("keypair"));
    }
}
