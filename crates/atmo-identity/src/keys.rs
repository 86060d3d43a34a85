use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::rand::SystemRandom;
use ring::signature::{
    ECDSA_P256_SHA256_FIXED, ECDSA_P256_SHA256_FIXED_SIGNING, ED25519, EcdsaKeyPair,
    Ed25519KeyPair, KeyPair, UnparsedPublicKey,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use atmo_core::{AtmoError, Result};

/// Number of digest bytes kept in a node id.
const NODE_ID_BYTES: usize = 16;

/// Signature scheme of a node keypair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    Ed25519,
    EcdsaP256,
}

impl KeyAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Ed25519 => "ed25519",
            KeyAlgorithm::EcdsaP256 => "ecdsa-p256",
        }
    }

    /// The other scheme, used when generating with this one fails.
    pub fn fallback(&self) -> KeyAlgorithm {
        match self {
            KeyAlgorithm::Ed25519 => KeyAlgorithm::EcdsaP256,
            KeyAlgorithm::EcdsaP256 => KeyAlgorithm::Ed25519,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = AtmoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ed25519" => Ok(KeyAlgorithm::Ed25519),
            "ecdsa-p256" | "p256" => Ok(KeyAlgorithm::EcdsaP256),
            other => Err(AtmoError::Identity(format!("unknown key algorithm '{other}'"))),
        }
    }
}

/// Derive the stable node id for a public key: hex of a truncated SHA-256.
pub fn derive_node_id(public_key: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, public_key);
    digest.as_ref()[..NODE_ID_BYTES]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// A public key tagged with its algorithm.
///
/// Text form is `<alg>:<base64url>`, e.g. `ed25519:3q2-7w...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    pub algorithm: KeyAlgorithm,
    pub bytes: Vec<u8>,
}

impl PublicKey {
    pub fn new(algorithm: KeyAlgorithm, bytes: Vec<u8>) -> Self {
        Self { algorithm, bytes }
    }

    /// Node id of the holder of this key.
    pub fn node_id(&self) -> String {
        derive_node_id(&self.bytes)
    }

    /// Check `signature` over `message`. Never panics on garbage input.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match self.algorithm {
            KeyAlgorithm::Ed25519 => UnparsedPublicKey::new(&ED25519, &self.bytes)
                .verify(message, signature)
                .is_ok(),
            KeyAlgorithm::EcdsaP256 => UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, &self.bytes)
                .verify(message, signature)
                .is_ok(),
        }
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, URL_SAFE_NO_PAD.encode(&self.bytes))
    }
}

impl FromStr for PublicKey {
    type Err = AtmoError;

    fn from_str(s: &str) -> Result<Self> {
        let (alg, b64) = s
            .split_once(':')
            .ok_or_else(|| AtmoError::Identity(format!("public key '{s}' lacks an algorithm prefix")))?;
        let algorithm = alg.parse()?;
        let bytes = URL_SAFE_NO_PAD
            .decode(b64.trim())
            .map_err(|e| AtmoError::Identity(format!("public key is not base64url: {e}")))?;
        if bytes.is_empty() {
            return Err(AtmoError::Identity("public key is empty".into()));
        }
        Ok(Self { algorithm, bytes })
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A loaded private key. Only ever held inside [`crate::IdentityStore`].
pub(crate) enum NodeKeypair {
    Ed25519(Ed25519KeyPair),
    EcdsaP256(EcdsaKeyPair),
}

impl NodeKeypair {
    /// Generate a fresh keypair, returning it with its PKCS#8 encoding.
    pub(crate) fn generate(algorithm: KeyAlgorithm, rng: &SystemRandom) -> Result<(Self, Vec<u8>)> {
        let pkcs8 = match algorithm {
            KeyAlgorithm::Ed25519 => Ed25519KeyPair::generate_pkcs8(rng),
            KeyAlgorithm::EcdsaP256 => {
                EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, rng)
            }
        }
        .map_err(|_| AtmoError::Identity(format!("{algorithm} key generation failed")))?;
        let pkcs8 = pkcs8.as_ref().to_vec();
        let pair = Self::from_pkcs8(algorithm, &pkcs8, rng)?;
        Ok((pair, pkcs8))
    }

    pub(crate) fn from_pkcs8(algorithm: KeyAlgorithm, pkcs8: &[u8], rng: &SystemRandom) -> Result<Self> {
        match algorithm {
            KeyAlgorithm::Ed25519 => Ed25519KeyPair::from_pkcs8(pkcs8)
                .map(NodeKeypair::Ed25519)
                .map_err(|e| AtmoError::Identity(format!("ed25519 key rejected: {e}"))),
            KeyAlgorithm::EcdsaP256 => {
                EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, rng)
                    .map(NodeKeypair::EcdsaP256)
                    .map_err(|e| AtmoError::Identity(format!("ecdsa-p256 key rejected: {e}")))
            }
        }
    }

    pub(crate) fn public_key(&self) -> PublicKey {
        match self {
            NodeKeypair::Ed25519(kp) => {
                PublicKey::new(KeyAlgorithm::Ed25519, kp.public_key().as_ref().to_vec())
            }
            NodeKeypair::EcdsaP256(kp) => {
                PublicKey::new(KeyAlgorithm::EcdsaP256, kp.public_key().as_ref().to_vec())
            }
        }
    }

    pub(crate) fn sign(&self, rng: &SystemRandom, message: &[u8]) -> Result<Vec<u8>> {
        match self {
            NodeKeypair::Ed25519(kp) => Ok(kp.sign(message).as_ref().to_vec()),
            NodeKeypair::EcdsaP256(kp) => kp
                .sign(rng, message)
                .map(|sig| sig.as_ref().to_vec())
                .map_err(|_| AtmoError::Signing("ecdsa signing failed".into())),
        }
    }
}
