//! # atmo-identity
//!
//! Decentralized trust for the Atmosphere mesh.
//!
//! Every node owns a keypair (Ed25519, or ECDSA P-256 when Ed25519 is not
//! available) and a `node_id` derived from its public key. Nodes holding
//! the `founder` or `issuer` capability mint signed, time-boxed membership
//! tokens that any other node can verify offline against the issuer's key.

pub mod identity;
pub mod keys;
pub mod keystore;
pub mod token;

pub use identity::IdentityStore;
pub use keys::{KeyAlgorithm, PublicKey, derive_node_id};
pub use keystore::{FileKeyStore, KeyStore, MemoryKeyStore, StoredIdentity};
pub use token::{
    IssuedToken, MembershipToken, TokenIssuer, TokenVerifier, TrustedIssuers, VerificationOutcome,
};
