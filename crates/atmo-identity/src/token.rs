use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::RwLock;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use atmo_core::{AtmoError, CAP_FOUNDER, CAP_ISSUER, Result, TokenRejection, short_id, unix_now};

use crate::identity::IdentityStore;
use crate::keys::PublicKey;

/// Current claims format version.
pub const TOKEN_VERSION: u8 = 1;

const NONCE_BYTES: usize = 16;

/// A signed, time-boxed grant of mesh membership.
///
/// Serializing the token yields its canonical encoding: compact JSON with
/// the fields in declaration order and the signature left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MembershipToken {
    pub v: u8,
    pub mesh_id: String,
    /// Node the token was issued to; `None` for bearer invites.
    pub subject_node_id: Option<String>,
    /// Unix seconds.
    pub issued_at: i64,
    /// Unix seconds, strictly after `issued_at`.
    pub expires_at: i64,
    pub capabilities: BTreeSet<String>,
    pub issuer_id: String,
    /// 16 random bytes, base64url.
    pub nonce: String,
    #[serde(skip)]
    pub signature: Vec<u8>,
}

impl MembershipToken {
    /// The bytes the signature covers.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Transport form: `base64url(canonical) "." base64url(signature)`.
    pub fn encode(&self) -> Result<String> {
        let payload = self.canonical_bytes()?;
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload),
            URL_SAFE_NO_PAD.encode(&self.signature)
        ))
    }

    /// Parse the transport form. Does not check the signature.
    ///
    /// Payloads that are not in canonical form are refused, so the bytes
    /// that were signed are exactly the bytes a verifier recomputes.
    pub fn decode(encoded: &str) -> Result<Self> {
        let malformed = || AtmoError::token(TokenRejection::Malformed);
        let (payload_b64, sig_b64) = encoded.trim().split_once('.').ok_or_else(malformed)?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| malformed())?;
        let signature = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| malformed())?;

        let mut token: MembershipToken = serde_json::from_slice(&payload).map_err(|_| malformed())?;
        if token.canonical_bytes()? != payload {
            return Err(malformed());
        }
        token.signature = signature;
        Ok(token)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Whether the holder may mint tokens for this token's mesh.
    pub fn grants_issuance(&self) -> bool {
        self.has_capability(CAP_FOUNDER) || self.has_capability(CAP_ISSUER)
    }

    /// `issued_at <= now <= expires_at`.
    pub fn is_live_at(&self, now: i64) -> bool {
        now >= self.issued_at && now <= self.expires_at
    }

    pub fn remaining_secs(&self, now: i64) -> i64 {
        (self.expires_at - now).max(0)
    }
}

/// A freshly minted token together with its transport encoding.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: MembershipToken,
    pub encoded: String,
}

// ── Issuing ────────────────────────────────────────────────────

enum Authority {
    /// The node that created the mesh.
    Founder { mesh_id: String },
    /// Authority granted by another issuer's token.
    Delegated { grant: MembershipToken },
}

/// Mints membership tokens signed by this node.
pub struct TokenIssuer {
    identity: Arc<IdentityStore>,
    authority: Authority,
    rng: SystemRandom,
}

impl TokenIssuer {
    /// Issuer for a mesh this node founded.
    pub fn founder(identity: Arc<IdentityStore>, mesh_id: impl Into<String>) -> Self {
        Self {
            identity,
            authority: Authority::Founder {
                mesh_id: mesh_id.into(),
            },
            rng: SystemRandom::new(),
        }
    }

    /// Issuer acting on a token that grants `issuer` or `founder` to this node.
    ///
    /// The grant should already have been verified by the caller.
    pub fn delegated(identity: Arc<IdentityStore>, grant: MembershipToken) -> Result<Self> {
        if !grant.grants_issuance() {
            return Err(AtmoError::NotAuthorized(
                "token does not carry the issuer or founder capability".into(),
            ));
        }
        if grant.subject_node_id.as_deref() != Some(identity.node_id()) {
            return Err(AtmoError::NotAuthorized(format!(
                "issuing token belongs to another node, not {}",
                short_id(identity.node_id())
            )));
        }
        Ok(Self {
            identity,
            authority: Authority::Delegated { grant },
            rng: SystemRandom::new(),
        })
    }

    /// Mesh this issuer may mint tokens for.
    pub fn mesh_id(&self) -> &str {
        match &self.authority {
            Authority::Founder { mesh_id } => mesh_id,
            Authority::Delegated { grant } => &grant.mesh_id,
        }
    }

    pub fn is_founder(&self) -> bool {
        matches!(self.authority, Authority::Founder { .. })
    }

    /// Mint a token, or `None` if this node cannot (no key, no authority).
    pub fn issue<I, S>(
        &self,
        subject_node_id: Option<&str>,
        mesh_id: &str,
        capabilities: I,
        ttl: Duration,
    ) -> Option<IssuedToken>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self.try_issue(subject_node_id, mesh_id, capabilities, ttl) {
            Ok(issued) => Some(issued),
            Err(e) => {
                warn!(mesh_id, error = %e, "token not issued");
                None
            }
        }
    }

    /// Like [`issue`](Self::issue), reporting why issuance was refused.
    pub fn try_issue<I, S>(
        &self,
        subject_node_id: Option<&str>,
        mesh_id: &str,
        capabilities: I,
        ttl: Duration,
    ) -> Result<IssuedToken>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.identity.is_signed() {
            return Err(AtmoError::Signing(
                "node has no private key and cannot issue tokens".into(),
            ));
        }
        if mesh_id != self.mesh_id() {
            return Err(AtmoError::NotAuthorized(format!(
                "not an issuer for mesh '{mesh_id}'"
            )));
        }

        let capabilities: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();
        let issued_at = unix_now();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let mut expires_at = issued_at.saturating_add(ttl_secs);

        if let Authority::Delegated { grant } = &self.authority {
            if !grant.is_live_at(issued_at) {
                return Err(AtmoError::NotAuthorized("issuing token is not currently valid".into()));
            }
            if capabilities.contains(CAP_FOUNDER) {
                return Err(AtmoError::NotAuthorized(
                    "only the founder may grant the founder capability".into(),
                ));
            }
            expires_at = expires_at.min(grant.expires_at);
        }
        if expires_at <= issued_at {
            return Err(AtmoError::InvalidState(
                "token lifetime must be at least one second".into(),
            ));
        }

        let mut nonce = [0u8; NONCE_BYTES];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| AtmoError::Signing("system randomness unavailable".into()))?;

        let mut token = MembershipToken {
            v: TOKEN_VERSION,
            mesh_id: mesh_id.to_string(),
            subject_node_id: subject_node_id.map(str::to_string),
            issued_at,
            expires_at,
            capabilities,
            issuer_id: self.identity.node_id().to_string(),
            nonce: URL_SAFE_NO_PAD.encode(nonce),
            signature: Vec::new(),
        };
        token.signature = self.identity.sign(&token.canonical_bytes()?)?;
        let encoded = token.encode()?;

        debug!(
            mesh_id,
            subject = subject_node_id.map(short_id).unwrap_or("-"),
            expires_at,
            "issued membership token"
        );
        Ok(IssuedToken { token, encoded })
    }
}

// ── Verification ───────────────────────────────────────────────

/// Result of checking a token. `token` is only set when `valid`.
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub valid: bool,
    pub reason: Option<TokenRejection>,
    pub token: Option<MembershipToken>,
}

impl VerificationOutcome {
    fn accepted(token: MembershipToken) -> Self {
        Self {
            valid: true,
            reason: None,
            token: Some(token),
        }
    }

    fn rejected(reason: TokenRejection) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            token: None,
        }
    }

    pub fn into_result(self) -> Result<MembershipToken> {
        match (self.valid, self.token, self.reason) {
            (true, Some(token), _) => Ok(token),
            (_, _, reason) => Err(AtmoError::token(reason.unwrap_or(TokenRejection::Malformed))),
        }
    }
}

/// Checks tokens offline against an issuer key for one mesh.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    mesh_id: String,
}

impl TokenVerifier {
    pub fn new(mesh_id: impl Into<String>) -> Self {
        Self {
            mesh_id: mesh_id.into(),
        }
    }

    pub fn mesh_id(&self) -> &str {
        &self.mesh_id
    }

    pub fn verify(&self, encoded: &str, issuer_key: &PublicKey) -> VerificationOutcome {
        self.verify_at(encoded, issuer_key, unix_now())
    }

    /// Verify against an explicit clock (unix seconds).
    pub fn verify_at(&self, encoded: &str, issuer_key: &PublicKey, now: i64) -> VerificationOutcome {
        let token = match MembershipToken::decode(encoded) {
            Ok(token) => token,
            Err(_) => return VerificationOutcome::rejected(TokenRejection::Malformed),
        };
        self.check(token, issuer_key, now)
    }

    /// Verify using the roster entry for the token's claimed issuer.
    pub fn verify_trusted(&self, encoded: &str, roster: &TrustedIssuers) -> VerificationOutcome {
        self.verify_trusted_at(encoded, roster, unix_now())
    }

    pub fn verify_trusted_at(&self, encoded: &str, roster: &TrustedIssuers, now: i64) -> VerificationOutcome {
        let token = match MembershipToken::decode(encoded) {
            Ok(token) => token,
            Err(_) => return VerificationOutcome::rejected(TokenRejection::Malformed),
        };
        match roster.get(&token.issuer_id) {
            Some(key) => self.check(token, &key, now),
            None => {
                debug!(issuer = %short_id(&token.issuer_id), "token from unknown issuer");
                VerificationOutcome::rejected(TokenRejection::UntrustedIssuer)
            }
        }
    }

    fn check(&self, token: MembershipToken, issuer_key: &PublicKey, now: i64) -> VerificationOutcome {
        if token.expires_at <= token.issued_at {
            return VerificationOutcome::rejected(TokenRejection::Malformed);
        }
        if token.issuer_id != issuer_key.node_id() {
            return VerificationOutcome::rejected(TokenRejection::IssuerMismatch);
        }
        let Ok(payload) = token.canonical_bytes() else {
            return VerificationOutcome::rejected(TokenRejection::Malformed);
        };
        if !issuer_key.verify(&payload, &token.signature) {
            return VerificationOutcome::rejected(TokenRejection::BadSignature);
        }
        if now < token.issued_at {
            return VerificationOutcome::rejected(TokenRejection::NotYetValid);
        }
        if now > token.expires_at {
            return VerificationOutcome::rejected(TokenRejection::Expired);
        }
        if token.mesh_id != self.mesh_id {
            return VerificationOutcome::rejected(TokenRejection::WrongMesh);
        }
        VerificationOutcome::accepted(token)
    }
}

// ── Trusted issuers ────────────────────────────────────────────

/// Issuer keys this node accepts tokens from, keyed by issuer node id.
#[derive(Debug, Clone, Default)]
pub struct TrustedIssuers {
    keys: Arc<RwLock<HashMap<String, PublicKey>>>,
}

impl TrustedIssuers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `"<alg>:<base64url>"` strings, skipping (and logging) bad ones.
    pub fn from_config(entries: &[String]) -> Self {
        let roster = Self::new();
        for entry in entries {
            match entry.parse::<PublicKey>() {
                Ok(key) => {
                    roster.add(key);
                }
                Err(e) => warn!(entry = %entry, error = %e, "ignoring trusted issuer"),
            }
        }
        roster
    }

    /// Trust a key. Returns the issuer id it is filed under.
    pub fn add(&self, key: PublicKey) -> String {
        let id = key.node_id();
        self.keys.write().insert(id.clone(), key);
        id
    }

    pub fn remove(&self, issuer_id: &str) -> Option<PublicKey> {
        self.keys.write().remove(issuer_id)
    }

    pub fn get(&self, issuer_id: &str) -> Option<PublicKey> {
        self.keys.read().get(issuer_id).cloned()
    }

    pub fn contains(&self, issuer_id: &str) -> bool {
        self.keys.read().contains_key(issuer_id)
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.keys.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyAlgorithm;
    use crate::keystore::MemoryKeyStore;

    fn identity() -> Arc<IdentityStore> {
        Arc::new(IdentityStore::load_or_create(&MemoryKeyStore::new(), KeyAlgorithm::Ed25519))
    }

    #[test]
    fn test_canonical_field_order() {
        let id = identity();
        let issuer = TokenIssuer::founder(id, "home");
        let issued = issuer
            .try_issue(None, "home", ["chat", "admin"], Duration::from_secs(60))
            .unwrap();
        let json = String::from_utf8(issued.token.canonical_bytes().unwrap()).unwrap();
        assert!(json.starts_with(r#"{"v":1,"mesh_id":"home","subject_node_id":null,"issued_at":"#));
        assert!(json.contains(r#""capabilities":["admin","chat"],"issuer_id":""#));
        assert!(!json.contains("signature"));
    }

    #[test]
    fn test_decode_rejects_non_canonical_payload() {
        let id = identity();
        let issued = TokenIssuer::founder(id, "home")
            .try_issue(None, "home", ["chat"], Duration::from_secs(60))
            .unwrap();
        let payload = String::from_utf8(issued.token.canonical_bytes().unwrap()).unwrap();
        let spaced = payload.replacen(',', ", ", 1);
        let forged = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(spaced),
            URL_SAFE_NO_PAD.encode(&issued.token.signature)
        );
        assert!(MembershipToken::decode(&forged).is_err());
    }

    #[test]
    fn test_decode_garbage() {
        for bad in ["", "abc", "abc.def", "!!!.???"] {
            let err = MembershipToken::decode(bad).unwrap_err();
            assert!(matches!(
                err,
                AtmoError::TokenInvalid {
                    reason: TokenRejection::Malformed
                }
            ));
        }
    }

    #[test]
    fn test_outcome_into_result() {
        let err = VerificationOutcome::rejected(TokenRejection::Expired)
            .into_result()
            .unwrap_err();
        assert_eq!(err.to_string(), "token invalid: expired");
    }

    #[test]
    fn test_roster_from_config_skips_bad_entries() {
        let id = identity();
        let key = id.public_key().unwrap().to_string();
        let roster = TrustedIssuers::from_config(&[key, "nonsense".into()]);
        assert_eq!(roster.len(), 1);
        assert!(roster.contains(id.node_id()));
    }
}
