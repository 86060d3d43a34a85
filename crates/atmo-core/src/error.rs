use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a membership token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenRejection {
    /// Not decodable, or its timestamps are inconsistent.
    Malformed,
    BadSignature,
    Expired,
    NotYetValid,
    WrongMesh,
    /// The claimed issuer id does not belong to the key used to verify.
    IssuerMismatch,
    /// No trusted key is known for the claimed issuer.
    UntrustedIssuer,
    /// The token was issued to a different node than the one presenting it.
    SubjectMismatch,
}

impl std::fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            TokenRejection::Malformed => "malformed",
            TokenRejection::BadSignature => "bad signature",
            TokenRejection::Expired => "expired",
            TokenRejection::NotYetValid => "not yet valid",
            TokenRejection::WrongMesh => "wrong mesh",
            TokenRejection::IssuerMismatch => "issuer mismatch",
            TokenRejection::UntrustedIssuer => "untrusted issuer",
            TokenRejection::SubjectMismatch => "subject mismatch",
        };
        f.write_str(reason)
    }
}

/// Unified error type for the Atmosphere core.
#[derive(Error, Debug)]
pub enum AtmoError {
    // ── Identity / signing ─────────────────────────────────────
    #[error("identity error: {0}")]
    Identity(String),

    #[error("signing error: {0}")]
    Signing(String),

    // ── Tokens ─────────────────────────────────────────────────
    #[error("token invalid: {reason}")]
    TokenInvalid { reason: TokenRejection },

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    // ── Capability table / routing ─────────────────────────────
    #[error("no candidate capability: {0}")]
    NoCandidateCapability(String),

    #[error("invalid capability entry: {field}: {reason}")]
    InvalidEntry { field: String, reason: String },

    // ── Mailbox / sessions ─────────────────────────────────────
    #[error("mailbox write failed: {0}")]
    MailboxWrite(String),

    #[error("no response to request {request_id} within {waited_ms}ms")]
    Timeout { request_id: String, waited_ms: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // ── Mesh / peers ───────────────────────────────────────────
    #[error("mesh peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("mesh peer not admitted: {0}")]
    PeerNotAdmitted(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AtmoError {
    /// Shorthand for a rejected token.
    pub fn token(reason: TokenRejection) -> Self {
        AtmoError::TokenInvalid { reason }
    }

    /// Whether the caller may reasonably retry with a different target.
    ///
    /// Nothing in the core retries on its own; this only classifies.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AtmoError::Timeout { .. }
                | AtmoError::NoCandidateCapability(_)
                | AtmoError::MailboxWrite(_)
                | AtmoError::PeerUnreachable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AtmoError>;
