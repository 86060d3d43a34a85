use chrono::{DateTime, Utc};

/// Stable identifier of a node in the mesh (hex digest of its public key,
/// or `unsigned-<uuid>` for nodes without a usable keypair).
pub type NodeId = String;

/// Identifier of a mesh, chosen by its founder.
pub type MeshId = String;

/// Capability names that grant the right to mint membership tokens.
pub const CAP_FOUNDER: &str = "founder";
pub const CAP_ISSUER: &str = "issuer";

/// Current wall-clock time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current time as unix seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Convert a std duration into a chrono delta, saturating on overflow.
pub fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Truncate a node id for log output.
pub fn short_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(12)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}
