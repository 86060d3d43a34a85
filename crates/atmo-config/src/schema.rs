use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration: maps to `atmo.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AtmoConfig {
    pub node: NodeConfig,
    pub identity: IdentityConfig,
    pub token: TokenConfig,
    pub table: TableConfig,
    pub routing: RoutingConfig,
    pub mailbox: MailboxConfig,
    pub logging: LoggingConfig,
}

// ── Node ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Human-readable name advertised to peers.
    pub name: String,
    /// Mesh this node belongs to (or founds).
    pub mesh_id: String,
    /// Directory for persisted state (identity keypair).
    pub data_dir: PathBuf,
    /// Maximum number of admitted peers.
    pub max_peers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "atmosphere-node".into(),
            mesh_id: String::new(),
            data_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".atmo"),
            max_peers: 50,
        }
    }
}

// ── Identity ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Keypair file. Defaults to `<data_dir>/identity.json`.
    pub key_file: Option<PathBuf>,
    /// Preferred signature scheme: "ed25519" or "ecdsa-p256".
    pub algorithm: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_file: None,
            algorithm: "ed25519".into(),
        }
    }
}

// ── Tokens ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Lifetime of newly issued membership tokens.
    pub default_ttl_secs: u64,
    /// Issuer keys this node accepts, as "<alg>:<base64url key>".
    pub trusted_issuers: Vec<String>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 86_400,
            trusted_issuers: vec![],
        }
    }
}

// ── Capability table ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Entries not refreshed within this window are evicted.
    pub staleness_ttl_secs: u64,
    /// How often the eviction sweep runs.
    pub sweep_interval_secs: u64,
    /// How often local capabilities are re-advertised to peers.
    pub gossip_interval_secs: u64,
    /// Relayed entries further away than this are not ingested or re-gossiped.
    pub max_relay_hops: u32,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            staleness_ttl_secs: 60,
            sweep_interval_secs: 30,
            gossip_interval_secs: 30,
            max_relay_hops: 4,
        }
    }
}

impl TableConfig {
    pub fn staleness_ttl(&self) -> Duration {
        Duration::from_secs(self.staleness_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_secs(self.gossip_interval_secs)
    }
}

// ── Routing ────────────────────────────────────────────────────

/// Weights of the four sub-scores in the composite routing score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingWeights {
    pub semantic: f64,
    pub latency: f64,
    pub hop: f64,
    pub cost: f64,
}

impl Default for RoutingWeights {
    fn default() -> Self {
        Self {
            semantic: 0.4,
            latency: 0.25,
            hop: 0.15,
            cost: 0.2,
        }
    }
}

impl RoutingWeights {
    pub fn sum(&self) -> f64 {
        self.semantic + self.latency + self.hop + self.cost
    }

    /// Weights must be finite, non-negative, and sum to 1.
    pub fn check(&self) -> Result<(), String> {
        let all = [self.semantic, self.latency, self.hop, self.cost];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err("weights must be finite and non-negative".into());
        }
        if (self.sum() - 1.0).abs() > 1e-6 {
            return Err(format!("weights sum to {:.4}, expected 1.0", self.sum()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub weights: RoutingWeights,
    /// Latency at or above this scores 0.
    pub latency_ceiling_ms: u64,
    /// Queue depth at or above this counts as fully saturated.
    pub queue_depth_ceiling: u32,
    /// How many runner-up candidates a decision carries.
    pub max_alternatives: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            weights: RoutingWeights::default(),
            latency_ceiling_ms: 2000,
            queue_depth_ceiling: 10,
            max_alternatives: 4,
        }
    }
}

// ── Mailbox ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Interval between response polls.
    pub poll_interval_ms: u64,
    /// Timeout used when the caller does not pass one.
    pub default_timeout_secs: u64,
    /// Finished routing sessions are dropped once this old.
    pub session_max_age_secs: u64,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            default_timeout_secs: 30,
            session_max_age_secs: 3600,
        }
    }
}

impl MailboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

impl AtmoConfig {
    /// Resolved path of the identity keypair file.
    pub fn key_file(&self) -> PathBuf {
        self.identity
            .key_file
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("identity.json"))
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "[{}] {}: {}", label, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   -> {}", h)?;
        }
        Ok(())
    }
}

impl AtmoConfig {
    /// Validate the config and return a list of warnings.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Node ───
        if self.node.mesh_id.trim().is_empty() {
            warnings.push(ConfigWarning {
                field: "node.mesh_id".into(),
                message: "mesh_id is empty: tokens cannot be issued or verified".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Set to the id of the mesh you found or join".into()),
            });
        }
        if self.node.max_peers == 0 {
            warnings.push(ConfigWarning {
                field: "node.max_peers".into(),
                message: "max_peers is 0: no peer can be admitted".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        // ── Identity ───
        let valid_algorithms = ["ed25519", "ecdsa-p256"];
        if !valid_algorithms.contains(&self.identity.algorithm.as_str()) {
            warnings.push(ConfigWarning {
                field: "identity.algorithm".into(),
                message: format!("unknown algorithm '{}'", self.identity.algorithm),
                severity: WarningSeverity::Error,
                hint: Some(format!("Valid values: {}", valid_algorithms.join(", "))),
            });
        }

        // ── Tokens ───
        if self.token.default_ttl_secs == 0 {
            warnings.push(ConfigWarning {
                field: "token.default_ttl_secs".into(),
                message: "ttl is 0: issued tokens would be born expired".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 86400 (one day)".into()),
            });
        }
        for (i, key) in self.token.trusted_issuers.iter().enumerate() {
            if key.split_once(':').is_none_or(|(alg, b64)| alg.is_empty() || b64.is_empty()) {
                warnings.push(ConfigWarning {
                    field: format!("token.trusted_issuers[{}]", i),
                    message: format!("'{}' is not of the form <alg>:<base64url>", key),
                    severity: WarningSeverity::Warning,
                    hint: Some("Copy the key printed by `atmo identity show`".into()),
                });
            }
        }

        // ── Table ───
        if self.table.staleness_ttl_secs == 0 {
            warnings.push(ConfigWarning {
                field: "table.staleness_ttl_secs".into(),
                message: "staleness ttl is 0: every entry is evicted immediately".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 60".into()),
            });
        }
        if self.table.sweep_interval_secs == 0 {
            warnings.push(ConfigWarning {
                field: "table.sweep_interval_secs".into(),
                message: "sweep interval is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 30".into()),
            });
        } else if self.table.sweep_interval_secs > self.table.staleness_ttl_secs {
            warnings.push(ConfigWarning {
                field: "table.sweep_interval_secs".into(),
                message: "sweep runs less often than the staleness ttl: stale entries linger".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Use a sweep interval at most half the staleness ttl".into()),
            });
        }
        if self.table.gossip_interval_secs == 0 {
            warnings.push(ConfigWarning {
                field: "table.gossip_interval_secs".into(),
                message: "gossip interval is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 30".into()),
            });
        } else if self.table.gossip_interval_secs >= self.table.staleness_ttl_secs
            && self.table.staleness_ttl_secs > 0
        {
            warnings.push(ConfigWarning {
                field: "table.gossip_interval_secs".into(),
                message: "gossip interval is not shorter than the staleness ttl: peers will evict our entries between adverts".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        // ── Routing ───
        if let Err(e) = self.routing.weights.check() {
            warnings.push(ConfigWarning {
                field: "routing.weights".into(),
                message: e,
                severity: WarningSeverity::Error,
                hint: Some("Defaults are semantic 0.4, latency 0.25, hop 0.15, cost 0.2".into()),
            });
        }
        if self.routing.latency_ceiling_ms == 0 {
            warnings.push(ConfigWarning {
                field: "routing.latency_ceiling_ms".into(),
                message: "latency ceiling is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 2000".into()),
            });
        }
        if self.routing.queue_depth_ceiling == 0 {
            warnings.push(ConfigWarning {
                field: "routing.queue_depth_ceiling".into(),
                message: "queue depth ceiling is 0".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 10".into()),
            });
        }

        // ── Mailbox ───
        if self.mailbox.poll_interval_ms == 0 {
            warnings.push(ConfigWarning {
                field: "mailbox.poll_interval_ms".into(),
                message: "poll interval is 0: response polling would spin".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 500".into()),
            });
        }
        if self.mailbox.default_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "mailbox.default_timeout_secs".into(),
                message: "default timeout is 0: every request times out immediately".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        // ── Logging ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
