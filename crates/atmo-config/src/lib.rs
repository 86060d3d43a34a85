//! # atmo-config
//!
//! Configuration for an Atmosphere node. Reads from `atmo.toml`, then applies
//! environment variable overrides.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::AtmoConfig;
pub use schema::{
    ConfigWarning, IdentityConfig, LoggingConfig, MailboxConfig, NodeConfig, RoutingConfig,
    RoutingWeights, TableConfig, TokenConfig, WarningSeverity,
};
