//! # atmo-cli
//!
//! Command-line interface for an Atmosphere node.
//!
//! ## Commands
//!
//! - `atmo identity show`: Print this node's id and public key
//! - `atmo token issue`: Mint a membership token as mesh founder
//! - `atmo token verify`: Check a token offline
//! - `atmo route`: Route a query against a capability table snapshot
//! - `atmo config`: Show the effective configuration
//! - `atmo doctor`: Audit configuration and identity

pub mod commands;

pub use commands::Cli;
