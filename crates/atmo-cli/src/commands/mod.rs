mod identity;
mod route;
mod token;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use atmo_config::{AtmoConfig, ConfigLoader, WarningSeverity};
use atmo_core::{AtmoError, Result};
use atmo_identity::{FileKeyStore, IdentityStore, KeyAlgorithm, TrustedIssuers};

pub use identity::IdentityAction;
pub use token::TokenAction;

/// Atmosphere: trust and routing for a peer-to-peer compute mesh
#[derive(Parser, Debug)]
#[command(name = "atmo", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to atmo.toml config file
    #[arg(short, long, global = true, env = "ATMO_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect this node's identity
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },
    /// Issue or verify membership tokens
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Route a query against a capability table snapshot
    Route {
        /// Request text to route
        query: String,

        /// JSON file holding an array of capability entries
        #[arg(short, long)]
        table: PathBuf,

        /// Only consider capabilities of this type
        #[arg(long = "type")]
        capability_type: Option<String>,

        /// Require this tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Audit configuration and identity
    Doctor,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let loader = ConfigLoader::load(self.config.as_deref())?;
        let config = loader.get();

        init_tracing(&config, self.log_level.as_deref(), self.verbose, self.quiet);

        match self.command {
            Commands::Identity { action } => identity::cmd_identity(&config, action),
            Commands::Token { action } => token::cmd_token(&config, action),
            Commands::Route {
                query,
                table,
                capability_type,
                tags,
                json,
            } => route::cmd_route(&config, &query, &table, capability_type, tags, json),
            Commands::Config { json } => cmd_config(&config, json),
            Commands::Doctor => cmd_doctor(&config),
        }
    }
}

/// `RUST_LOG` wins; then `--verbose`/`--quiet`/`--log-level`; then the config.
fn resolve_log_level<'a>(config: &'a AtmoConfig, flag: Option<&'a str>, verbose: bool, quiet: bool) -> &'a str {
    if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        flag.unwrap_or(&config.logging.level)
    }
}

fn init_tracing(config: &AtmoConfig, flag: Option<&str>, verbose: bool, quiet: bool) {
    let level = resolve_log_level(config, flag, verbose, quiet);
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level))
    };

    match config.logging.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .json()
            .with_target(true)
            .init(),
        "compact" => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .compact()
            .with_target(false)
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .pretty()
            .with_target(false)
            .init(),
    }
}

/// The identity in the configured key file, created on first use.
fn load_identity(config: &AtmoConfig) -> Result<IdentityStore> {
    let algorithm: KeyAlgorithm = config.identity.algorithm.parse()?;
    Ok(IdentityStore::load_or_create(
        &FileKeyStore::new(config.key_file()),
        algorithm,
    ))
}

fn cmd_config(config: &AtmoConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        println!(
            "{}",
            toml::to_string_pretty(config).map_err(|e| AtmoError::Config(e.to_string()))?
        );
    }
    Ok(())
}

fn cmd_doctor(config: &AtmoConfig) -> Result<()> {
    println!("Atmosphere doctor: configuration audit");
    println!();

    let warnings = match config.validate() {
        Ok(w) => w,
        Err(e) => {
            println!("{e}");
            return Err(AtmoError::Config("configuration has errors".into()));
        }
    };

    let mut warn_count = 0;
    let mut info_count = 0;
    for w in &warnings {
        println!("  {w}");
        match w.severity {
            WarningSeverity::Warning => warn_count += 1,
            WarningSeverity::Info => info_count += 1,
            WarningSeverity::Error => {}
        }
    }

    let mut ok = 0;
    let key_file = config.key_file();
    if key_file.exists() {
        let identity = load_identity(config)?;
        if identity.is_signed() {
            println!("  [ok] identity {} ({})", identity.node_id(), key_file.display());
            ok += 1;
        } else {
            println!("  [warning] identity {} has no signing key; it cannot issue tokens", identity.node_id());
            warn_count += 1;
        }
    } else {
        println!(
            "  [info] no identity at {} yet; one is created on first use",
            key_file.display()
        );
        info_count += 1;
    }

    let trusted = TrustedIssuers::from_config(&config.token.trusted_issuers);
    if trusted.len() == config.token.trusted_issuers.len() && !trusted.is_empty() {
        println!("  [ok] {} trusted issuer(s)", trusted.len());
        ok += 1;
    } else if trusted.is_empty() {
        println!("  [info] no trusted issuers; only a mesh founder can admit peers");
        info_count += 1;
    }

    println!();
    println!("  {ok} checks passed, {warn_count} warnings, {info_count} notes");
    Ok(())
}
