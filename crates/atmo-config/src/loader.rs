use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::AtmoConfig;

/// Loads the node configuration and keeps a shared, reloadable copy of it.
pub struct ConfigLoader {
    config: Arc<RwLock<AtmoConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > ATMO_CONFIG env > ~/.atmo/atmo.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("ATMO_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".atmo")
            .join("atmo.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> atmo_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::read_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            AtmoConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(atmo_core::AtmoError::Config(e));
            }
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Parse a config string without touching the environment.
    pub fn from_toml(raw: &str) -> atmo_core::Result<AtmoConfig> {
        toml::from_str::<AtmoConfig>(raw)
            .map_err(|e| atmo_core::AtmoError::Config(format!("failed to parse config: {}", e)))
    }

    fn read_file(path: &Path) -> atmo_core::Result<AtmoConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<AtmoConfig>(&raw).map_err(|e| {
            atmo_core::AtmoError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> AtmoConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<AtmoConfig>> {
        Arc::clone(&self.config)
    }

    /// Path the config was loaded from (or would be).
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides (ATMO_NODE_NAME, ATMO_MESH_ID, etc.)
    fn apply_env_overrides(mut config: AtmoConfig) -> AtmoConfig {
        if let Ok(v) = std::env::var("ATMO_NODE_NAME") {
            config.node.name = v;
        }
        if let Ok(v) = std::env::var("ATMO_MESH_ID") {
            config.node.mesh_id = v;
        }
        if let Ok(v) = std::env::var("ATMO_DATA_DIR") {
            config.node.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ATMO_LOG_LEVEL") {
            config.logging.level = v;
        }
        config
    }

    /// Reload the config from disk. A file that fails to parse or validate
    /// leaves the current config in place.
    pub fn reload(&self) -> atmo_core::Result<()> {
        if !self.config_path.exists() {
            return Err(atmo_core::AtmoError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::read_file(&self.config_path)?);
        new_config.validate().map_err(atmo_core::AtmoError::Config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }
}
