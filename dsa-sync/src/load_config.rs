//! `load_config` module: reads the optional YAML config, applies environment
//! overrides and maps the result onto the core's [`SyncConfig`] and
//! [`TransferConfig`].
//!
//! ```yaml
//! dsa:
//!   host: http://localhost:8080
//!   username: admin
//!   base_collection: 65f0c0ffee
//!   folder_name: lcdr
//! server:
//!   listen_addr: 0.0.0.0:3000
//!   schedule_hour: 1
//! ```
//!
//! Every `dsa` value can also come from the environment (`DSA_HOST`,
//! `DSA_USERNAME`, `DSA_PASSWORD`, `DSA_BASE_COLLECTION_ID`, `DSA_FOLDER_NAME`),
//! as can `DSA_LISTEN_ADDR`. Environment values win over the file.
//!
//! # Errors
//! All errors use `anyhow::Error` with context and are surfaced at the CLI boundary.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use dsa_sync_core::config::{SyncConfig, TransferConfig};
use dsa_sync_core::contract::Credentials;
use dsa_sync_core::scaffold::FolderStructure;
use serde::Deserialize;
use tracing::{error, info};

pub const ENV_HOST: &str = "DSA_HOST";
pub const ENV_USERNAME: &str = "DSA_USERNAME";
pub const ENV_PASSWORD: &str = "DSA_PASSWORD";
pub const ENV_BASE_COLLECTION: &str = "DSA_BASE_COLLECTION_ID";
pub const ENV_FOLDER_NAME: &str = "DSA_FOLDER_NAME";
pub const ENV_LISTEN_ADDR: &str = "DSA_LISTEN_ADDR";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub dsa: DsaSection,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DsaSection {
    pub host: String,
    pub username: String,
    pub password: String,
    /// Collection id that receives files lying directly in the local root.
    pub base_collection: String,
    /// Local directory mirrored onto the archive.
    pub folder_name: String,
    pub chunk_size: u64,
    pub request_timeout_secs: u64,
}

impl Default for DsaSection {
    fn default() -> Self {
        let transfer = TransferConfig::default();
        Self {
            host: "http://localhost:8080".to_string(),
            username: String::new(),
            password: String::new(),
            base_collection: String::new(),
            folder_name: "lcdr".to_string(),
            chunk_size: transfer.chunk_size,
            request_timeout_secs: transfer.request_timeout_secs,
        }
    }
}

impl std::fmt::Debug for DsaSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DsaSection")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("base_collection", &self.base_collection)
            .field("folder_name", &self.folder_name)
            .field("chunk_size", &self.chunk_size)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen_addr: String,
    /// Local time of the daily run.
    pub schedule_hour: u32,
    pub schedule_minute: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            schedule_hour: 1,
            schedule_minute: 0,
        }
    }
}

impl AppConfig {
    pub fn sync_config(&self) -> Result<SyncConfig> {
        if self.dsa.base_collection.trim().is_empty() {
            bail!("dsa.base_collection is not set (config file or {ENV_BASE_COLLECTION})");
        }
        let config = SyncConfig {
            root: PathBuf::from(&self.dsa.folder_name),
            base_collection_id: self.dsa.base_collection.clone(),
            credentials: Credentials {
                username: self.dsa.username.clone(),
                password: self.dsa.password.clone(),
            },
        };
        config.trace_loaded();
        Ok(config)
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.dsa.chunk_size,
            request_timeout_secs: self.dsa.request_timeout_secs,
        }
    }

    fn apply_env_overrides(&mut self) {
        override_from_env(ENV_HOST, &mut self.dsa.host);
        override_from_env(ENV_USERNAME, &mut self.dsa.username);
        override_from_env(ENV_PASSWORD, &mut self.dsa.password);
        override_from_env(ENV_BASE_COLLECTION, &mut self.dsa.base_collection);
        override_from_env(ENV_FOLDER_NAME, &mut self.dsa.folder_name);
        override_from_env(ENV_LISTEN_ADDR, &mut self.server.listen_addr);
    }

    fn validate(&self) -> Result<()> {
        if self.dsa.chunk_size == 0 {
            bail!("dsa.chunk_size must be greater than zero");
        }
        if self.server.schedule_hour > 23 || self.server.schedule_minute > 59 {
            bail!(
                "invalid schedule time {:02}:{:02}",
                self.server.schedule_hour,
                self.server.schedule_minute
            );
        }
        Ok(())
    }
}

fn override_from_env(key: &str, target: &mut String) {
    if let Ok(value) = env::var(key) {
        if !value.is_empty() {
            info!(env = key, "Config value taken from environment");
            *target = value;
        }
    }
}

/// Load the config file if given, then apply environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(path) => read_yaml::<AppConfig>(path)?,
        None => {
            info!("No config file given, using defaults and environment");
            AppConfig::default()
        }
    };
    config.apply_env_overrides();
    config.validate()?;
    info!(dsa = ?config.dsa, server = ?config.server, "Configuration loaded");
    Ok(config)
}

/// Load a scaffold structure (`labs: {lab: {studies: {study: [sample]}}}`).
pub fn load_structure(path: &Path) -> Result<FolderStructure> {
    read_yaml(path)
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    info!(config_path = ?path, "Loading YAML from file");

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path, "Failed to read config file");
            return Err(anyhow!("Failed to read config file {:?}: {}", path, e));
        }
    };

    serde_yaml::from_str(&content)
        .map_err(|e| {
            error!(error = ?e, config_path = ?path, "Failed to parse config YAML");
            e
        })
        .with_context(|| format!("Failed to parse config YAML {}", path.display()))
}
