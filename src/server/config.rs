// src/server/config.rs
//! Configuration file parsing for the repository server
//!
//! Supports TOML configuration files with the following sections:
//! - [server] - Bind address, served host names, access modes, retry budget
//! - [storage] - Database, content store, scratch and cache directories
//! - [mirror] - Mirror feed paging

use crate::server::ServerConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// TOML configuration file structure
#[derive(Debug, Default, Deserialize)]
pub struct RepositoryConfigFile {
    /// Server settings
    #[serde(default)]
    pub server: ServerSection,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageSection,

    /// Mirror settings
    #[serde(default)]
    pub mirror: MirrorSection,
}

/// Server configuration section
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// HTTP bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Repository host names served here; empty serves every label
    #[serde(default)]
    pub server_names: Vec<String>,

    /// Reject every write operation
    #[serde(default)]
    pub read_only: bool,

    /// Reject every call with this message
    #[serde(default)]
    pub closed: Option<String>,

    /// Run write calls one at a time
    #[serde(default)]
    pub serialize_commits: bool,

    /// Attempts per call on lock conflicts
    #[serde(default = "default_deadlock_retry")]
    pub deadlock_retry: u32,

    /// Command run after each successful commit
    #[serde(default)]
    pub commit_action: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            server_names: Vec::new(),
            read_only: false,
            closed: None,
            serialize_commits: false,
            deadlock_retry: default_deadlock_retry(),
            commit_action: None,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_deadlock_retry() -> u32 {
    5
}

/// Storage configuration section
#[derive(Debug, Deserialize)]
pub struct StorageSection {
    /// Repository database
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Content-addressed file store
    #[serde(default = "default_contents_dir")]
    pub contents_dir: PathBuf,

    /// Scratch space for uploads and manifests
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,

    /// Change-set cache; caching is off when unset
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            contents_dir: default_contents_dir(),
            tmp_dir: default_tmp_dir(),
            cache_dir: None,
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/srv/conary/repo.db")
}

fn default_contents_dir() -> PathBuf {
    PathBuf::from("/srv/conary/contents")
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("/srv/conary/tmp")
}

/// Mirror configuration section
#[derive(Debug, Deserialize)]
pub struct MirrorSection {
    /// Distinct rows a full feed page is sized for
    #[serde(default = "default_min_batch")]
    pub min_batch: usize,
}

impl Default for MirrorSection {
    fn default() -> Self {
        Self {
            min_batch: default_min_batch(),
        }
    }
}

fn default_min_batch() -> usize {
    crate::mirror::MIN_BATCH
}

impl RepositoryConfigFile {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: RepositoryConfigFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid server.bind address: {}", self.server.bind))?;

        if self.server.deadlock_retry == 0 {
            anyhow::bail!("server.deadlock_retry must be at least 1");
        }
        if self.mirror.min_batch == 0 {
            anyhow::bail!("mirror.min_batch must be at least 1");
        }
        if let Some(action) = &self.server.commit_action {
            if action.trim().is_empty() {
                anyhow::bail!("server.commit_action must not be empty");
            }
        }

        Ok(())
    }

    /// Convert to the internal ServerConfig structure
    pub fn to_server_config(&self) -> Result<ServerConfig> {
        let bind_addr = self.server.bind.parse()?;

        Ok(ServerConfig {
            bind_addr,
            server_names: self.server.server_names.clone(),
            read_only: self.server.read_only,
            closed: self.server.closed.clone(),
            serialize_commits: self.server.serialize_commits,
            deadlock_retry: self.server.deadlock_retry,
            commit_action: self.server.commit_action.clone(),
            db_path: self.storage.db_path.clone(),
            contents_dir: self.storage.contents_dir.clone(),
            tmp_dir: self.storage.tmp_dir.clone(),
            cache_dir: self.storage.cache_dir.clone(),
            mirror_min_batch: self.mirror.min_batch,
        })
    }
}
