// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration types for kvfs

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] io::Error),
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no path given and the config was not loaded from disk")]
    MissingPath,
}

/// Which engine backs the metadata store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaStoreBackend {
    /// SQLite database file inside `dir`
    #[default]
    Sqlite,
    /// Volatile map; nothing survives the process
    Memory,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaStoreConfig {
    pub backend: MetaStoreBackend,
    /// Directory holding the store files
    pub dir: PathBuf,
    /// Namespace inside the store, so several filesystems can share one database
    pub prefix: String,
    /// Key (and path prefix) of the root directory record
    pub fs_root: String,
    /// Key of the filesystem-info record (counters and identifier high-water mark)
    pub fs_info: String,
}

impl Default for MetaStoreConfig {
    fn default() -> Self {
        Self {
            backend: MetaStoreBackend::Sqlite,
            dir: PathBuf::from(".kvfs"),
            prefix: "kvfs".to_string(),
            fs_root: "/".to_string(),
            fs_info: "kvfs:info".to_string(),
        }
    }
}

/// Kernel-side cache lifetimes handed to the FUSE adapter
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    pub attr_ttl_ms: u32,
    pub entry_ttl_ms: u32,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            attr_ttl_ms: 1000,
            entry_ttl_ms: 1000,
        }
    }
}

/// Default cap on file size (1 GiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 30;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Identifier of this host in replica lists
    pub name: String,
    /// Minimum level to log at (trace, debug, info, warn, error)
    pub log_level: Option<String>,
    #[serde(rename = "readonly")]
    pub read_only: bool,
    /// Owner of the root and of synthesised nodes; defaults to the process euid/egid
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Largest file size a write or truncate may produce, in bytes
    pub max_file_size: u64,
    pub meta_store: MetaStoreConfig,
    pub cache: CachePolicy,
    /// Where the config was loaded from
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl Default for FsConfig {
    fn default() -> Self {
        let name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "kvfs".to_string());
        Self {
            name,
            log_level: Some("info".to_string()),
            read_only: false,
            uid: None,
            gid: None,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            meta_store: MetaStoreConfig::default(),
            cache: CachePolicy::default(),
            path: None,
        }
    }
}

impl FsConfig {
    /// Load a configuration from a JSON file, remembering its path
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let mut config: FsConfig = serde_json::from_str(&content)?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Write the configuration as JSON. Without a path, writes back to where it was loaded from.
    pub fn dump(&self, path: Option<&Path>) -> Result<(), ConfigError> {
        let target = path.or(self.path.as_deref()).ok_or(ConfigError::MissingPath)?;
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(target, data)?;
        Ok(())
    }
}
