//! Persisted storage layout: the cluster registry and segment file names.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ClusterId, TesseraError};

/// File holding the registry inside a storage directory.
pub const CONFIG_FILE: &str = "storage.toml";

/// Clusters every new storage starts with.
pub const DEFAULT_CLUSTERS: [&str; 3] = ["internal", "index", "default"];

const CONFIG_FORMAT_VERSION: u32 = 1;

/// Errors raised while reading or writing `storage.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read storage config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Cause.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this layout.
    #[error("failed to parse storage config {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Cause.
        source: toml::de::Error,
    },
    /// The registry could not be rendered.
    #[error("failed to serialize storage config: {source}")]
    Serialize {
        /// Cause.
        source: toml::ser::Error,
    },
    /// The file could not be written.
    #[error("failed to write storage config {path}: {source}")]
    Write {
        /// File that failed.
        path: PathBuf,
        /// Cause.
        source: std::io::Error,
    },
    /// The file was written by an unknown format revision.
    #[error("storage config format {found} is not supported")]
    Version {
        /// Version found on disk.
        found: u32,
    },
    /// Two clusters share a name or id.
    #[error("cluster '{name}' ({id}) is registered twice")]
    Duplicate {
        /// Cluster name.
        name: String,
        /// Cluster id.
        id: ClusterId,
    },
}

impl From<ConfigError> for TesseraError {
    fn from(err: ConfigError) -> Self {
        TesseraError::Configuration(err.to_string())
    }
}

/// One registered cluster.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Numeric id used in record addresses.
    pub id: ClusterId,
    /// Unique name.
    pub name: String,
    /// Segment file name relative to the storage directory.
    pub file: String,
}

/// Contents of `storage.toml`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Layout revision.
    pub format_version: u32,
    /// Data segment file name.
    pub data_file: String,
    /// Registered clusters, in id order.
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

impl StorageConfig {
    /// Registry of a freshly created storage.
    pub fn initial() -> Self {
        let mut config = Self {
            format_version: CONFIG_FORMAT_VERSION,
            data_file: "data.tds".to_string(),
            clusters: Vec::new(),
        };
        for name in DEFAULT_CLUSTERS {
            config.register(name);
        }
        config
    }

    /// Adds a cluster with the next free id and returns its entry.
    pub fn register(&mut self, name: &str) -> ClusterConfig {
        let id = self.clusters.iter().map(|c| c.id).max().map_or(0, |max| max + 1);
        let entry = ClusterConfig {
            id,
            name: name.to_string(),
            file: format!("{name}.tcl"),
        };
        self.clusters.push(entry.clone());
        entry
    }

    /// Looks a cluster up by name.
    pub fn by_name(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Looks a cluster up by id.
    pub fn by_id(&self, id: ClusterId) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.id == id)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.format_version != CONFIG_FORMAT_VERSION {
            return Err(ConfigError::Version {
                found: self.format_version,
            });
        }
        for (idx, cluster) in self.clusters.iter().enumerate() {
            let clash = self.clusters[..idx]
                .iter()
                .any(|other| other.id == cluster.id || other.name == cluster.name);
            if clash {
                return Err(ConfigError::Duplicate {
                    name: cluster.name.clone(),
                    id: cluster.id,
                });
            }
        }
        Ok(())
    }

    /// Reads and validates `storage.toml` from `dir`.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: StorageConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Writes `storage.toml` into `dir`, replacing the previous copy atomically.
    pub fn persist(&self, dir: &Path) -> Result<(), ConfigError> {
        let target = dir.join(CONFIG_FILE);
        let staging = dir.join(format!("{CONFIG_FILE}.tmp"));
        let serialized =
            toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })?;
        fs::write(&staging, serialized).map_err(|source| ConfigError::Write {
            path: staging.clone(),
            source,
        })?;
        fs::rename(&staging, &target).map_err(|source| ConfigError::Write {
            path: target,
            source,
        })
    }
}
