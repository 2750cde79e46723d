//! Database configuration
//!
//! Loaded from JSON or built in code. Every field has a default, so an
//! empty object is a valid configuration.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::errors::{DatabaseError, DbResult};

/// Key for at-rest encryption
///
/// The key bytes never appear in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey(String);

impl EncryptionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding named databases (default: current directory)
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Encryption is not compiled in; a key makes open fail
    #[serde(default)]
    pub encryption_key: Option<EncryptionKey>,

    /// Seconds between expiration sweeps, 0 disables the sweeper (default: 60)
    #[serde(default = "default_sweep_interval")]
    pub expiration_sweep_interval_secs: u64,

    /// Revisions kept per branch by compaction (default: 20)
    #[serde(default = "default_max_tree_depth")]
    pub max_revision_tree_depth: usize,
}

fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_max_tree_depth() -> usize {
    20
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            encryption_key: None,
            expiration_sweep_interval_secs: default_sweep_interval(),
            max_revision_tree_depth: default_max_tree_depth(),
        }
    }
}

impl DatabaseConfig {
    /// Config for databases under `directory`
    pub fn in_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> DbResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| DatabaseError::InvalidArgument(format!("Failed to read config: {}", e)))?;
        let config: DatabaseConfig = serde_json::from_str(&content)
            .map_err(|e| DatabaseError::InvalidArgument(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.max_revision_tree_depth == 0 {
            return Err(DatabaseError::InvalidArgument(
                "max_revision_tree_depth must be > 0".to_string(),
            ));
        }
        if self.directory.as_os_str().is_empty() {
            return Err(DatabaseError::InvalidArgument("directory must not be empty".to_string()));
        }
        Ok(())
    }
}
