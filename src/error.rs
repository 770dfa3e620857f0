//! Error handling module
//!
//! Library errors use thiserror. Persistence of the global store has its own
//! `StoreError` since callers branch on the failure kind (oversized, not a
//! mapping, parse error); everything else funnels into `InstallerError`.
//!
//! Job-level failures are NOT errors in this sense: a job reports problems
//! through `JobResult`, and the command runner reports problems as data.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the installer core
#[derive(Error, Debug)]
pub enum InstallerError {
    /// IO errors (settings files, scripts, worker threads)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Global storage load/save errors
    #[error("Global storage error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors (settings file, module configuration maps)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Module instantiation errors
    #[error("Module error: {0}")]
    Module(String),
}

/// Result type alias for installer-core operations
pub type Result<T> = std::result::Result<T, InstallerError>;

impl InstallerError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a module error
    pub fn module(msg: impl Into<String>) -> Self {
        Self::Module(msg.into())
    }
}

/// Failure to load or save the global store.
///
/// A failed load never modifies the store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cannot access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} exceeds the {limit} byte limit", path.display())]
    TooLarge { path: PathBuf, limit: u64 },

    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid YAML in {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{} does not hold a mapping at the top level", path.display())]
    NotAMapping { path: PathBuf },

    #[error("cannot serialize global storage: {0}")]
    Serialize(String),
}
