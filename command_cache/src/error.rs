//! Error types for the store and the coordinator.

use std::path::PathBuf;
use thiserror::Error;

/// Failures of the durable key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Writing the snapshot to disk failed. The in-memory map may already
    /// contain the new entry.
    #[error("failed to persist store to {path}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode store snapshot")]
    Encode(#[source] serde_json::Error),

    /// The store file exists but does not parse.
    #[error("store file {path} is corrupt")]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to read store file {path}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures surfaced by [`crate::coordinator::Coordinator::resolve`].
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The work ran but its result could not be recorded durably.
    #[error("result could not be stored")]
    Persistence(#[source] StoreError),

    /// The executor failed. Nothing was cached; a later call retries.
    #[error("command execution failed: {0}")]
    Execution(#[source] anyhow::Error),
}

impl ResolveError {
    pub fn is_persistence(&self) -> bool {
        matches!(self, ResolveError::Persistence(_))
    }

    pub fn is_execution(&self) -> bool {
        matches!(self, ResolveError::Execution(_))
    }
}
