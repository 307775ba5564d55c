//! Error taxonomy for the engine.
//!
//! Only two failure classes surface to callers as hard errors: a signal source
//! that faults repeatedly within one turn, and a persisted store whose layout
//! tag disagrees with the running encoder. Everything else is recovered at the
//! component boundary.

use std::path::PathBuf;

use thiserror::Error;

use crate::convergence::CycleState;

/// Root error type for all engine failures.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A signal source faulted on too many consecutive cycles; the turn is aborted.
    ///
    /// `partial` carries every cycle completed before the abort, for diagnostics.
    #[error("signal source `{source_name}` faulted on {faults} consecutive cycles")]
    FatalSignal {
        /// Name of the failing source.
        source_name: String,
        /// Consecutive fault count at abort time.
        faults: u32,
        /// Trajectory completed before the abort.
        partial: Vec<CycleState>,
    },

    /// A persisted store was written by a different signature layout.
    #[error("store `{artifact}` layout mismatch: expected `{expected}`, found `{found}`")]
    SchemaMismatch {
        /// Artifact name (`families`, `coupling`, `patterns`).
        artifact: String,
        /// Layout tag of the running encoder.
        expected: String,
        /// Layout tag found in the store.
        found: String,
    },

    /// Another writer holds the single-writer lock on a store directory.
    #[error("store directory `{}` is locked by another writer{}", path.display(), owner_suffix(&owner))]
    StoreLocked {
        /// Path of the lock file.
        path: PathBuf,
        /// Pid recorded in the lock file, when readable.
        owner: Option<u32>,
    },

    /// Vector or matrix dimensions disagree.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    Dimension {
        /// Expected length.
        expected: usize,
        /// Actual length.
        got: usize,
    },

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// Filesystem failure during load or flush.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Store payload could not be (de)serialised.
    #[cfg(feature = "serde")]
    #[error("serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn owner_suffix(owner: &Option<u32>) -> String {
    match owner {
        Some(pid) => format!(" (pid {pid})"),
        None => String::new(),
    }
}

/// Result alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;
