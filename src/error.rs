//! Error taxonomy of the tree engine.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TreeError>;

/// Errors surfaced by the tree engine.
///
/// Every error aborts the current operation and leaves the engine in the
/// pre-call state. Exchange failures inside collectives are not recoverable
/// and are not represented here; a rank that fails mid-collective must abort
/// the whole job.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("communicator mismatch: expected {expected} ranks, got {actual}")]
    CommunicatorMismatch { expected: usize, actual: usize },

    #[error("snapshot version mismatch: expected {expected}, found {found}")]
    SnapshotIncompatible { expected: i32, found: i32 },

    #[error("snapshot was taken with {dumped} ranks, restoring on {current}")]
    SnapshotRankMismatch { dumped: usize, current: usize },

    #[error("snapshot configuration mismatch: {0}")]
    SnapshotConfigMismatch(String),

    #[error("snapshot stream is corrupt: {0}")]
    SnapshotCorrupt(#[from] std::io::Error),
}
