use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors from the replicated state store.
///
/// Consensus-level failures (no quorum, no leader) surface as `Unavailable`
/// so callers can distinguish transient conditions worth retrying from
/// permanent ones.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("raft error: {0}")]
    Raft(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Snapshot(#[from] SnapshotError),

    #[error("peers file: {0}")]
    Peers(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
