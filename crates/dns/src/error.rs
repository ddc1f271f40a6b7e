use std::io;

/// Errors from the authoritative DNS server.
#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("failed to bind {address}: {source}")]
    Bind { address: String, source: io::Error },

    #[error("zone file error: {0}")]
    Zone(String),

    #[error("zone signing key error: {0}")]
    Key(String),

    #[error("signing failed: {0}")]
    Sign(String),

    #[error("store error: {0}")]
    Store(#[from] pinhost_store::StoreError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, DnsError>;
