/// Errors from the pinhost daemon.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] pinhost_config::ConfigError),

    #[error(transparent)]
    Store(#[from] pinhost_store::StoreError),

    #[error(transparent)]
    Dns(#[from] pinhost_dns::DnsError),

    #[error(transparent)]
    Acme(#[from] pinhost_acme::AcmeError),

    #[error("failed to bind {address}: {source}")]
    Bind { address: String, source: std::io::Error },

    #[error("tls error: {0}")]
    Tls(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;
