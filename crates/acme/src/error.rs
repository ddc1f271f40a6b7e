/// Errors from the ACME client and certificate pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AcmeError {
    /// Protocol-level failure talking to the CA.
    #[error("acme error: {0}")]
    Protocol(String),

    /// Account key or account file problems.
    #[error("account error: {0}")]
    Account(String),

    /// The order ended in a state we can't recover from.
    #[error("order failed: {0}")]
    Order(String),

    /// CSR or certificate validation failure (client error).
    #[error(transparent)]
    Pin(#[from] pinhost_pin::PinError),

    /// Certificate parsing problems.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Shared-store failure; retried by the orchestrator.
    #[error(transparent)]
    Store(#[from] pinhost_store::StoreError),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AcmeError>;
