/// Errors from key handling and CSR validation.
#[derive(Debug, thiserror::Error)]
pub enum PinError {
    /// The private key PEM could not be parsed as an ECDSA P-256 key.
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// Failed to generate a key or CSR.
    #[error("generation failed: {0}")]
    Generate(String),

    /// The CSR bytes could not be parsed.
    #[error("failed to parse CSR: {0}")]
    Parse(String),

    /// The CSR asserts no names at all.
    #[error("CSR does not contain any names")]
    NoNames,

    /// A name in the CSR disagrees with the key-pinned hostname.
    #[error("CSR does not match expected hostname: {0}")]
    PinMismatch(String),
}

pub type Result<T> = std::result::Result<T, PinError>;
