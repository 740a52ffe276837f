use thiserror::Error;

/// The closed error taxonomy surfaced by every component of the core (see
/// the error handling design: each variant has a fixed propagation policy).
#[derive(Error, Debug)]
pub enum FamilyVaultError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("family not configured")]
    NotConfigured,

    #[error("family already configured")]
    AlreadyConfigured,

    #[error("invalid pin: {0}")]
    InvalidPin(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("TLS-PSK identity does not match announced device id")]
    AuthMismatch,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("busy: {0}")]
    Busy(String),

    #[error("cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("secure storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FamilyVaultError>;

impl From<tokio::time::error::Elapsed> for FamilyVaultError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        FamilyVaultError::Timeout("deadline exceeded".into())
    }
}
