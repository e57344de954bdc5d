//! Error taxonomy shared by the storage engine, the service layer and the
//! HTTP transport.
//!
//! Every variant carries a stable numeric code (the wire contract) and maps
//! to exactly one HTTP status. The message text is human readable and is
//! not a machine interface.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KvError>;

/// All failures a key-value operation can surface.
#[derive(Debug, Error)]
pub enum KvError {
    /// The key does not exist (or has expired and reads as absent).
    #[error("key not found")]
    KeyNotFound,

    /// The key existed but its expiration has passed.
    #[error("key expired")]
    KeyExpired,

    /// The key exceeds the configured maximum size.
    #[error("key too long")]
    KeyTooLong,

    /// The value exceeds the configured maximum size.
    #[error("value too large")]
    ValueTooLarge,

    /// The request is malformed (empty key, bad base64, negative ttl, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Admitting the write would exceed the configured memory cap.
    #[error("memory limit reached")]
    MemoryFull,

    /// The service is shutting down; no further operations are accepted.
    #[error("service closed")]
    ServiceClosed,

    /// Unexpected failure (I/O, encoding, ...).
    #[error("internal error: {0}")]
    Internal(String),
}

impl KvError {
    /// Stable numeric code from the error registry.
    pub fn code(&self) -> i32 {
        match self {
            KvError::KeyNotFound => 1001,
            KvError::KeyExpired => 1002,
            KvError::KeyTooLong => 2001,
            KvError::ValueTooLarge => 2002,
            KvError::InvalidRequest(_) => 2003,
            KvError::MemoryFull => 3001,
            KvError::ServiceClosed | KvError::Internal(_) => 5001,
        }
    }

    /// The HTTP status this error maps to at the transport.
    pub fn http_status(&self) -> u16 {
        match self {
            KvError::KeyNotFound | KvError::KeyExpired => 404,
            KvError::KeyTooLong | KvError::ValueTooLarge | KvError::InvalidRequest(_) => 400,
            KvError::MemoryFull => 507,
            KvError::ServiceClosed | KvError::Internal(_) => 500,
        }
    }
}

impl From<std::io::Error> for KvError {
    fn from(err: std::io::Error) -> Self {
        KvError::Internal(err.to_string())
    }
}
