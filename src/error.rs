use thiserror::Error;

use crate::storage::encdec::DecodingError;

/// Failure taxonomy for the indexing engine.
///
/// Protocol-level invalidity (a token overspend, a malformed envelope) is
/// recorded on the payload itself and intentionally has no variant here.
#[derive(Error, Debug)]
pub enum Error {
    /// A dependency (source transaction, proof) is not available yet.
    #[error("not ready: {0}")]
    NotReady(String),

    /// The requested entity genuinely does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("decoding error: {0}")]
    Decoding(#[from] DecodingError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("transaction error: {0}")]
    Tx(#[from] bitcoin::consensus::encode::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Error::NotReady(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Whether the scheduler should retry the current attempt rather than
    /// discard the transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotReady(_) | Error::Storage(_))
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
