use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejections raised before any work starts. A request failing with one of
/// these leaves no session behind and writes nothing.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("invalid_range: {start}-{end}, available urls: {available}")]
    InvalidRange {
        start: usize,
        end: usize,
        available: String,
    },
    #[error("too_many_urls: {requested} requested, maximum {max} per request")]
    TooManyUrls { requested: usize, max: usize },
    #[error("invalid_batch_size: {batch_size}, must be between 1 and {max}")]
    InvalidBatchSize { batch_size: usize, max: usize },
    #[error("duplicate_session: {0} is already running")]
    DuplicateSession(String),
    #[error("invalid_page_range: {start_page}-{end_page}, pages start at 1 and end_page must be >= start_page")]
    InvalidPageRange { start_page: usize, end_page: usize },
    #[error("url_source: {0}")]
    Source(#[from] SourceError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("out_of_bounds: {start}-{end} requested from {len} urls")]
    OutOfBounds { start: usize, end: usize, len: usize },
    #[error("io: {0}")]
    Io(String),
    #[error("redis: {0}")]
    Redis(String),
}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        SourceError::Io(e.to_string())
    }
}

impl From<redis::RedisError> for SourceError {
    fn from(e: redis::RedisError) -> Self {
        SourceError::Redis(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    /// network or timeout class, worth another attempt
    #[error("transient: {0}")]
    Transient(String),
    /// content or parse class, retrying cannot help
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ExtractionError {
    pub fn transient(msg: impl Into<String>) -> Self {
        ExtractionError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        ExtractionError::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ExtractionError::Transient(_))
    }
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Serialization failures repeat identically, so only the store side is
    /// worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Serialization(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Redis(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Why a single url ended up in the failed counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ErrorKind {
    Transient(String),
    Permanent(String),
    MissingArticleId,
    NotDispatched(String),
}

impl From<ExtractionError> for ErrorKind {
    fn from(e: ExtractionError) -> Self {
        match e {
            ExtractionError::Transient(msg) => ErrorKind::Transient(msg),
            ExtractionError::Permanent(msg) => ErrorKind::Permanent(msg),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient(msg) => write!(f, "transient: {}", msg),
            ErrorKind::Permanent(msg) => write!(f, "permanent: {}", msg),
            ErrorKind::MissingArticleId => write!(f, "missing article id"),
            ErrorKind::NotDispatched(reason) => write!(f, "not dispatched: {}", reason),
        }
    }
}
