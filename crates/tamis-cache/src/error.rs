use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure while reading a response body.
///
/// `Clone` so that a teed stream can report the same failure on both
/// branches.
#[derive(Debug, Clone, Error)]
pub enum BodyError {
    #[error("body stream failed: {0}")]
    Stream(Arc<str>),
    #[error("body stream aborted")]
    Aborted,
}

impl BodyError {
    pub fn stream(message: impl std::fmt::Display) -> Self {
        BodyError::Stream(message.to_string().into())
    }
}

/// Failure of an origin fetch. Propagated to the client as-is.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid resource address: {0}")]
    Address(String),
    #[error(transparent)]
    Body(#[from] BodyError),
}

/// Failure talking to the remote key/value backend.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("key/value I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key/value protocol error: {0}")]
    Protocol(String),
    #[error("key/value server error: {0}")]
    Server(String),
}

/// A stored record that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record truncated")]
    Truncated,
    #[error("unexpected record magic {0}")]
    Magic(u32),
    #[error("string is not valid UTF-8")]
    Utf8,
    #[error("invalid HTTP status {0}")]
    Status(u16),
    #[error("invalid header {0:?}")]
    Header(String),
}

/// Why a cache fill was abandoned. Never surfaces to the client.
#[derive(Debug, Error)]
pub enum FillError {
    #[error("response body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("response body length {actual} does not match announced {announced}")]
    LengthMismatch { announced: u64, actual: u64 },
    #[error("cache fill timed out")]
    Timeout,
    #[error("cache fill cancelled")]
    Cancelled,
    #[error(transparent)]
    Body(#[from] BodyError),
}
