//! Error types for gazer-rs.

use thiserror::Error;

/// Error type returned by user handlers.
///
/// Handlers are written by library users, so they get the flexibility of
/// `anyhow` and `?` on whatever they call. The loops wrap it in
/// [`Error::Handler`] when it crosses back into the library.
pub type HandlerError = anyhow::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("storage error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("handler error: {0:#}")]
    Handler(HandlerError),

    #[error("worker pool is closed")]
    PoolClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the failure belongs to one queue item (bad encoding, handler
    /// rejection) rather than the store or the pool. Loops move straight on
    /// to the next item after these and back off after anything else.
    pub fn is_item_error(&self) -> bool {
        matches!(self, Error::Decode(_) | Error::Encode(_) | Error::Handler(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
