//! Error types for workq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    #[error("{0} is already started")]
    AlreadyStarted(&'static str),

    #[error("{0} has not been started")]
    NotStarted(&'static str),

    #[error("work group already registered: {0}")]
    DuplicateWorkGroup(String),

    #[error("invalid work group {name}: {reason}")]
    InvalidWorkGroup { name: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid schedule expression {expr:?}: {message}")]
    Schedule { expr: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("heartbeat error: {0}")]
    HeartBeat(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error that can be sent across threads.
///
/// Message handlers report failures with this type so user code is free to
/// use whatever error type it likes.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
