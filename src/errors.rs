//! Crate-wide error type.
//!
//! Training and prediction fail atomically: any error raised by a worker is
//! surfaced at the synchronisation barrier and no partial model or result is
//! returned. Serialization has its own error types in [`crate::io`].

/// Errors raised by training, prediction, and merging.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Structural mismatch in the inputs: wrong lengths, unknown names,
    /// unsupported rule/type combinations.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A numeric value outside its permitted range.
    #[error("domain error: {0}")]
    Domain(String),

    /// An internal invariant was broken mid-algorithm.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The user-interrupt probe returned true; partial results discarded.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    pub(crate) fn domain(message: impl Into<String>) -> Self {
        Error::Domain(message.into())
    }

    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
