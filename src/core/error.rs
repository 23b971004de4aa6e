use thiserror::Error;

/// Universal error type for shim operations.
///
/// Every fallible call in the crate returns this type. The progressive
/// stream is the only producer of [`ShimError::TryLater`]; every other
/// variant is fatal to the call that produced it.
#[derive(Debug, Error)]
pub enum ShimError {
    /// The requested block is not loaded yet. Repeat the exact same call
    /// once the driver reports progress.
    #[error("waiting for data (block {block})")]
    TryLater { block: usize },

    /// A precondition on the arguments was violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An allocation could not be satisfied.
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    /// End of stream reached unexpectedly
    #[error("unexpected end of stream")]
    UnexpectedEndOfStream,

    /// Invalid byte range requested
    #[error("invalid byte range: {begin}..{end}")]
    InvalidByteRange { begin: usize, end: usize },

    /// I/O failure inside a range fetcher
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

/// The four failure kinds visible across the export boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RetryLater,
    InvalidArgument,
    OutOfMemory,
    Generic,
}

impl ShimError {
    /// Collapses the error into its boundary kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShimError::TryLater { .. } => ErrorKind::RetryLater,
            ShimError::InvalidArgument(_) | ShimError::InvalidByteRange { .. } => {
                ErrorKind::InvalidArgument
            }
            ShimError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            ShimError::UnexpectedEndOfStream | ShimError::Io(_) | ShimError::Generic(_) => {
                ErrorKind::Generic
            }
        }
    }

    /// Returns true for the retryable "no data yet" condition.
    pub fn is_try_later(&self) -> bool {
        matches!(self, ShimError::TryLater { .. })
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ShimError::InvalidArgument(msg.into())
    }
}

/// Result type alias for shim operations
pub type ShimResult<T> = Result<T, ShimError>;
