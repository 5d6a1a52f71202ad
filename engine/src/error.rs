//! Error types for the mirror engine.

use crate::PersisterId;
use thiserror::Error;

/// All possible errors from the mirror engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// An id argument had an unacceptable shape. Raised synchronously at the
    /// call boundary and never retried.
    #[error("invalid id argument: {0}")]
    InvalidArgument(String),

    /// The persisted store reported a failure. During reconciliation this
    /// aborts the whole run; inside a write queue it feeds the retry policy.
    #[error("storage backend failure: {0}")]
    Storage(String),

    /// A persister handle that was never attached, or already detached.
    #[error("unknown persister: {0}")]
    UnknownPersister(PersisterId),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
