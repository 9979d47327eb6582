//! Error types for the readback pipeline.

use thiserror::Error;

/// Main error type for readback operations.
#[derive(Error, Debug)]
pub enum ReadbackError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("GPU context lost")]
    ContextLost,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReadbackError {
    /// Whether this error came from a failed allocation.
    ///
    /// The scaler uses this to decide when to retry at a lower quality tier.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, Self::OutOfMemory(_))
    }
}

/// Result type alias for readback operations.
pub type Result<T> = std::result::Result<T, ReadbackError>;
