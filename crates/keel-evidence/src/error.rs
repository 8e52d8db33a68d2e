//! Error types for keel-evidence.

use thiserror::Error;

/// Errors raised by the evidence pool.
#[derive(Debug, Error)]
pub enum EvidenceError {
    /// The evidence is malformed or internally inconsistent.
    #[error("invalid evidence: {0}")]
    Invalid(String),

    /// The evidence payload exceeds the per-record cap.
    #[error("evidence payload of {size} bytes exceeds maximum of {max}")]
    TooLarge {
        /// Payload size.
        size: usize,
        /// The per-record cap.
        max: usize,
    },

    /// The pool has shut down and accepts no more evidence.
    #[error("evidence pool closed")]
    PoolClosed,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EvidenceError>;
