//! Error types for the throttle crate.

use thiserror::Error;

use crate::mesh::ClusterError;

/// Main error type for throttle operations.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Malformed address range text
    #[error("Format error: {0}")]
    Format(String),

    /// A quota with a non-positive rate or burst reached the limiter
    #[error("Invalid quota: max_rate={max_rate}, max_burst={max_burst} (both must be at least 1)")]
    InvalidQuota { max_rate: i64, max_burst: i64 },

    /// The store's conditional writes did not converge within the retry budget
    #[error("Rate limit store update for '{identity}' failed after {attempts} attempts")]
    ConcurrencyExhausted { identity: String, attempts: u32 },

    /// Store backend failures (transport, decoding)
    #[error("Store error: {0}")]
    Store(String),

    /// Cluster membership errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for throttle operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
