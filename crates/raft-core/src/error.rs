//! # error
//!
//! why: give persistence and configuration failures a typed home
//! relations: returned by state.rs codecs and config.rs validation
//! what: CoreError, CoreResult

use thiserror::Error;

/// Result type for raft-core operations
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Errors raised by raft-core
#[derive(Debug, Error)]
pub enum CoreError {
    /// Persisted state could not be encoded or decoded
    #[error("state codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Timing configuration is unusable
    #[error("invalid configuration: {0}")]
    Config(String),
}
