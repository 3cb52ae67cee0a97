//! Error types used across the Hostblock daemon and CLI.

use thiserror::Error;

/// Result type for Hostblock operations.
pub type HostblockResult<T> = Result<T, HostblockError>;

#[derive(Debug, Error)]
pub enum HostblockError {
    /// Malformed configuration: bad key, missing `%i` placeholder,
    /// unparseable integer. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Pattern failed to compile. Fatal at startup.
    #[error("regex error: {0}")]
    Regex(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// Advisory lock contention after retries. Fatal to the single call,
    /// not to the process.
    #[error("data file lock contention: {0}")]
    Lock(String),

    /// Firewall tool exited non-zero.
    #[error("{tool} exited with status {status}")]
    Subprocess { tool: String, status: i32 },

    /// Remote service returned non-200 or a body that does not parse.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Remote service returned 429; reports are gated until the hint elapses.
    #[error("rate limited by remote service (retry after {retry_after:?} seconds)")]
    RateLimited { retry_after: Option<u64> },

    /// Duplicate record or length mismatch detected at load time.
    #[error("data corruption: {0}")]
    DataCorruption(String),
}

// Implement From for common error types to enable `?` operator
impl From<std::io::Error> for HostblockError {
    fn from(err: std::io::Error) -> Self {
        HostblockError::Io(err.to_string())
    }
}

impl From<regex::Error> for HostblockError {
    fn from(err: regex::Error) -> Self {
        HostblockError::Regex(err.to_string())
    }
}

impl From<reqwest::Error> for HostblockError {
    fn from(err: reqwest::Error) -> Self {
        HostblockError::Protocol(err.to_string())
    }
}
