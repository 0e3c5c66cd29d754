/// Core error types shared across the import cache
use thiserror::Error;

/// Error taxonomy for the cache.
///
/// Provisioning errors are returned to the caller untouched; the cache never
/// falls back to a cold start on its own. Background threads (evictor, async
/// kills) log errors and keep running.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Interpreter error: {0}")]
    Interpreter(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cache full: {0}")]
    Capacity(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

impl From<nix::errno::Errno> for CacheError {
    fn from(err: nix::errno::Errno) -> Self {
        CacheError::Sandbox(err.to_string())
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
