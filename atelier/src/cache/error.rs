//! Cache error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing store rejected the operation.
    #[error("cache storage error: {0}")]
    Storage(String),
}
