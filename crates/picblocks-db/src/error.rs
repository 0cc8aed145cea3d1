//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed database or report document: JSON parse failure, integer
    /// key coercion failure, or a dangling id reference.
    #[error("corrupt database: {0}")]
    CorruptDb(String),
}
