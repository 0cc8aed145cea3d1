//! CLI error type and exit-code mapping.

use thiserror::Error;

use picblocks_core::{HashError, ReportError};
use picblocks_db::DbError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Hash(#[from] HashError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl CliError {
    /// Process exit code: 1 for usage and missing-input problems, 2 for a
    /// corrupt database or report document.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Db(DbError::CorruptDb(_)) => 2,
            Self::Report(ReportError::Json(_)) => 2,
            _ => 1,
        }
    }
}
