//! Database error types.

use buildfleet_core::Version;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Optimistic-concurrency check failed: someone else committed first.
    #[error("version conflict on {entity}: expected {expected}")]
    VersionConflict { entity: String, expected: Version },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, DbError::VersionConflict { .. })
    }
}

impl From<buildfleet_core::Error> for DbError {
    fn from(err: buildfleet_core::Error) -> Self {
        match err {
            buildfleet_core::Error::NotFound(msg) => DbError::NotFound(msg),
            buildfleet_core::Error::InvalidInput(msg) => DbError::Corrupt(msg),
            other => DbError::InvalidState(other.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
