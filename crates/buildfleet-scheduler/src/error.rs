//! Scheduler error taxonomy.

use buildfleet_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Someone else changed the record first. Retried against fresh data,
    /// never surfaced to end users.
    #[error("contention: {0}")]
    Contention(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Duplicate(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// A collaborator (cloud, worker channel, secrets, artifacts) failed.
    #[error("{0}")]
    Collaborator(buildfleet_core::Error),

    #[error("storage error: {0}")]
    Storage(DbError),
}

impl SchedulerError {
    pub fn is_contention(&self) -> bool {
        matches!(self, SchedulerError::Contention(_))
    }
}

impl From<DbError> for SchedulerError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::VersionConflict { entity, expected } => {
                SchedulerError::Contention(format!("{entity} moved past {expected}"))
            }
            DbError::NotFound(what) => SchedulerError::NotFound(what),
            DbError::Duplicate(what) => SchedulerError::Duplicate(what),
            DbError::InvalidState(msg) => SchedulerError::InvalidState(msg),
            other => SchedulerError::Storage(other),
        }
    }
}

impl From<buildfleet_core::Error> for SchedulerError {
    fn from(err: buildfleet_core::Error) -> Self {
        use buildfleet_core::Error;
        match err {
            Error::NotFound(what) => SchedulerError::NotFound(what),
            Error::InvalidTransition(msg) => SchedulerError::InvalidState(msg),
            Error::Unauthorized(msg) => SchedulerError::Unauthorized(msg),
            Error::Timeout(msg) => SchedulerError::Timeout(msg),
            other => SchedulerError::Collaborator(other),
        }
    }
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
