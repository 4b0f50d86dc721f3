//! Error taxonomy shared by the scheduler, the queue and the orchestrator.
use thiserror::Error;

pub use crate::posting::PostingError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A job queue operation failed at the storage layer.
#[derive(Debug, Error)]
#[error("persistence error: {0:#}")]
pub struct PersistenceError(#[from] pub anyhow::Error);

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        PersistenceError(err.into())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Posting(#[from] PostingError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("cancelled by user")]
    UserCancelled,
    #[error("a bulk post is already active")]
    AlreadyActive,
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }
}
