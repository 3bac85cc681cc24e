//! Scheduler error types.

use thiserror::Error;

use overlay_models::{InvalidTransition, JobId, JobState};
use overlay_store::StoreError;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {id} has no result yet (state: {state})")]
    NotReady { id: JobId, state: JobState },

    #[error("Job {id} already finished (state: {state})")]
    AlreadyTerminal { id: JobId, state: JobState },

    #[error("Job {id} is still active (state: {state})")]
    JobActive { id: JobId, state: JobState },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => SchedulerError::NotFound(id),
            other => SchedulerError::Store(other),
        }
    }
}

impl SchedulerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SchedulerError::NotFound(_))
    }
}
