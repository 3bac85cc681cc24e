//! Status snapshot returned to pollers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobError, JobId, JobRecord, JobState};

/// Read-only view of a job for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub state: JobState,
    /// Only present while processing or once completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl From<&JobRecord> for JobStatusView {
    fn from(record: &JobRecord) -> Self {
        let progress = match record.state {
            JobState::Processing | JobState::Completed => Some(record.progress),
            _ => None,
        };
        Self {
            job_id: record.id.clone(),
            state: record.state,
            progress,
            message: record.message.clone(),
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            error: record.error.clone(),
        }
    }
}
