//! Structured job logging utilities.
//!
//! Provides consistent, structured logging for render jobs with
//! tracing spans and contextual information.

use tracing::{error, info, warn, Span};

use overlay_models::{JobId, JobRecord, JobState};

/// Job logger for structured logging with consistent formatting.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    operation: String,
}

impl JobLogger {
    /// Create a new job logger for a specific job and operation.
    pub fn new(job_id: &JobId, operation: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job completed: {}", message
        );
    }

    /// Log a terminal record at a level matching how it ended.
    pub fn log_outcome(&self, record: &JobRecord) {
        match record.state {
            JobState::Completed => self.log_completion(&format!(
                "output at {}",
                record
                    .output_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            )),
            JobState::Failed => {
                let error = record.error.as_ref();
                error!(
                    job_id = %self.job_id,
                    operation = %self.operation,
                    kind = error.map(|e| e.kind.as_str()).unwrap_or("unknown"),
                    exit_code = ?error.and_then(|e| e.exit_code),
                    "Job failed: {}", record.message
                );
            }
            JobState::Cancelled => info!(
                job_id = %self.job_id,
                operation = %self.operation,
                "Job cancelled"
            ),
            JobState::Queued | JobState::Processing => self.log_progress(&record.message),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Span carrying the job id, entered for the whole render task.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            operation = %self.operation
        )
    }
}
