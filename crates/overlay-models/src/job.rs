//! Render job records and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::Overlay;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Render job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a render slot
    #[default]
    Queued,
    /// Holding a slot; probing, planning or rendering
    Processing,
    /// Output produced
    Completed,
    /// Plan, process or I/O failure
    Failed,
    /// Cancelled by request
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Check if this is a terminal state (no more transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A rejected state change. Reported to the caller, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid job transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// Machine-readable failure category stored on a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Overlay list inconsistent with the source video
    Plan,
    /// External tool exited unsuccessfully
    Process,
    /// No progress within the stall window
    Timeout,
    /// Job store unavailable
    Store,
    /// Probe, spawn or filesystem failure
    Io,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobErrorKind::Plan => "plan",
            JobErrorKind::Process => "process",
            JobErrorKind::Timeout => "timeout",
            JobErrorKind::Store => "store",
            JobErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error descriptor recorded on a FAILED job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Tail of the tool's diagnostic output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
            diagnostics: None,
        }
    }

    pub fn plan(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Plan, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Io, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Timeout, message)
    }

    pub fn process(exit_code: Option<i32>, diagnostics: impl Into<String>) -> Self {
        let message = match exit_code {
            Some(code) => format!("ffmpeg exited with code {}", code),
            None => "ffmpeg terminated without an exit code".to_string(),
        };
        let diagnostics = diagnostics.into();
        Self {
            kind: JobErrorKind::Process,
            message,
            exit_code,
            diagnostics: (!diagnostics.is_empty()).then_some(diagnostics),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A render job as persisted in the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job ID
    pub id: JobId,

    /// Current state
    #[serde(default)]
    pub state: JobState,

    /// Progress (0-100)
    #[serde(default)]
    pub progress: u8,

    /// Human-readable status
    #[serde(default)]
    pub message: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Admission timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Set once the job reaches a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Source video
    pub input_path: PathBuf,

    /// Rendered video (set on completion)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,

    /// Overlays to composite, in drawing order
    #[serde(default)]
    pub overlays: Vec<Overlay>,

    /// Probed source duration in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_duration: Option<f64>,

    /// Failure descriptor (if failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl JobRecord {
    /// Create a new queued job.
    pub fn new(input_path: impl Into<PathBuf>, overlays: Vec<Overlay>) -> Self {
        Self {
            id: JobId::new(),
            state: JobState::Queued,
            progress: 0,
            message: "Job queued".to_string(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            input_path: input_path.into(),
            output_path: None,
            overlays,
            source_duration: None,
            error: None,
        }
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn transition(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// QUEUED -> PROCESSING.
    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.transition(JobState::Processing)?;
        self.started_at = Some(Utc::now());
        self.message = "Analyzing video...".to_string();
        Ok(())
    }

    /// Record a new progress value. Returns false (and changes nothing)
    /// unless the job is processing and the value moves forward.
    pub fn record_progress(&mut self, progress: u8) -> bool {
        let progress = progress.min(100);
        if self.state != JobState::Processing || progress <= self.progress {
            return false;
        }
        self.progress = progress;
        self.message = format!("Processing: {}%", progress);
        true
    }

    /// PROCESSING -> COMPLETED.
    pub fn complete(&mut self, output_path: impl Into<PathBuf>) -> Result<(), InvalidTransition> {
        self.transition(JobState::Completed)?;
        self.progress = 100;
        self.output_path = Some(output_path.into());
        self.message = "Processing complete".to_string();
        Ok(())
    }

    /// PROCESSING -> FAILED.
    pub fn fail(&mut self, error: JobError) -> Result<(), InvalidTransition> {
        self.transition(JobState::Failed)?;
        self.message = format!("Processing failed: {}", error.message);
        self.error = Some(error);
        Ok(())
    }

    /// QUEUED|PROCESSING -> CANCELLED.
    pub fn cancel(&mut self) -> Result<(), InvalidTransition> {
        self.transition(JobState::Cancelled)?;
        self.message = "Job cancelled".to_string();
        Ok(())
    }
}
