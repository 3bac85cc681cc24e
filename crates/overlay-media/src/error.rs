//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;

use overlay_models::OverlayKind;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while probing or invoking the media tools.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{0} not found")]
    ToolNotFound(String),

    #[error("FFprobe command failed: {message}")]
    FfprobeFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Invalid video file: {0}")]
    InvalidVideo(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl MediaError {
    /// Create an FFprobe failure error.
    pub fn ffprobe_failed(message: impl Into<String>, stderr: Option<String>) -> Self {
        Self::FfprobeFailed {
            message: message.into(),
            stderr,
        }
    }

    pub fn invalid_video(message: impl Into<String>) -> Self {
        Self::InvalidVideo(message.into())
    }
}

/// An overlay list that cannot be rendered against the probed source.
///
/// `index` is the overlay's position in the submitted list.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("overlay {index}: invalid time window {start}..{end}")]
    InvalidTiming { index: usize, start: f64, end: f64 },

    #[error("overlay {index}: ends at {end}s but the source is only {duration}s long")]
    OutsideDuration {
        index: usize,
        end: f64,
        duration: f64,
    },

    #[error("overlay {index}: position ({x}, {y}) is outside the {width}x{height} frame")]
    OutOfFrame {
        index: usize,
        x: f64,
        y: f64,
        width: u32,
        height: u32,
    },

    #[error("overlay {index}: {field} = {value} is outside {min}..={max}")]
    OutOfRange {
        index: usize,
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("overlay {index}: unsupported color {color:?}")]
    InvalidColor { index: usize, color: String },

    #[error("overlay {index}: text content is empty")]
    EmptyText { index: usize },

    #[error("overlay {index}: {kind} source {path} does not exist")]
    MissingSource {
        index: usize,
        kind: OverlayKind,
        path: PathBuf,
    },

    #[error("overlay {index}: invalid trim window {start}..{end}")]
    InvalidTrim { index: usize, start: f64, end: f64 },

    #[error("source video has no usable frame size ({width}x{height})")]
    InvalidSource { width: u32, height: u32 },
}

impl PlanError {
    /// Index of the offending overlay, if the error is overlay-specific.
    pub fn overlay_index(&self) -> Option<usize> {
        match self {
            PlanError::InvalidTiming { index, .. }
            | PlanError::OutsideDuration { index, .. }
            | PlanError::OutOfFrame { index, .. }
            | PlanError::OutOfRange { index, .. }
            | PlanError::InvalidColor { index, .. }
            | PlanError::EmptyText { index }
            | PlanError::MissingSource { index, .. }
            | PlanError::InvalidTrim { index, .. } => Some(*index),
            PlanError::InvalidSource { .. } => None,
        }
    }
}
