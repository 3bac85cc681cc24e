#![deny(unreachable_patterns)]
//! FFmpeg CLI wrapper for overlay rendering.
//!
//! This crate provides:
//! - Source probing via ffprobe
//! - Translation of an overlay list into an ordered filter plan
//! - Type-safe FFmpeg command building
//! - Progress tracking from `-progress pipe:2` and stats output
//! - Process supervision with cancellation and stall detection

pub mod command;
pub mod error;
pub mod filters;
pub mod plan;
pub mod probe;
pub mod progress;

pub use command::{
    check_tool, FfmpegCommand, FfmpegRunner, ProcessRunner, RenderCommand, RunOutcome,
};
pub use error::{MediaError, MediaResult, PlanError};
pub use plan::{build_plan, AssetLookup, FilterPlan, FilterStage, FsAssets, PlanInput};
pub use probe::{FfprobeProbe, SourceProbe, VideoInfo};
pub use progress::{is_progress_field, ProgressTracker, ProgressUpdate};
