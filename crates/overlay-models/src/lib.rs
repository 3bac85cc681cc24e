//! Shared data models for the overlay render service.
//!
//! This crate provides Serde-serializable types for:
//! - Render jobs, their state machine and error descriptors
//! - Timed overlays (text, image, clip)
//! - Status snapshots handed to callers

pub mod job;
pub mod job_status;
pub mod overlay;

// Re-export common types
pub use job::{InvalidTransition, JobError, JobErrorKind, JobId, JobRecord, JobState};
pub use job_status::JobStatusView;
pub use overlay::{
    ClipOverlay, ImageOverlay, Overlay, OverlayKind, Position, Size, TextOverlay, TimeWindow,
};
