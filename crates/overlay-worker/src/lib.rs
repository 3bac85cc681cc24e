//! Overlay render worker.
//!
//! This crate provides:
//! - Bounded, first-come first-served admission of render jobs
//! - The job scheduler driving probe, plan and render for each job
//! - Retention sweeping of finished jobs
//! - Structured job logging
//! - Graceful shutdown

pub mod config;
pub mod error;
pub mod governor;
pub mod logging;
pub mod scheduler;
pub mod sweeper;

pub use config::WorkerConfig;
pub use error::{SchedulerError, SchedulerResult};
pub use governor::{Governor, RenderSlot};
pub use logging::JobLogger;
pub use scheduler::JobScheduler;
pub use sweeper::{RetentionSweeper, SweepReport};
