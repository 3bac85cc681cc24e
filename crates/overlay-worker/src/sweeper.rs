//! Background retention of finished jobs.
//!
//! Terminal records older than the retention window are removed together with
//! their rendered output. Queued and running jobs are never touched,
//! regardless of age.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use overlay_models::JobRecord;
use overlay_store::{JobStore, StoreResult};

use crate::config::WorkerConfig;

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired records found
    pub scanned: usize,
    /// Records deleted
    pub removed: usize,
    /// Records that could not be cleaned up
    pub failed: usize,
}

/// Periodic cleanup of expired terminal jobs.
pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
    retention: Duration,
    interval: Duration,
    remove_inputs: bool,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn JobStore>, retention: Duration, interval: Duration) -> Self {
        Self {
            store,
            retention,
            interval,
            remove_inputs: false,
        }
    }

    pub fn from_config(store: Arc<dyn JobStore>, config: &WorkerConfig) -> Self {
        Self::new(store, config.retention, config.sweep_interval)
            .with_remove_inputs(config.remove_inputs)
    }

    /// Also delete each job's source video.
    pub fn with_remove_inputs(mut self, remove_inputs: bool) -> Self {
        self.remove_inputs = remove_inputs;
        self
    }

    /// Sweep every `interval` until `shutdown` fires. The first pass runs
    /// immediately.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            retention_secs = self.retention.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Starting retention sweeper"
        );

        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sweep_once(Utc::now()).await {
                Ok(report) if report.scanned > 0 => info!(
                    scanned = report.scanned,
                    removed = report.removed,
                    failed = report.failed,
                    "Retention sweep complete"
                ),
                Ok(_) => debug!("Retention sweep found nothing to remove"),
                Err(e) => error!("Retention sweep error: {}", e),
            }
        }

        info!("Retention sweeper stopped");
    }

    /// Run a single pass as of `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> StoreResult<SweepReport> {
        let cutoff = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let expired = move |record: &JobRecord| is_expired(record, cutoff);

        let candidates = self.store.scan(&expired).await?;
        let mut report = SweepReport {
            scanned: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            let id = candidate.id.clone();

            // The record may have changed since the scan
            let record = match self.store.get(&id).await {
                Ok(record) => record,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Failed to reload job for sweep");
                    report.failed += 1;
                    continue;
                }
            };
            if !is_expired(&record, cutoff) {
                continue;
            }

            if let Err(e) = remove_job_files(&record, self.remove_inputs).await {
                warn!(job_id = %id, error = %e, "Failed to remove job files");
                report.failed += 1;
                continue;
            }

            match self.store.delete(&id).await {
                Ok(_) => {
                    debug!(job_id = %id, state = %record.state, "Swept expired job");
                    report.removed += 1;
                }
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Failed to delete expired job");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

fn is_expired(record: &JobRecord, cutoff: DateTime<Utc>) -> bool {
    record.is_terminal() && record.completed_at.is_some_and(|at| at < cutoff)
}

/// Remove a job's output (and optionally its input). Missing files are fine.
pub(crate) async fn remove_job_files(
    record: &JobRecord,
    remove_input: bool,
) -> std::io::Result<()> {
    if let Some(output) = &record.output_path {
        remove_if_present(output).await?;
    }
    if remove_input {
        remove_if_present(&record.input_path).await?;
    }
    Ok(())
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
