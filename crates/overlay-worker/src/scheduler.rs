//! Render job scheduler.
//!
//! Owns the job state machine. Submissions go through a FIFO channel to a
//! single dispatcher task, which waits on the [`Governor`] for each job in
//! turn and spawns the render once a slot is granted. Every write to a record
//! happens under that job's write lock, so a cancel racing an admission never
//! produces two writers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use overlay_media::{
    build_plan, AssetLookup, FfmpegCommand, ProcessRunner, ProgressTracker, ProgressUpdate,
    RunOutcome, SourceProbe,
};
use overlay_models::{
    InvalidTransition, JobError, JobId, JobRecord, JobState, JobStatusView, Overlay,
};
use overlay_store::JobStore;

use crate::config::WorkerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::governor::{Governor, RenderSlot};
use crate::logging::JobLogger;
use crate::sweeper::remove_job_files;

/// Per-job coordination state, alive from submission until the job is terminal.
#[derive(Debug)]
struct JobSlot {
    cancel: CancellationToken,
    write: Mutex<()>,
}

/// How a render ended before the terminal write.
enum Termination {
    Completed(PathBuf),
    Failed(JobError),
    Cancelled,
}

struct Inner {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    probe: Arc<dyn SourceProbe>,
    runner: Arc<dyn ProcessRunner>,
    assets: Arc<dyn AssetLookup>,
    governor: Governor,
    slots: Mutex<HashMap<JobId, Arc<JobSlot>>>,
    submissions: mpsc::UnboundedSender<JobId>,
    shutdown: CancellationToken,
}

/// Accepts render jobs and drives them to a terminal state.
pub struct JobScheduler {
    inner: Arc<Inner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Start the scheduler and its dispatcher task. Must be called inside a
    /// tokio runtime.
    pub fn start(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        probe: Arc<dyn SourceProbe>,
        runner: Arc<dyn ProcessRunner>,
        assets: Arc<dyn AssetLookup>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            governor: Governor::new(config.max_concurrent_jobs),
            config,
            store,
            probe,
            runner,
            assets,
            slots: Mutex::new(HashMap::new()),
            submissions: tx,
            shutdown: CancellationToken::new(),
        });

        info!(
            max_concurrent_jobs = inner.governor.capacity(),
            output_dir = %inner.config.output_dir.display(),
            "Starting job scheduler"
        );

        let dispatcher = tokio::spawn(dispatch(inner.clone(), rx));
        Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn governor(&self) -> &Governor {
        &self.inner.governor
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Jobs submitted to this scheduler that have not reached a terminal state.
    pub async fn tracked_jobs(&self) -> usize {
        self.inner.slots.lock().await.len()
    }

    /// Create a QUEUED job and hand it to the dispatcher.
    pub async fn submit(
        &self,
        input_path: impl Into<PathBuf>,
        overlays: Vec<Overlay>,
    ) -> SchedulerResult<JobId> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }

        let record = JobRecord::new(input_path, overlays);
        let id = record.id.clone();
        self.inner.store.put(&id, &record).await?;

        let slot = Arc::new(JobSlot {
            cancel: self.inner.shutdown.child_token(),
            write: Mutex::new(()),
        });
        self.inner.slots.lock().await.insert(id.clone(), slot.clone());

        if self.inner.submissions.send(id.clone()).is_err() {
            // Dispatcher already gone
            let _ = self.inner.update_record(&slot, &id, |r| r.cancel().map(|_| true)).await;
            self.inner.forget(&id).await;
            return Err(SchedulerError::ShuttingDown);
        }

        metrics::counter!("overlay_jobs_submitted_total").increment(1);
        info!(
            job_id = %id,
            input = %record.input_path.display(),
            overlays = record.overlays.len(),
            "Job queued"
        );
        Ok(id)
    }

    /// Current status snapshot.
    pub async fn get_status(&self, id: &JobId) -> SchedulerResult<JobStatusView> {
        let record = self.inner.store.get(id).await?;
        Ok(JobStatusView::from(&record))
    }

    /// Output path of a completed job.
    pub async fn get_result(&self, id: &JobId) -> SchedulerResult<PathBuf> {
        let record = self.inner.store.get(id).await?;
        match (record.state, record.output_path) {
            (JobState::Completed, Some(path)) => Ok(path),
            (state, _) => Err(SchedulerError::NotReady {
                id: id.clone(),
                state,
            }),
        }
    }

    /// Cancel a queued or running job.
    ///
    /// A queued job is marked CANCELLED immediately and never takes a slot. A
    /// running job has its process terminated; its record turns CANCELLED once
    /// the process is gone.
    pub async fn cancel(&self, id: &JobId) -> SchedulerResult<()> {
        let slot = self.inner.slots.lock().await.get(id).cloned();

        let Some(slot) = slot else {
            // Not tracked by this scheduler; only an orphaned record can be
            // moved, and only if the state machine allows it
            let mut record = self.inner.store.get(id).await?;
            if record.is_terminal() {
                return Err(SchedulerError::AlreadyTerminal {
                    id: id.clone(),
                    state: record.state,
                });
            }
            record.cancel()?;
            self.inner.store.put(id, &record).await?;
            metrics::counter!("overlay_jobs_finished_total", "state" => "cancelled").increment(1);
            info!(job_id = %id, "Cancelled untracked job");
            return Ok(());
        };

        let _write = slot.write.lock().await;
        let mut record = self.inner.store.get(id).await?;
        match record.state {
            JobState::Queued => {
                record.cancel()?;
                self.inner.store.put(id, &record).await?;
                slot.cancel.cancel();
                self.inner.forget(id).await;
                metrics::counter!("overlay_jobs_finished_total", "state" => "cancelled")
                    .increment(1);
                info!(job_id = %id, "Cancelled queued job");
                Ok(())
            }
            JobState::Processing => {
                slot.cancel.cancel();
                info!(job_id = %id, "Cancellation requested for running job");
                Ok(())
            }
            state => Err(SchedulerError::AlreadyTerminal {
                id: id.clone(),
                state,
            }),
        }
    }

    /// Remove a finished job and its files.
    pub async fn delete(&self, id: &JobId) -> SchedulerResult<()> {
        let record = self.inner.store.get(id).await?;
        if !record.is_terminal() {
            return Err(SchedulerError::JobActive {
                id: id.clone(),
                state: record.state,
            });
        }

        remove_job_files(&record, self.inner.config.remove_inputs).await?;
        self.inner.store.delete(id).await?;
        info!(job_id = %id, "Job deleted");
        Ok(())
    }

    /// Stop admitting work, cancel running renders and wait for them to end.
    ///
    /// Jobs still waiting for a slot are marked CANCELLED.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down job scheduler");
        self.inner.shutdown.cancel();
        self.inner.governor.close();

        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatcher task ended abnormally");
            }
        }

        let leftover: Vec<(JobId, Arc<JobSlot>)> = self
            .inner
            .slots
            .lock()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        for (id, slot) in leftover {
            match self
                .inner
                .update_record(&slot, &id, |r| r.cancel().map(|_| true))
                .await
            {
                Ok(_) => {
                    metrics::counter!("overlay_jobs_finished_total", "state" => "cancelled")
                        .increment(1);
                    debug!(job_id = %id, "Cancelled queued job on shutdown");
                }
                Err(e) => warn!(job_id = %id, error = %e, "Failed to cancel job on shutdown"),
            }
            self.inner.forget(&id).await;
        }

        info!("Job scheduler stopped");
    }
}

/// Admit submissions one at a time, in order.
async fn dispatch(inner: Arc<Inner>, mut submissions: mpsc::UnboundedReceiver<JobId>) {
    let mut running = JoinSet::new();

    loop {
        let id = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            Some(_) = running.join_next(), if !running.is_empty() => continue,
            next = submissions.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };

        let Some(slot) = inner.slots.lock().await.get(&id).cloned() else {
            // Cancelled while queued
            continue;
        };

        let render_slot = tokio::select! {
            biased;
            _ = slot.cancel.cancelled() => continue,
            granted = inner.governor.acquire() => match granted {
                Some(granted) => granted,
                None => break,
            },
        };

        running.spawn(run_job(inner.clone(), id, slot, render_slot));
    }

    debug!(running = running.len(), "Dispatcher stopping, waiting for renders");
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Render task ended abnormally");
        }
    }
}

/// Drive one admitted job to a terminal state. `render_slot` is held until
/// the terminal state is written.
async fn run_job(inner: Arc<Inner>, id: JobId, slot: Arc<JobSlot>, render_slot: RenderSlot) {
    let logger = JobLogger::new(&id, "overlay_render");
    let span = logger.create_span();

    async move {
        let record = match inner
            .update_record(&slot, &id, |r| r.start().map(|_| true))
            .await
        {
            Ok(record) => record,
            Err(SchedulerError::InvalidTransition(e)) => {
                debug!(from = %e.from, "Admitted job is no longer queued, skipping");
                inner.forget(&id).await;
                return;
            }
            Err(e) => {
                logger.log_error(&format!("Failed to start job: {}", e));
                inner.forget(&id).await;
                return;
            }
        };
        logger.log_start(&format!(
            "{} overlay(s) on {}",
            record.overlays.len(),
            record.input_path.display()
        ));

        let termination = inner.render(&slot, &record, &logger).await;

        let finished = inner
            .update_record(&slot, &id, |r| {
                match &termination {
                    // Checked under the write lock so a cancel that raced a
                    // successful exit still wins
                    Termination::Completed(_) if slot.cancel.is_cancelled() => r.cancel(),
                    Termination::Completed(path) => r.complete(path.clone()),
                    Termination::Failed(error) => r.fail(error.clone()),
                    Termination::Cancelled => r.cancel(),
                }
                .map(|_| true)
            })
            .await;

        match finished {
            Ok(record) => {
                if record.state != JobState::Completed {
                    inner.discard_output(&id, &logger).await;
                }
                metrics::counter!("overlay_jobs_finished_total", "state" => record.state.as_str())
                    .increment(1);
                logger.log_outcome(&record);
            }
            Err(e) => logger.log_error(&format!("Failed to record final state: {}", e)),
        }

        inner.forget(&id).await;
        render_slot.release();
    }
    .instrument(span)
    .await
}

impl Inner {
    fn output_path(&self, id: &JobId) -> PathBuf {
        self.config.output_dir.join(format!("{}_output.mp4", id))
    }

    /// Best-effort removal of a partial render.
    async fn discard_output(&self, id: &JobId, logger: &JobLogger) {
        if let Err(e) = tokio::fs::remove_file(self.output_path(id)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                logger.log_warning(&format!("Failed to remove partial output: {}", e));
            }
        }
    }

    async fn forget(&self, id: &JobId) {
        self.slots.lock().await.remove(id);
    }

    /// Read-modify-write a record under its write lock. `apply` returns
    /// whether anything changed; unchanged records are not written back.
    async fn update_record<F>(
        &self,
        slot: &JobSlot,
        id: &JobId,
        apply: F,
    ) -> SchedulerResult<JobRecord>
    where
        F: FnOnce(&mut JobRecord) -> Result<bool, InvalidTransition>,
    {
        let _write = slot.write.lock().await;
        let mut record = self.store.get(id).await?;
        if apply(&mut record)? {
            self.store.put(id, &record).await?;
        }
        Ok(record)
    }

    /// Probe, plan and run. Store failures here are logged rather than fatal.
    async fn render(
        &self,
        slot: &JobSlot,
        record: &JobRecord,
        logger: &JobLogger,
    ) -> Termination {
        let id = &record.id;

        let probed = tokio::select! {
            biased;
            _ = slot.cancel.cancelled() => return Termination::Cancelled,
            probed = self.probe.probe(&record.input_path) => probed,
        };
        let info = match probed {
            Ok(info) => info,
            Err(e) => {
                return Termination::Failed(JobError::io(format!("Failed to probe source: {}", e)))
            }
        };

        let duration = info.known_duration();
        if let Err(e) = self
            .update_record(slot, id, |r| {
                r.source_duration = duration;
                Ok(true)
            })
            .await
        {
            logger.log_warning(&format!("Failed to store source duration: {}", e));
        }

        let plan = match build_plan(&record.overlays, &info, self.assets.as_ref()) {
            Ok(plan) => plan,
            Err(e) => return Termination::Failed(JobError::plan(e.to_string())),
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.config.output_dir).await {
            return Termination::Failed(JobError::io(format!(
                "Failed to create output directory {}: {}",
                self.config.output_dir.display(),
                e
            )));
        }

        let output = self.output_path(id);
        let command = FfmpegCommand::from_plan(&record.input_path, &output, &plan)
            .render_command(&self.config.ffmpeg_path);
        debug!(stages = plan.stages.len(), inputs = plan.inputs.len(), "Filter plan built");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = self
            .runner
            .run(&command, ProgressTracker::new(duration), tx, slot.cancel.clone());
        tokio::pin!(run);

        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                Some(update) = rx.recv() => self.persist_progress(slot, id, update, logger).await,
            }
        };
        while let Ok(update) = rx.try_recv() {
            self.persist_progress(slot, id, update, logger).await;
        }

        match outcome {
            RunOutcome::Success(path) => Termination::Completed(path),
            RunOutcome::Failure {
                exit_code,
                diagnostics,
            } => Termination::Failed(JobError::process(exit_code, diagnostics)),
            RunOutcome::Cancelled => Termination::Cancelled,
            RunOutcome::Stalled { idle } => Termination::Failed(JobError::timeout(format!(
                "No progress for {}s",
                idle.as_secs()
            ))),
        }
    }

    async fn persist_progress(
        &self,
        slot: &JobSlot,
        id: &JobId,
        update: ProgressUpdate,
        logger: &JobLogger,
    ) {
        let result = self
            .update_record(slot, id, |r| {
                Ok(match update {
                    ProgressUpdate::Percent(p) => r.record_progress(p),
                    ProgressUpdate::Indeterminate if r.state == JobState::Processing => {
                        r.message = "Processing...".to_string();
                        true
                    }
                    ProgressUpdate::Indeterminate => false,
                })
            })
            .await;

        match result {
            Ok(record) => logger.log_progress(&record.message),
            Err(e) => logger.log_warning(&format!("Failed to persist progress: {}", e)),
        }
    }
}
