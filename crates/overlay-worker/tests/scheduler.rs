//! Scheduler integration tests against fake media collaborators.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use overlay_media::{
    MediaError, MediaResult, ProcessRunner, ProgressTracker, ProgressUpdate, RenderCommand,
    RunOutcome, SourceProbe, VideoInfo,
};
use overlay_models::{JobErrorKind, JobId, JobRecord, JobState, Overlay};
use overlay_store::{JobStore, MemoryJobStore, RecordFilter, StoreResult};
use overlay_worker::{JobScheduler, SchedulerError, WorkerConfig};

const WAIT: Duration = Duration::from_secs(5);

/// Probe reporting a fixed 10 s 1280x720 source, or failing for `missing.mp4`.
struct FakeProbe;

#[async_trait]
impl SourceProbe for FakeProbe {
    async fn probe(&self, path: &Path) -> MediaResult<VideoInfo> {
        if path.ends_with("missing.mp4") {
            return Err(MediaError::FileNotFound(path.to_path_buf()));
        }
        Ok(VideoInfo {
            duration: 10.0,
            width: 1280,
            height: 720,
            fps: 30.0,
            codec: "h264".to_string(),
        })
    }
}

#[derive(Clone, Copy)]
enum Behavior {
    /// Report half way, wait, then succeed
    Succeed(Duration),
    /// Exit with the given code
    Fail(i32),
    /// Report stalled output
    Stall,
    /// Run until cancelled
    Block,
}

/// Runner recording what it was asked to do.
struct FakeRunner {
    behavior: Behavior,
    started: Mutex<Vec<PathBuf>>,
    commands: Mutex<Vec<RenderCommand>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeRunner {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            started: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.commands.lock().unwrap().len()
    }

    fn started(&self) -> Vec<PathBuf> {
        self.started.lock().unwrap().clone()
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(
        &self,
        command: &RenderCommand,
        mut tracker: ProgressTracker,
        progress: mpsc::UnboundedSender<ProgressUpdate>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let input = command
            .args
            .iter()
            .position(|a| a == "-i")
            .map(|i| PathBuf::from(&command.args[i + 1]))
            .unwrap();
        self.started.lock().unwrap().push(input);
        self.commands.lock().unwrap().push(command.clone());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let outcome = match self.behavior {
            Behavior::Succeed(hold) => {
                if let Some(update) = tracker.observe("out_time_us=5000000") {
                    progress.send(update).unwrap();
                }
                tokio::select! {
                    _ = cancel.cancelled() => RunOutcome::Cancelled,
                    _ = tokio::time::sleep(hold) => RunOutcome::Success(command.output.clone()),
                }
            }
            Behavior::Fail(code) => RunOutcome::Failure {
                exit_code: Some(code),
                diagnostics: "Error initializing complex filters.".to_string(),
            },
            Behavior::Stall => RunOutcome::Stalled {
                idle: Duration::from_secs(300),
            },
            Behavior::Block => {
                cancel.cancelled().await;
                RunOutcome::Cancelled
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Memory store whose first `put` lingers after writing, widening the gap
/// between a submission being stored and being tracked.
struct SlowFirstPut {
    inner: MemoryJobStore,
    delayed: AtomicBool,
}

#[async_trait]
impl JobStore for SlowFirstPut {
    async fn put(&self, id: &JobId, record: &JobRecord) -> StoreResult<()> {
        self.inner.put(id, record).await?;
        if !self.delayed.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(())
    }

    async fn get(&self, id: &JobId) -> StoreResult<JobRecord> {
        self.inner.get(id).await
    }

    async fn delete(&self, id: &JobId) -> StoreResult<bool> {
        self.inner.delete(id).await
    }

    async fn scan(&self, filter: RecordFilter<'_>) -> StoreResult<Vec<JobRecord>> {
        self.inner.scan(filter).await
    }
}

struct Harness {
    scheduler: JobScheduler,
    store: Arc<MemoryJobStore>,
    runner: Arc<FakeRunner>,
    dir: TempDir,
}

fn harness(capacity: usize, behavior: Behavior) -> Harness {
    let dir = TempDir::new().unwrap();
    let config = WorkerConfig {
        max_concurrent_jobs: capacity,
        output_dir: dir.path().join("results"),
        ..WorkerConfig::default()
    };
    let store = Arc::new(MemoryJobStore::new());
    let runner = FakeRunner::new(behavior);
    let assets: HashSet<PathBuf> = HashSet::new();

    let scheduler = JobScheduler::start(
        config,
        store.clone(),
        Arc::new(FakeProbe),
        runner.clone(),
        Arc::new(assets),
    );
    Harness {
        scheduler,
        store,
        runner,
        dir,
    }
}

fn caption() -> Vec<Overlay> {
    vec![Overlay::text("Hello", 10.0, 20.0, 0.0, 5.0)]
}

async fn wait_for_state(scheduler: &JobScheduler, id: &JobId, wanted: JobState) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status = scheduler.get_status(id).await.unwrap();
        if status.state == wanted {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {} waiting for {}",
            id,
            status.state,
            wanted
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until_terminal(scheduler: &JobScheduler, id: &JobId) -> JobState {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status = scheduler.get_status(id).await.unwrap();
        if status.state.is_terminal() {
            return status.state;
        }
        assert!(tokio::time::Instant::now() < deadline, "job {} never finished", id);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_text_overlay_completes() {
    let h = harness(2, Behavior::Succeed(Duration::from_millis(50)));
    let id = h.scheduler.submit("/videos/in.mp4", caption()).await.unwrap();

    assert_eq!(wait_until_terminal(&h.scheduler, &id).await, JobState::Completed);

    let status = h.scheduler.get_status(&id).await.unwrap();
    assert_eq!(status.progress, Some(100));
    assert_eq!(status.message, "Processing complete");
    assert!(status.started_at.is_some());
    assert!(status.completed_at.is_some());
    assert!(status.error.is_none());

    let expected = h.dir.path().join("results").join(format!("{}_output.mp4", id));
    assert_eq!(h.scheduler.get_result(&id).await.unwrap(), expected);

    let record = h.store.get(&id).await.unwrap();
    assert_eq!(record.source_duration, Some(10.0));

    let commands = h.runner.commands.lock().unwrap().clone();
    assert_eq!(commands.len(), 1);
    let graph = commands[0]
        .args
        .iter()
        .position(|a| a == "-filter_complex")
        .map(|i| commands[0].args[i + 1].clone())
        .unwrap();
    assert!(graph.starts_with("[0:v]drawtext="));
    assert!(graph.contains("enable='gte(t,0.000)*lt(t,5.000)'"));
    assert_eq!(commands[0].output, expected);
}

#[tokio::test]
async fn test_progress_is_persisted_while_processing() {
    let h = harness(1, Behavior::Succeed(Duration::from_millis(500)));
    let id = h.scheduler.submit("/videos/in.mp4", caption()).await.unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status = h.scheduler.get_status(&id).await.unwrap();
        if status.progress == Some(50) {
            assert_eq!(status.state, JobState::Processing);
            assert_eq!(status.message, "Processing: 50%");
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "progress never reported");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(wait_until_terminal(&h.scheduler, &id).await, JobState::Completed);
}

#[tokio::test]
async fn test_overlay_past_duration_fails_without_spawning() {
    let h = harness(2, Behavior::Succeed(Duration::ZERO));
    let overlays = vec![Overlay::text("late", 0.0, 0.0, 8.0, 20.0)];
    let id = h.scheduler.submit("/videos/in.mp4", overlays).await.unwrap();

    assert_eq!(wait_until_terminal(&h.scheduler, &id).await, JobState::Failed);
    let status = h.scheduler.get_status(&id).await.unwrap();
    let error = status.error.unwrap();
    assert_eq!(error.kind, JobErrorKind::Plan);
    assert!(error.message.contains("overlay 0"));
    assert_eq!(h.runner.calls(), 0);

    assert!(matches!(
        h.scheduler.get_result(&id).await,
        Err(SchedulerError::NotReady {
            state: JobState::Failed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_missing_image_fails_plan() {
    let h = harness(1, Behavior::Succeed(Duration::ZERO));
    let overlays = vec![Overlay::image("/assets/gone.png", 0.0, 0.0, 0.0, 1.0)];
    let id = h.scheduler.submit("/videos/in.mp4", overlays).await.unwrap();

    assert_eq!(wait_until_terminal(&h.scheduler, &id).await, JobState::Failed);
    let error = h.scheduler.get_status(&id).await.unwrap().error.unwrap();
    assert_eq!(error.kind, JobErrorKind::Plan);
    assert_eq!(h.runner.calls(), 0);
}

#[tokio::test]
async fn test_probe_failure_is_io_error() {
    let h = harness(1, Behavior::Succeed(Duration::ZERO));
    let id = h.scheduler.submit("/videos/missing.mp4", caption()).await.unwrap();

    assert_eq!(wait_until_terminal(&h.scheduler, &id).await, JobState::Failed);
    let error = h.scheduler.get_status(&id).await.unwrap().error.unwrap();
    assert_eq!(error.kind, JobErrorKind::Io);
    assert_eq!(h.runner.calls(), 0);
}

#[tokio::test]
async fn test_process_failure_records_exit_code() {
    let h = harness(1, Behavior::Fail(1));
    let id = h.scheduler.submit("/videos/in.mp4", caption()).await.unwrap();

    assert_eq!(wait_until_terminal(&h.scheduler, &id).await, JobState::Failed);
    let error = h.scheduler.get_status(&id).await.unwrap().error.unwrap();
    assert_eq!(error.kind, JobErrorKind::Process);
    assert_eq!(error.exit_code, Some(1));
    assert_eq!(
        error.diagnostics.as_deref(),
        Some("Error initializing complex filters.")
    );
}

#[tokio::test]
async fn test_stall_fails_with_timeout() {
    let h = harness(1, Behavior::Stall);
    let id = h.scheduler.submit("/videos/in.mp4", caption()).await.unwrap();

    assert_eq!(wait_until_terminal(&h.scheduler, &id).await, JobState::Failed);
    let error = h.scheduler.get_status(&id).await.unwrap().error.unwrap();
    assert_eq!(error.kind, JobErrorKind::Timeout);
}

#[tokio::test]
async fn test_single_slot_admits_in_submission_order() {
    let h = harness(1, Behavior::Succeed(Duration::from_millis(30)));

    let mut ids = Vec::new();
    for i in 0..3 {
        let input = format!("/videos/in{}.mp4", i);
        ids.push(h.scheduler.submit(input, caption()).await.unwrap());
    }
    for id in &ids {
        assert_eq!(wait_until_terminal(&h.scheduler, id).await, JobState::Completed);
    }

    let expected: Vec<PathBuf> = (0..3)
        .map(|i| PathBuf::from(format!("/videos/in{}.mp4", i)))
        .collect();
    assert_eq!(h.runner.started(), expected);
    assert_eq!(h.runner.peak(), 1);
}

#[tokio::test]
async fn test_processing_never_exceeds_capacity() {
    let capacity = 2;
    let h = harness(capacity, Behavior::Succeed(Duration::from_millis(60)));

    let mut ids = Vec::new();
    for i in 0..(capacity + 3) {
        ids.push(
            h.scheduler
                .submit(format!("/videos/in{}.mp4", i), caption())
                .await
                .unwrap(),
        );
    }

    let deadline = tokio::time::Instant::now() + WAIT;
    let mut saw_full = false;
    loop {
        let processing = h
            .store
            .scan(&|r: &JobRecord| r.state == JobState::Processing)
            .await
            .unwrap()
            .len();
        assert!(processing <= capacity, "{} jobs processing", processing);
        assert!(h.scheduler.governor().in_use() <= capacity);
        saw_full |= processing == capacity;

        let done = h
            .store
            .scan(&|r: &JobRecord| r.is_terminal())
            .await
            .unwrap()
            .len();
        if done == ids.len() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "jobs never finished");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Saturated, never exceeded
    assert!(saw_full, "never had {} jobs processing at once", capacity);
    assert_eq!(h.runner.peak(), capacity);
    assert_eq!(h.runner.calls(), ids.len());
    for id in &ids {
        assert_eq!(
            h.scheduler.get_status(id).await.unwrap().state,
            JobState::Completed
        );
    }
}

#[tokio::test]
async fn test_cancel_queued_job_never_runs() {
    let h = harness(1, Behavior::Block);
    let first = h.scheduler.submit("/videos/a.mp4", caption()).await.unwrap();
    let second = h.scheduler.submit("/videos/b.mp4", caption()).await.unwrap();

    wait_for_state(&h.scheduler, &first, JobState::Processing).await;
    assert_eq!(
        h.scheduler.get_status(&second).await.unwrap().state,
        JobState::Queued
    );

    h.scheduler.cancel(&second).await.unwrap();
    let status = h.scheduler.get_status(&second).await.unwrap();
    assert_eq!(status.state, JobState::Cancelled);
    assert!(status.started_at.is_none());
    assert!(status.completed_at.is_some());

    h.scheduler.cancel(&first).await.unwrap();
    assert_eq!(wait_until_terminal(&h.scheduler, &first).await, JobState::Cancelled);

    // Give the dispatcher a chance to (wrongly) admit the cancelled job
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.runner.started(), vec![PathBuf::from("/videos/a.mp4")]);
    assert_eq!(h.scheduler.governor().in_use(), 0);
}

#[tokio::test]
async fn test_cancel_processing_job() {
    let h = harness(1, Behavior::Block);
    let id = h.scheduler.submit("/videos/in.mp4", caption()).await.unwrap();
    wait_for_state(&h.scheduler, &id, JobState::Processing).await;

    h.scheduler.cancel(&id).await.unwrap();
    assert_eq!(wait_until_terminal(&h.scheduler, &id).await, JobState::Cancelled);

    let status = h.scheduler.get_status(&id).await.unwrap();
    assert_eq!(status.message, "Job cancelled");
    assert_eq!(status.progress, None);

    assert!(matches!(
        h.scheduler.cancel(&id).await,
        Err(SchedulerError::AlreadyTerminal {
            state: JobState::Cancelled,
            ..
        })
    ));
}

#[tokio::test]
async fn test_slot_freed_after_cancel_admits_next() {
    let h = harness(1, Behavior::Block);
    let first = h.scheduler.submit("/videos/a.mp4", caption()).await.unwrap();
    let second = h.scheduler.submit("/videos/b.mp4", caption()).await.unwrap();

    wait_for_state(&h.scheduler, &first, JobState::Processing).await;
    h.scheduler.cancel(&first).await.unwrap();
    wait_for_state(&h.scheduler, &second, JobState::Processing).await;

    h.scheduler.cancel(&second).await.unwrap();
    assert_eq!(wait_until_terminal(&h.scheduler, &second).await, JobState::Cancelled);
}

#[tokio::test]
async fn test_cancel_during_submit_is_not_tracked_forever() {
    let dir = TempDir::new().unwrap();
    let config = WorkerConfig {
        max_concurrent_jobs: 1,
        output_dir: dir.path().join("results"),
        ..WorkerConfig::default()
    };
    let store = Arc::new(SlowFirstPut {
        inner: MemoryJobStore::new(),
        delayed: AtomicBool::new(false),
    });
    let runner = FakeRunner::new(Behavior::Succeed(Duration::ZERO));
    let scheduler = JobScheduler::start(
        config,
        store.clone(),
        Arc::new(FakeProbe),
        runner.clone(),
        Arc::new(HashSet::<PathBuf>::new()),
    );

    let (submitted, cancelled) = tokio::join!(
        scheduler.submit("/videos/in.mp4", caption()),
        async {
            // Cancel as soon as the record is visible, before submit returns
            let id = loop {
                let stored = store.scan(&|_: &JobRecord| true).await.unwrap();
                if let Some(record) = stored.first() {
                    break record.id.clone();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            };
            (id.clone(), scheduler.cancel(&id).await)
        }
    );
    let id = submitted.unwrap();
    let (cancelled_id, result) = cancelled;
    assert_eq!(cancelled_id, id);
    result.unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    while scheduler.tracked_jobs().await > 0 {
        assert!(tokio::time::Instant::now() < deadline, "cancelled job still tracked");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(
        scheduler.get_status(&id).await.unwrap().state,
        JobState::Cancelled
    );
    assert_eq!(runner.calls(), 0);
    assert_eq!(scheduler.governor().in_use(), 0);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_unknown_job() {
    let h = harness(1, Behavior::Succeed(Duration::ZERO));
    let id = JobId::new();

    assert!(h.scheduler.get_status(&id).await.unwrap_err().is_not_found());
    assert!(h.scheduler.get_result(&id).await.unwrap_err().is_not_found());
    assert!(h.scheduler.cancel(&id).await.unwrap_err().is_not_found());
    assert!(h.scheduler.delete(&id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_delete_refuses_active_and_removes_finished() {
    let h = harness(1, Behavior::Block);
    let id = h.scheduler.submit("/videos/in.mp4", caption()).await.unwrap();
    wait_for_state(&h.scheduler, &id, JobState::Processing).await;

    assert!(matches!(
        h.scheduler.delete(&id).await,
        Err(SchedulerError::JobActive {
            state: JobState::Processing,
            ..
        })
    ));
    assert!(matches!(
        h.scheduler.get_result(&id).await,
        Err(SchedulerError::NotReady {
            state: JobState::Processing,
            ..
        })
    ));

    h.scheduler.cancel(&id).await.unwrap();
    wait_until_terminal(&h.scheduler, &id).await;

    h.scheduler.delete(&id).await.unwrap();
    assert!(h.store.get(&id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_delete_completed_removes_output() {
    let h = harness(1, Behavior::Succeed(Duration::ZERO));
    let id = h.scheduler.submit("/videos/in.mp4", caption()).await.unwrap();
    assert_eq!(wait_until_terminal(&h.scheduler, &id).await, JobState::Completed);

    let output = h.scheduler.get_result(&id).await.unwrap();
    std::fs::write(&output, b"rendered").unwrap();

    h.scheduler.delete(&id).await.unwrap();
    assert!(!output.exists());
}

#[tokio::test]
async fn test_shutdown_cancels_running_and_queued() {
    let h = harness(1, Behavior::Block);
    let running = h.scheduler.submit("/videos/a.mp4", caption()).await.unwrap();
    let queued = h.scheduler.submit("/videos/b.mp4", caption()).await.unwrap();
    wait_for_state(&h.scheduler, &running, JobState::Processing).await;

    tokio::time::timeout(WAIT, h.scheduler.shutdown())
        .await
        .expect("shutdown hung");

    assert_eq!(
        h.scheduler.get_status(&running).await.unwrap().state,
        JobState::Cancelled
    );
    assert_eq!(
        h.scheduler.get_status(&queued).await.unwrap().state,
        JobState::Cancelled
    );
    assert!(matches!(
        h.scheduler.submit("/videos/c.mp4", caption()).await,
        Err(SchedulerError::ShuttingDown)
    ));
}
