//! Retention sweeper integration tests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use overlay_models::{JobError, JobId, JobRecord};
use overlay_store::{JobStore, MemoryJobStore};
use overlay_worker::{RetentionSweeper, SweepReport};

const DAY: Duration = Duration::from_secs(24 * 3600);

fn touch(path: &Path) {
    std::fs::write(path, b"data").unwrap();
}

async fn insert(store: &MemoryJobStore, record: &JobRecord) {
    store.put(&record.id, record).await.unwrap();
}

fn completed(dir: &Path, finished: DateTime<Utc>) -> JobRecord {
    let input = dir.join(format!("{}.mp4", JobId::new()));
    touch(&input);
    let mut record = JobRecord::new(&input, Vec::new());
    record.start().unwrap();
    let output = dir.join(format!("{}_output.mp4", record.id));
    touch(&output);
    record.complete(&output).unwrap();
    record.completed_at = Some(finished);
    record
}

#[tokio::test]
async fn test_old_terminal_jobs_are_removed_with_output() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let now = Utc::now();

    let old = completed(dir.path(), now - chrono::Duration::hours(25));
    let fresh = completed(dir.path(), now - chrono::Duration::hours(1));

    let mut failed = JobRecord::new(dir.path().join("never.mp4"), Vec::new());
    failed.start().unwrap();
    failed.fail(JobError::plan("overlay 0: bad")).unwrap();
    failed.completed_at = Some(now - chrono::Duration::days(3));

    for record in [&old, &fresh, &failed] {
        insert(&store, record).await;
    }

    let sweeper = RetentionSweeper::new(store.clone(), DAY, Duration::from_secs(3600));
    let report = sweeper.sweep_once(now).await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            scanned: 2,
            removed: 2,
            failed: 0
        }
    );

    assert!(store.get(&old.id).await.unwrap_err().is_not_found());
    assert!(store.get(&failed.id).await.unwrap_err().is_not_found());
    assert!(!old.output_path.as_ref().unwrap().exists());
    // Inputs stay unless asked for
    assert!(old.input_path.exists());

    let kept = store.get(&fresh.id).await.unwrap();
    assert!(kept.output_path.unwrap().exists());
}

#[tokio::test]
async fn test_active_jobs_are_never_swept() {
    let store = Arc::new(MemoryJobStore::new());
    let now = Utc::now();
    let ancient = now - chrono::Duration::days(365);

    let mut queued = JobRecord::new("/videos/a.mp4", Vec::new());
    queued.created_at = ancient;

    let mut processing = JobRecord::new("/videos/b.mp4", Vec::new());
    processing.created_at = ancient;
    processing.start().unwrap();
    processing.started_at = Some(ancient);

    insert(&store, &queued).await;
    insert(&store, &processing).await;

    let sweeper = RetentionSweeper::new(store.clone(), Duration::ZERO, Duration::from_secs(1));
    let report = sweeper.sweep_once(now).await.unwrap();
    assert_eq!(report, SweepReport::default());
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn test_remove_inputs_deletes_source() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let now = Utc::now();

    let old = completed(dir.path(), now - chrono::Duration::days(2));
    insert(&store, &old).await;

    let sweeper = RetentionSweeper::new(store.clone(), DAY, Duration::from_secs(3600))
        .with_remove_inputs(true);
    let report = sweeper.sweep_once(now).await.unwrap();

    assert_eq!(report.removed, 1);
    assert!(!old.input_path.exists());
    assert!(!old.output_path.as_ref().unwrap().exists());
}

#[tokio::test]
async fn test_missing_files_do_not_block_removal() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let now = Utc::now();

    let old = completed(dir.path(), now - chrono::Duration::days(2));
    std::fs::remove_file(old.output_path.as_ref().unwrap()).unwrap();
    std::fs::remove_file(&old.input_path).unwrap();
    insert(&store, &old).await;

    let sweeper = RetentionSweeper::new(store.clone(), DAY, Duration::from_secs(3600))
        .with_remove_inputs(true);
    let report = sweeper.sweep_once(now).await.unwrap();

    assert_eq!(report.removed, 1);
    assert_eq!(report.failed, 0);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_one_bad_record_does_not_stop_the_sweep() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let now = Utc::now();

    // Output path is a non-empty directory, so it cannot be removed as a file
    let mut stuck = completed(dir.path(), now - chrono::Duration::days(2));
    let blocker = dir.path().join("blocker");
    std::fs::create_dir(&blocker).unwrap();
    touch(&blocker.join("inner.mp4"));
    stuck.output_path = Some(blocker.clone());
    let good = completed(dir.path(), now - chrono::Duration::days(2));

    insert(&store, &stuck).await;
    insert(&store, &good).await;

    let sweeper = RetentionSweeper::new(store.clone(), DAY, Duration::from_secs(3600));
    let report = sweeper.sweep_once(now).await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            scanned: 2,
            removed: 1,
            failed: 1
        }
    );

    assert!(store.get(&good.id).await.unwrap_err().is_not_found());
    assert!(!good.output_path.as_ref().unwrap().exists());
    // Kept so a later pass can retry
    assert!(store.get(&stuck.id).await.is_ok());
    assert!(blocker.exists());
}

#[tokio::test]
async fn test_run_sweeps_immediately_and_stops_on_shutdown() {
    let store = Arc::new(MemoryJobStore::new());
    let mut record = JobRecord::new("/videos/gone.mp4", Vec::new());
    record.cancel().unwrap();
    record.completed_at = Some(Utc::now() - chrono::Duration::days(2));
    insert(&store, &record).await;

    let sweeper = RetentionSweeper::new(store.clone(), DAY, Duration::from_secs(3600));
    let shutdown = CancellationToken::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sweeper.run(shutdown).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !store.is_empty().await {
        assert!(tokio::time::Instant::now() < deadline, "first sweep never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("sweeper did not stop")
        .unwrap();
}
