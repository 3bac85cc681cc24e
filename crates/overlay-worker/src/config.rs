//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use overlay_media::FfmpegRunner;
use overlay_store::RedisStoreConfig;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum renders in PROCESSING at once
    pub max_concurrent_jobs: usize,
    /// Fail a render whose output time stops advancing for this long
    pub stall_timeout: Duration,
    /// Wait between asking ffmpeg to stop and killing it
    pub kill_grace: Duration,
    /// How long terminal jobs are kept
    pub retention: Duration,
    /// Time between retention sweeps
    pub sweep_interval: Duration,
    /// Also delete the source video when a job is swept or deleted
    pub remove_inputs: bool,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Directory receiving rendered outputs
    pub output_dir: PathBuf,
    /// Redis URL; the in-memory store is used when unset
    pub redis_url: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            stall_timeout: Duration::from_secs(300), // 5 minutes
            kill_grace: Duration::from_secs(5),
            retention: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(3600),
            remove_inputs: false,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            output_dir: PathBuf::from("results"),
            redis_url: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            max_concurrent_jobs: std::env::var("OVERLAY_MAX_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(5),
            stall_timeout: Duration::from_secs(
                std::env::var("OVERLAY_STALL_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            kill_grace: Duration::from_secs(
                std::env::var("OVERLAY_KILL_GRACE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            retention: Duration::from_secs(
                std::env::var("OVERLAY_RETENTION_HOURS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(24)
                    * 3600,
            ),
            sweep_interval: Duration::from_secs(
                std::env::var("OVERLAY_SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|secs: &u64| *secs > 0)
                    .unwrap_or(3600),
            ),
            remove_inputs: std::env::var("OVERLAY_SWEEP_REMOVE_INPUTS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            ffmpeg_path: std::env::var("FFMPEG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("ffmpeg")),
            ffprobe_path: std::env::var("FFPROBE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("ffprobe")),
            output_dir: std::env::var("OVERLAY_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("results")),
            redis_url: std::env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
        }
    }

    /// Redis settings layered over `base`, or `None` for the in-memory store.
    /// Terminal records are kept at least until the sweep that removes them.
    pub fn redis_store_config(&self, base: RedisStoreConfig) -> Option<RedisStoreConfig> {
        let url = self.redis_url.clone()?;
        Some(
            RedisStoreConfig {
                redis_url: url,
                ..base
            }
            .with_min_terminal_ttl(self.retention + self.sweep_interval),
        )
    }

    /// Process runner honoring the stall and grace settings.
    pub fn render_runner(&self) -> FfmpegRunner {
        let runner = FfmpegRunner::new().with_kill_grace(self.kill_grace);
        if self.stall_timeout.is_zero() {
            runner
        } else {
            runner.with_stall_timeout(self.stall_timeout)
        }
    }
}
