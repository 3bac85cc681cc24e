//! FFmpeg command builder and runner.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};
use crate::plan::FilterPlan;
use crate::progress::{is_progress_field, ProgressTracker, ProgressUpdate};

/// Number of diagnostic lines kept for failure reports.
const DIAGNOSTIC_LINES: usize = 20;

/// How long to keep reading stderr after the process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Builder for FFmpeg commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    /// Input file path
    input: PathBuf,
    /// Output file path
    output: PathBuf,
    /// Input arguments (before the first -i)
    input_args: Vec<String>,
    /// Secondary inputs with their own pre-input arguments
    extra_inputs: Vec<(Vec<String>, PathBuf)>,
    /// Output arguments (after all inputs)
    output_args: Vec<String>,
    /// Whether to overwrite output
    overwrite: bool,
    /// Log level
    log_level: String,
}

impl FfmpegCommand {
    /// Create a new FFmpeg command.
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_args: Vec::new(),
            extra_inputs: Vec::new(),
            output_args: Vec::new(),
            overwrite: true,
            log_level: "error".to_string(),
        }
    }

    /// Command rendering `plan` over `input` into `output`.
    pub fn from_plan(
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        plan: &FilterPlan,
    ) -> Self {
        let mut cmd = Self::new(input, output);
        for extra in &plan.inputs {
            cmd = cmd.extra_input(extra.args.clone(), &extra.path);
        }
        if let Some(graph) = plan.filter_complex() {
            cmd = cmd.filter_complex(graph);
        }
        cmd.output_args(plan.output_args.iter().cloned())
    }

    /// Add input arguments (before -i).
    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    /// Add another input. Inputs are numbered in insertion order starting at 1.
    pub fn extra_input<I, S>(mut self, args: I, path: impl AsRef<Path>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_inputs.push((
            args.into_iter().map(Into::into).collect(),
            path.as_ref().to_path_buf(),
        ));
        self
    }

    /// Add output arguments (after all inputs).
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// Add multiple output arguments.
    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set filter complex.
    pub fn filter_complex(self, filter: impl Into<String>) -> Self {
        self.output_arg("-filter_complex").output_arg(filter)
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.overwrite {
            args.push("-y".to_string());
        }

        args.push("-v".to_string());
        args.push(self.log_level.clone());

        // Machine-readable progress on stderr instead of the stats line
        args.push("-nostats".to_string());
        args.push("-progress".to_string());
        args.push("pipe:2".to_string());

        args.extend(self.input_args.clone());
        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().to_string());

        for (input_args, path) in &self.extra_inputs {
            args.extend(input_args.clone());
            args.push("-i".to_string());
            args.push(path.to_string_lossy().to_string());
        }

        args.extend(self.output_args.clone());
        args.push(self.output.to_string_lossy().to_string());

        args
    }

    /// Freeze into a runnable command for `program`.
    pub fn render_command(&self, program: impl Into<PathBuf>) -> RenderCommand {
        RenderCommand {
            program: program.into(),
            args: self.build_args(),
            output: self.output.clone(),
        }
    }
}

/// A fully built external invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// File the process is expected to produce
    pub output: PathBuf,
}

impl fmt::Display for RenderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Exited 0 and the output file exists
    Success(PathBuf),
    /// Non-zero exit, spawn failure, or missing output
    Failure {
        exit_code: Option<i32>,
        diagnostics: String,
    },
    /// Terminated because cancellation was requested
    Cancelled,
    /// Terminated because output time stopped advancing
    Stalled { idle: Duration },
}

/// Runs an external render process to completion.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `command`, feeding stderr through `tracker` and forwarding each
    /// update on `progress`. Never returns before the child has exited.
    async fn run(
        &self,
        command: &RenderCommand,
        tracker: ProgressTracker,
        progress: mpsc::UnboundedSender<ProgressUpdate>,
        cancel: CancellationToken,
    ) -> RunOutcome;
}

/// Runner for FFmpeg processes with progress tracking, cancellation and
/// stall detection.
#[derive(Debug, Clone)]
pub struct FfmpegRunner {
    /// Maximum time without output-time progress
    stall_timeout: Option<Duration>,
    /// Wait between graceful termination and a forced kill
    kill_grace: Duration,
}

impl Default for FfmpegRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegRunner {
    /// Create a new runner.
    pub fn new() -> Self {
        Self {
            stall_timeout: None,
            kill_grace: Duration::from_secs(5),
        }
    }

    /// Terminate runs whose output time has not advanced for `timeout`.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = Some(timeout);
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Ask the child to stop, then kill it if it ignores us.
    async fn terminate(&self, child: &mut Child) {
        // ffmpeg finalizes the container on "q"
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(b"q\n").await;
            let _ = stdin.flush().await;
        }

        if let Some(pid) = child.id() {
            send_sigterm(pid);
        }

        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "Render process exited after termination"),
            Ok(Err(e)) => warn!(error = %e, "Failed waiting for render process"),
            Err(_) => {
                warn!(
                    grace_secs = self.kill_grace.as_secs_f64(),
                    "Render process ignored termination, killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill render process");
                }
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

/// Per-run stderr bookkeeping.
struct StderrSink {
    tracker: ProgressTracker,
    progress: mpsc::UnboundedSender<ProgressUpdate>,
    tail: VecDeque<String>,
    processed: f64,
    last_advance: Instant,
}

impl StderrSink {
    fn new(tracker: ProgressTracker, progress: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        Self {
            processed: tracker.processed_secs(),
            tracker,
            progress,
            tail: VecDeque::with_capacity(DIAGNOSTIC_LINES),
            last_advance: Instant::now(),
        }
    }

    fn consume(&mut self, line: String) {
        if let Some(update) = self.tracker.observe(&line) {
            // Receiver gone means nobody is listening any more; keep running
            let _ = self.progress.send(update);
        }
        if self.tracker.processed_secs() > self.processed {
            self.processed = self.tracker.processed_secs();
            self.last_advance = Instant::now();
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || is_progress_field(trimmed) {
            return;
        }
        if self.tail.len() == DIAGNOSTIC_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(trimmed.to_string());
    }

    async fn drain(&mut self, lines: &mut tokio::io::Lines<BufReader<ChildStderr>>) {
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Ok(Some(line)) = lines.next_line().await {
                self.consume(line);
            }
        })
        .await;
        if drained.is_err() {
            debug!("Gave up draining stderr");
        }
    }

    fn diagnostics(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

enum Event {
    Cancelled,
    Exited(std::io::Result<std::process::ExitStatus>),
    Line(std::io::Result<Option<String>>),
    Tick,
}

#[async_trait]
impl ProcessRunner for FfmpegRunner {
    async fn run(
        &self,
        command: &RenderCommand,
        tracker: ProgressTracker,
        progress: mpsc::UnboundedSender<ProgressUpdate>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        if cancel.is_cancelled() {
            return RunOutcome::Cancelled;
        }

        debug!("Running FFmpeg: {}", command);

        let mut child = match Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    program = %command.program.display(),
                    error = %e,
                    "Failed to spawn render process"
                );
                return RunOutcome::Failure {
                    exit_code: None,
                    diagnostics: format!("failed to spawn {}: {}", command.program.display(), e),
                };
            }
        };

        let Some(stderr) = child.stderr.take() else {
            self.terminate(&mut child).await;
            return RunOutcome::Failure {
                exit_code: None,
                diagnostics: "stderr not captured".to_string(),
            };
        };
        let mut lines = BufReader::new(stderr).lines();
        let mut sink = StderrSink::new(tracker, progress);
        let mut stderr_open = true;

        let check_every = self
            .stall_timeout
            .map(|t| (t / 4).clamp(Duration::from_millis(10), Duration::from_secs(1)))
            .unwrap_or(Duration::from_secs(1));
        let mut stall_check = tokio::time::interval(check_every);
        stall_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Cancelled,
                status = child.wait() => Event::Exited(status),
                line = lines.next_line(), if stderr_open => Event::Line(line),
                _ = stall_check.tick(), if self.stall_timeout.is_some() => Event::Tick,
            };

            match event {
                Event::Line(Ok(Some(line))) => sink.consume(line),
                Event::Line(Ok(None)) => stderr_open = false,
                Event::Line(Err(e)) => {
                    debug!(error = %e, "Stopped reading render stderr");
                    stderr_open = false;
                }
                Event::Tick => {
                    let idle = sink.last_advance.elapsed();
                    if let Some(limit) = self.stall_timeout {
                        if idle >= limit {
                            warn!(
                                idle_secs = idle.as_secs_f64(),
                                processed_secs = sink.processed,
                                "Render stalled, terminating"
                            );
                            self.terminate(&mut child).await;
                            return RunOutcome::Stalled { idle };
                        }
                    }
                }
                Event::Cancelled => {
                    info!("Render cancelled, terminating process");
                    self.terminate(&mut child).await;
                    return RunOutcome::Cancelled;
                }
                Event::Exited(Err(e)) => {
                    warn!(error = %e, "Failed waiting for render process");
                    return RunOutcome::Failure {
                        exit_code: None,
                        diagnostics: e.to_string(),
                    };
                }
                Event::Exited(Ok(status)) => {
                    if stderr_open {
                        sink.drain(&mut lines).await;
                    }

                    if !status.success() {
                        return RunOutcome::Failure {
                            exit_code: status.code(),
                            diagnostics: sink.diagnostics(),
                        };
                    }

                    let produced = tokio::fs::metadata(&command.output)
                        .await
                        .map(|m| m.is_file())
                        .unwrap_or(false);
                    if !produced {
                        let mut diagnostics = sink.diagnostics();
                        if !diagnostics.is_empty() {
                            diagnostics.push('\n');
                        }
                        diagnostics.push_str(&format!(
                            "exited successfully but {} was not created",
                            command.output.display()
                        ));
                        return RunOutcome::Failure {
                            exit_code: status.code(),
                            diagnostics,
                        };
                    }

                    return RunOutcome::Success(command.output.clone());
                }
            }
        }
    }
}

/// Resolve a tool on `PATH` (or an explicit path).
pub fn check_tool(program: impl AsRef<OsStr>) -> MediaResult<PathBuf> {
    let program = program.as_ref();
    which::which(program)
        .map_err(|_| MediaError::ToolNotFound(program.to_string_lossy().to_string()))
}
