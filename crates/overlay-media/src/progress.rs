//! FFmpeg progress parsing.
//!
//! The tracker consumes stderr lines one at a time. It understands the
//! `key=value` records written by `-progress pipe:2` as well as the classic
//! `... time=HH:MM:SS.ss ...` stats line, so either output mode works.

use serde::{Deserialize, Serialize};

/// Highest percentage reported while the process is still running; 100 is
/// reserved for a verified output.
pub const MAX_RUNNING_PERCENT: u8 = 99;

/// A progress observation worth persisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum ProgressUpdate {
    /// Percentage of the source rendered so far
    Percent(u8),
    /// Work is happening but the source duration is unknown
    Indeterminate,
}

/// Converts raw tool output into monotonic progress updates.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    /// Source duration in seconds, if known
    duration: Option<f64>,
    /// Furthest output timestamp seen, in seconds
    processed: f64,
    /// Last percentage emitted
    last_percent: u8,
    /// Whether an indeterminate update has already been emitted
    announced: bool,
}

impl ProgressTracker {
    /// Create a tracker. Non-positive or non-finite durations count as unknown.
    pub fn new(duration: Option<f64>) -> Self {
        Self {
            duration: duration.filter(|d| d.is_finite() && *d > 0.0),
            processed: 0.0,
            last_percent: 0,
            announced: false,
        }
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    /// Output time reached so far, in seconds.
    pub fn processed_secs(&self) -> f64 {
        self.processed
    }

    pub fn last_percent(&self) -> u8 {
        self.last_percent
    }

    /// Feed one line. Returns an update only when it moves progress forward.
    pub fn observe(&mut self, line: &str) -> Option<ProgressUpdate> {
        let marker = parse_time_marker(line)?;
        if marker > self.processed {
            self.processed = marker;
        }

        let Some(duration) = self.duration else {
            if self.announced {
                return None;
            }
            self.announced = true;
            return Some(ProgressUpdate::Indeterminate);
        };

        let ratio = (self.processed / duration).clamp(0.0, 1.0);
        let percent = ((ratio * 100.0).floor() as u8).min(MAX_RUNNING_PERCENT);
        if percent > self.last_percent {
            self.last_percent = percent;
            Some(ProgressUpdate::Percent(percent))
        } else {
            None
        }
    }
}

/// Whether `line` is part of the machine-readable `-progress` stream rather
/// than a diagnostic worth keeping.
pub fn is_progress_field(line: &str) -> bool {
    let line = line.trim();
    match line.split_once('=') {
        Some((key, _)) => matches!(
            key,
            "frame"
                | "fps"
                | "stream_0_0_q"
                | "bitrate"
                | "total_size"
                | "out_time_us"
                | "out_time_ms"
                | "out_time"
                | "dup_frames"
                | "drop_frames"
                | "speed"
                | "progress"
        ) || key.starts_with("stream_"),
        None => false,
    }
}

/// Extract an output timestamp (seconds) from a progress or stats line.
fn parse_time_marker(line: &str) -> Option<f64> {
    let line = line.trim();

    if let Some((key, value)) = line.split_once('=') {
        match key {
            // Both are microseconds; out_time_ms is misnamed upstream
            "out_time_us" | "out_time_ms" => {
                let us = value.trim().parse::<i64>().ok()?;
                return (us >= 0).then(|| us as f64 / 1_000_000.0);
            }
            "out_time" => return parse_clock(value.trim()),
            _ => {}
        }
    }

    // Stats line: "frame=  42 fps=... time=00:00:01.40 bitrate=..."
    line.split_whitespace()
        .find_map(|token| token.strip_prefix("time="))
        .and_then(parse_clock)
}

/// Parse `HH:MM:SS(.fraction)` into seconds.
fn parse_clock(value: &str) -> Option<f64> {
    if value.starts_with('-') {
        return None;
    }
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    (total.is_finite() && total >= 0.0).then_some(total)
}
