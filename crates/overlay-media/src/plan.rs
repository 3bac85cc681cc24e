//! Overlay list -> ordered filter plan.
//!
//! The builder is the last gate before a process is spawned: every range and
//! geometry check against the probed source happens here. Stages are chained
//! in list order, so later overlays are always drawn on top of earlier ones.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use overlay_models::{
    ClipOverlay, ImageOverlay, Overlay, OverlayKind, Position, Size, TextOverlay, TimeWindow,
};

use crate::error::PlanError;
use crate::filters::{self, DrawText};
use crate::probe::VideoInfo;

pub const MIN_FONT_SIZE: u32 = 8;
pub const MAX_FONT_SIZE: u32 = 200;
pub const MIN_SCALE: f64 = 0.01;
pub const MAX_SCALE: f64 = 10.0;
pub const MAX_LAYER_PX: f64 = 16384.0;

/// Label of the source video stream.
const SOURCE_LABEL: &str = "0:v";

/// Existence check for image/clip sources, injected so planning stays free of
/// direct filesystem access.
pub trait AssetLookup: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
}

/// Looks assets up on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsAssets;

impl AssetLookup for FsAssets {
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

impl AssetLookup for HashSet<PathBuf> {
    fn exists(&self, path: &Path) -> bool {
        self.contains(path)
    }
}

/// Additional ffmpeg input required by an image or clip stage.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanInput {
    /// ffmpeg input index (the source video is 0)
    pub index: usize,
    pub overlay_index: usize,
    /// Arguments placed before this input's `-i`
    pub args: Vec<String>,
    pub path: PathBuf,
}

/// One composite step in the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterStage {
    pub overlay_index: usize,
    pub kind: OverlayKind,
    pub window: TimeWindow,
    pub input_label: String,
    pub output_label: String,
    /// Complete filtergraph fragment including labels
    pub filter: String,
}

/// Ordered render plan for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterPlan {
    pub inputs: Vec<PlanInput>,
    pub stages: Vec<FilterStage>,
    pub output_args: Vec<String>,
}

impl FilterPlan {
    /// `-filter_complex` value, or `None` when there is nothing to composite.
    pub fn filter_complex(&self) -> Option<String> {
        if self.stages.is_empty() {
            return None;
        }
        Some(
            self.stages
                .iter()
                .map(|s| s.filter.as_str())
                .collect::<Vec<_>>()
                .join(";"),
        )
    }

    /// Label carrying the fully composited video.
    pub fn output_label(&self) -> Option<&str> {
        self.stages.last().map(|s| s.output_label.as_str())
    }

    /// True when the source is stream-copied untouched.
    pub fn is_passthrough(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Build the plan for `overlays` against `source`.
pub fn build_plan(
    overlays: &[Overlay],
    source: &VideoInfo,
    assets: &dyn AssetLookup,
) -> Result<FilterPlan, PlanError> {
    if source.width == 0 || source.height == 0 {
        return Err(PlanError::InvalidSource {
            width: source.width,
            height: source.height,
        });
    }

    let mut inputs = Vec::new();
    let mut stages = Vec::with_capacity(overlays.len());
    let mut current = SOURCE_LABEL.to_string();

    for (index, overlay) in overlays.iter().enumerate() {
        let window = check_window(index, overlay.window(), source)?;
        check_position(index, overlay.position(), source)?;

        let output_label = format!("v{}", index);
        let filter = match overlay {
            Overlay::Text(text) => text_stage(index, text, window, &current, &output_label)?,
            Overlay::Image(image) => {
                let input_index = inputs.len() + 1;
                let filter =
                    image_stage(index, image, window, input_index, &current, &output_label)?;
                inputs.push(image_input(index, image, input_index, assets)?);
                filter
            }
            Overlay::Clip(clip) => {
                let input_index = inputs.len() + 1;
                let filter =
                    clip_stage(index, clip, window, input_index, &current, &output_label)?;
                inputs.push(clip_input(index, clip, input_index, assets)?);
                filter
            }
        };

        stages.push(FilterStage {
            overlay_index: index,
            kind: overlay.kind(),
            window,
            input_label: current.clone(),
            output_label: output_label.clone(),
            filter,
        });
        current = output_label;
    }

    let output_args = if stages.is_empty() {
        ["-map", "0", "-c", "copy"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    } else {
        let mut args = vec!["-map".to_string(), format!("[{}]", current)];
        args.extend(
            [
                "-map", "0:a?", "-c:v", "libx264", "-preset", "medium", "-crf", "23", "-pix_fmt",
                "yuv420p", "-c:a", "copy", "-movflags", "+faststart",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args
    };

    Ok(FilterPlan {
        inputs,
        stages,
        output_args,
    })
}

fn check_window(
    index: usize,
    window: TimeWindow,
    source: &VideoInfo,
) -> Result<TimeWindow, PlanError> {
    let TimeWindow { start, end } = window;
    if !start.is_finite() || !end.is_finite() || start < 0.0 || start >= end {
        return Err(PlanError::InvalidTiming { index, start, end });
    }
    if let Some(duration) = source.known_duration() {
        if end > duration {
            return Err(PlanError::OutsideDuration {
                index,
                end,
                duration,
            });
        }
    }
    Ok(window)
}

fn check_position(index: usize, position: Position, source: &VideoInfo) -> Result<(), PlanError> {
    let Position { x, y } = position;
    let inside = x.is_finite()
        && y.is_finite()
        && x >= 0.0
        && y >= 0.0
        && x < f64::from(source.width)
        && y < f64::from(source.height);
    if !inside {
        return Err(PlanError::OutOfFrame {
            index,
            x,
            y,
            width: source.width,
            height: source.height,
        });
    }
    Ok(())
}

fn check_range(
    index: usize,
    field: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<f64, PlanError> {
    if !value.is_finite() || value < min || value > max {
        return Err(PlanError::OutOfRange {
            index,
            field,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

fn check_layer(
    index: usize,
    size: Option<Size>,
    scale: f64,
    opacity: f64,
) -> Result<(Option<String>, f64), PlanError> {
    let scale = check_range(index, "scale", scale, MIN_SCALE, MAX_SCALE)?;
    let opacity = check_range(index, "opacity", opacity, 0.0, 1.0)?;
    let size = match size {
        Some(Size { width, height }) => Some((
            check_range(index, "width", width, 1.0, MAX_LAYER_PX)?,
            check_range(index, "height", height, 1.0, MAX_LAYER_PX)?,
        )),
        None => None,
    };
    Ok((filters::layer_scale(size, scale), opacity))
}

fn check_source(
    index: usize,
    kind: OverlayKind,
    path: &Path,
    assets: &dyn AssetLookup,
) -> Result<(), PlanError> {
    if !assets.exists(path) {
        return Err(PlanError::MissingSource {
            index,
            kind,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn text_stage(
    index: usize,
    text: &TextOverlay,
    window: TimeWindow,
    input: &str,
    output: &str,
) -> Result<String, PlanError> {
    if text.content.trim().is_empty() {
        return Err(PlanError::EmptyText { index });
    }
    check_range(
        index,
        "font_size",
        f64::from(text.font_size),
        f64::from(MIN_FONT_SIZE),
        f64::from(MAX_FONT_SIZE),
    )?;
    let opacity = check_range(index, "opacity", text.opacity, 0.0, 1.0)?;
    if !filters::is_safe_color(&text.color) {
        return Err(PlanError::InvalidColor {
            index,
            color: text.color.clone(),
        });
    }

    let body = filters::drawtext(&DrawText {
        text: &text.content,
        x: text.position.x,
        y: text.position.y,
        font_size: text.font_size,
        color: &text.color,
        opacity,
        boxed: text.boxed,
        window,
    });
    Ok(format!("[{}]{}[{}]", input, body, output))
}

fn image_input(
    index: usize,
    image: &ImageOverlay,
    input_index: usize,
    assets: &dyn AssetLookup,
) -> Result<PlanInput, PlanError> {
    check_source(index, OverlayKind::Image, &image.source, assets)?;
    Ok(PlanInput {
        index: input_index,
        overlay_index: index,
        args: Vec::new(),
        path: image.source.clone(),
    })
}

fn image_stage(
    index: usize,
    image: &ImageOverlay,
    window: TimeWindow,
    input_index: usize,
    current: &str,
    output: &str,
) -> Result<String, PlanError> {
    let (scale, opacity) = check_layer(index, image.size, image.scale, image.opacity)?;
    let layer = format!("ovl{}", index);
    Ok(format!(
        "[{}:v]{}[{}];[{}][{}]{}[{}]",
        input_index,
        filters::prepare_layer(None, scale, opacity),
        layer,
        current,
        layer,
        filters::overlay(image.position.x, image.position.y, window, false),
        output
    ))
}

fn clip_input(
    index: usize,
    clip: &ClipOverlay,
    input_index: usize,
    assets: &dyn AssetLookup,
) -> Result<PlanInput, PlanError> {
    check_source(index, OverlayKind::Clip, &clip.source, assets)?;
    Ok(PlanInput {
        index: input_index,
        overlay_index: index,
        args: vec![
            "-ss".to_string(),
            filters::fmt_secs(clip.trim.start),
            "-t".to_string(),
            filters::fmt_secs(clip.trim.duration()),
        ],
        path: clip.source.clone(),
    })
}

fn clip_stage(
    index: usize,
    clip: &ClipOverlay,
    window: TimeWindow,
    input_index: usize,
    current: &str,
    output: &str,
) -> Result<String, PlanError> {
    let TimeWindow { start, end } = clip.trim;
    if !start.is_finite() || !end.is_finite() || start < 0.0 || start >= end {
        return Err(PlanError::InvalidTrim { index, start, end });
    }
    let (scale, opacity) = check_layer(index, clip.size, clip.scale, clip.opacity)?;
    let layer = format!("ovl{}", index);
    Ok(format!(
        "[{}:v]{}[{}];[{}][{}]{}[{}]",
        input_index,
        filters::prepare_layer(Some(window.start), scale, opacity),
        layer,
        current,
        layer,
        filters::overlay(clip.position.x, clip.position.y, window, true),
        output
    ))
}
