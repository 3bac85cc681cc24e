//! Timed overlay definitions.
//!
//! Overlays are a closed set of variants sharing the same timing contract.
//! Range checks against the source video happen when the filter plan is
//! built, not here; these types only describe what the caller asked for.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Pixel position of an overlay's top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Target box in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

/// Time window in seconds. Overlays are shown on `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

impl TimeWindow {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }
}

fn default_font_size() -> u32 {
    24
}

fn default_color() -> String {
    "white".to_string()
}

fn default_opacity() -> f64 {
    1.0
}

fn default_scale() -> f64 {
    1.0
}

fn default_boxed() -> bool {
    true
}

/// Text drawn with ffmpeg's `drawtext`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextOverlay {
    pub content: String,
    pub position: Position,
    pub start_time: f64,
    pub end_time: f64,
    /// Font size in pixels (8-200)
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    #[serde(default = "default_color")]
    pub color: String,
    /// Opacity (0.0 to 1.0)
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    /// Draw a translucent backing box behind the text
    #[serde(default = "default_boxed")]
    pub boxed: bool,
}

/// Still image composited over the video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageOverlay {
    pub source: PathBuf,
    pub position: Position,
    pub start_time: f64,
    pub end_time: f64,
    /// Fit the image to this box before scaling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
}

/// Video clip composited over the video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipOverlay {
    pub source: PathBuf,
    pub position: Position,
    pub start_time: f64,
    pub end_time: f64,
    /// Portion of the clip source to play, in clip-local seconds
    pub trim: TimeWindow,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
}

/// A timed visual element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Overlay {
    Text(TextOverlay),
    Image(ImageOverlay),
    Clip(ClipOverlay),
}

/// Overlay variant without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayKind {
    Text,
    Image,
    Clip,
}

impl OverlayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlayKind::Text => "text",
            OverlayKind::Image => "image",
            OverlayKind::Clip => "clip",
        }
    }
}

impl fmt::Display for OverlayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Overlay {
    pub fn kind(&self) -> OverlayKind {
        match self {
            Overlay::Text(_) => OverlayKind::Text,
            Overlay::Image(_) => OverlayKind::Image,
            Overlay::Clip(_) => OverlayKind::Clip,
        }
    }

    /// Window during which the overlay is visible.
    pub fn window(&self) -> TimeWindow {
        match self {
            Overlay::Text(t) => TimeWindow::new(t.start_time, t.end_time),
            Overlay::Image(i) => TimeWindow::new(i.start_time, i.end_time),
            Overlay::Clip(c) => TimeWindow::new(c.start_time, c.end_time),
        }
    }

    pub fn position(&self) -> Position {
        match self {
            Overlay::Text(t) => t.position,
            Overlay::Image(i) => i.position,
            Overlay::Clip(c) => c.position,
        }
    }

    /// External media file this overlay reads, if any.
    pub fn source(&self) -> Option<&PathBuf> {
        match self {
            Overlay::Text(_) => None,
            Overlay::Image(i) => Some(&i.source),
            Overlay::Clip(c) => Some(&c.source),
        }
    }

    /// Convenience constructor used by callers and tests.
    pub fn text(content: impl Into<String>, x: f64, y: f64, start: f64, end: f64) -> Self {
        Overlay::Text(TextOverlay {
            content: content.into(),
            position: Position::new(x, y),
            start_time: start,
            end_time: end,
            font_size: default_font_size(),
            color: default_color(),
            opacity: default_opacity(),
            boxed: default_boxed(),
        })
    }

    pub fn image(source: impl Into<PathBuf>, x: f64, y: f64, start: f64, end: f64) -> Self {
        Overlay::Image(ImageOverlay {
            source: source.into(),
            position: Position::new(x, y),
            start_time: start,
            end_time: end,
            size: None,
            scale: default_scale(),
            opacity: default_opacity(),
        })
    }

    pub fn clip(
        source: impl Into<PathBuf>,
        x: f64,
        y: f64,
        start: f64,
        end: f64,
        trim: TimeWindow,
    ) -> Self {
        Overlay::Clip(ClipOverlay {
            source: source.into(),
            position: Position::new(x, y),
            start_time: start,
            end_time: end,
            trim,
            size: None,
            scale: default_scale(),
            opacity: default_opacity(),
        })
    }
}
