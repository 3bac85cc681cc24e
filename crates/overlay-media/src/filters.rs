//! FFmpeg filter-graph fragments.
//!
//! Everything here returns plain strings; the plan builder decides which
//! labels get wired together.

use overlay_models::TimeWindow;

/// Fixed-precision number formatting so identical inputs give identical graphs.
pub fn fmt_secs(value: f64) -> String {
    format!("{:.3}", value)
}

/// Round a pixel coordinate the way the overlay filters expect it.
pub fn fmt_px(value: f64) -> String {
    format!("{}", value.round() as i64)
}

/// `enable` option restricting a filter to the half-open window `[start, end)`.
///
/// Quoted at graph level so the commas survive graph parsing.
pub fn enable_window(window: TimeWindow) -> String {
    format!(
        "enable='gte(t,{})*lt(t,{})'",
        fmt_secs(window.start),
        fmt_secs(window.end)
    )
}

/// Escape arbitrary user text for use as a `drawtext` `text=` value.
///
/// Two levels apply: the option parser (the value is single-quoted, embedded
/// quotes close and reopen the quote) and then the filtergraph parser (which
/// treats `\ ' [ ] , ;` as syntax). Must be combined with `expansion=none` so
/// `%{...}` sequences stay literal.
pub fn escape_drawtext(text: &str) -> String {
    let quoted = format!("'{}'", text.replace('\'', "'\\''"));
    let mut escaped = String::with_capacity(quoted.len() * 2);
    for ch in quoted.chars() {
        if matches!(ch, '\\' | '\'' | '[' | ']' | ',' | ';') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Accept plain color names and hex values only; anything else could smuggle
/// option separators into the graph.
pub fn is_safe_color(color: &str) -> bool {
    let hex = color
        .strip_prefix('#')
        .or_else(|| color.strip_prefix("0x"))
        .or_else(|| color.strip_prefix("0X"));
    match hex {
        Some(digits) => {
            matches!(digits.len(), 6 | 8) && digits.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => {
            !color.is_empty() && color.len() <= 32 && color.chars().all(|c| c.is_ascii_alphabetic())
        }
    }
}

/// Parameters for a `drawtext` stage.
#[derive(Debug, Clone)]
pub struct DrawText<'a> {
    pub text: &'a str,
    pub x: f64,
    pub y: f64,
    pub font_size: u32,
    pub color: &'a str,
    pub opacity: f64,
    pub boxed: bool,
    pub window: TimeWindow,
}

/// `drawtext` filter body (no labels).
pub fn drawtext(params: &DrawText<'_>) -> String {
    let mut parts = vec![
        format!("text={}", escape_drawtext(params.text)),
        "expansion=none".to_string(),
        format!("x={}", fmt_px(params.x)),
        format!("y={}", fmt_px(params.y)),
        format!("fontsize={}", params.font_size),
        format!("fontcolor={}", params.color),
        format!("alpha={}", fmt_secs(params.opacity)),
    ];
    if params.boxed {
        parts.push("box=1".to_string());
        parts.push("boxcolor=black@0.5".to_string());
        parts.push("boxborderw=5".to_string());
    }
    parts.push(enable_window(params.window));
    format!("drawtext={}", parts.join(":"))
}

/// Preparation chain for a secondary visual input (image or clip frames):
/// optional time shift, RGBA conversion, scaling and alpha.
pub fn prepare_layer(shift_to: Option<f64>, scale: Option<String>, opacity: f64) -> String {
    let mut chain = Vec::new();
    if let Some(start) = shift_to {
        chain.push(format!("setpts=PTS-STARTPTS+{}/TB", fmt_secs(start)));
    }
    chain.push("format=rgba".to_string());
    if let Some(scale) = scale {
        chain.push(scale);
    }
    if opacity < 1.0 {
        chain.push(format!("colorchannelmixer=aa={}", fmt_secs(opacity)));
    }
    chain.join(",")
}

/// `scale` filter for a layer: explicit box times factor, or a relative factor.
pub fn layer_scale(size: Option<(f64, f64)>, factor: f64) -> Option<String> {
    match size {
        Some((width, height)) => Some(format!(
            "scale={}:{}",
            fmt_px((width * factor).max(1.0)),
            fmt_px((height * factor).max(1.0))
        )),
        None if (factor - 1.0).abs() > f64::EPSILON => Some(format!(
            "scale=iw*{}:ih*{}",
            fmt_secs(factor),
            fmt_secs(factor)
        )),
        None => None,
    }
}

/// `overlay` filter body placing a layer at `(x, y)` during `window`.
///
/// `pass_on_eof` hides the layer once its input ends (clips); otherwise the
/// last frame is repeated (stills).
pub fn overlay(x: f64, y: f64, window: TimeWindow, pass_on_eof: bool) -> String {
    let mut parts = vec![format!("x={}", fmt_px(x)), format!("y={}", fmt_px(y))];
    if pass_on_eof {
        parts.push("eof_action=pass".to_string());
    }
    parts.push(enable_window(window));
    format!("overlay={}", parts.join(":"))
}
