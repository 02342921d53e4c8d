//! Subtitle hook body parser.
//!
//! The body is `key=value` lines with a closed key set covering text,
//! font, geometry, colors, alignment and duration. An empty body (or no
//! text) clears the current subtitle. Rendering itself is done by the
//! overlay collaborator.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerticalAlign {
    Top,
    Middle,
    Bottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HorizontalAlign {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextAlign {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleParams {
    pub text: String,
    pub font_name: Option<String>,
    pub font_file: Option<String>,
    pub face_index: i32,
    pub points: f32,
    pub dpi: i32,
    pub color: u32,
    pub stroke_color: u32,
    pub stroke_width: f32,
    pub letter_spacing: i32,
    pub line_height_multiply: f32,
    pub tab_scale: f32,
    /// Absolute position; when set it overrides the relative layout.
    pub position: Option<(i32, i32)>,
    pub layout: (VerticalAlign, HorizontalAlign),
    pub horizontal_margin: i32,
    pub vertical_margin: i32,
    pub text_align: TextAlign,
    pub duration_secs: f32,
    pub in_preview: bool,
    pub in_video: bool,
}

impl Default for SubtitleParams {
    fn default() -> Self {
        Self {
            text: String::new(),
            font_name: None,
            font_file: None,
            face_index: 0,
            points: 28.0,
            dpi: 96,
            color: 0xFFFFFF,
            stroke_color: 0x000000,
            stroke_width: 1.0,
            letter_spacing: 0,
            line_height_multiply: 1.0,
            tab_scale: 1.0,
            position: None,
            layout: (VerticalAlign::Bottom, HorizontalAlign::Center),
            horizontal_margin: 0,
            vertical_margin: 35,
            text_align: TextAlign::Center,
            duration_secs: 7.0,
            in_preview: true,
            in_video: true,
        }
    }
}

/// Parse a subtitle hook body. `Ok(None)` means "clear the subtitle".
/// A malformed value for a known key fails the whole hook; unknown keys
/// are rejected (the key set is closed).
pub fn parse_subtitle_body(content: &str) -> Result<Option<SubtitleParams>, String> {
    let mut params = SubtitleParams::default();

    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| format!("subtitle error: cannot find delimiter: {line}"))?;
        match key {
            // Literal "\n" in the text stands for a line break.
            "text" => params.text = value.replace("\\n", "\n"),
            "font_name" => params.font_name = Some(value.to_string()),
            "font_file" => params.font_file = Some(value.to_string()),
            "face_index" => params.face_index = parse_num(key, value)?,
            "pt" => params.points = parse_num(key, value)?,
            "dpi" => params.dpi = parse_num(key, value)?,
            "horizontal_margin" => params.horizontal_margin = parse_num(key, value)?,
            "vertical_margin" => params.vertical_margin = parse_num(key, value)?,
            "duration" => params.duration_secs = parse_num(key, value)?,
            "color" => params.color = parse_color(key, value)?,
            "stroke_color" => params.stroke_color = parse_color(key, value)?,
            "stroke_width" => params.stroke_width = parse_num(key, value)?,
            "letter_spacing" => params.letter_spacing = parse_num(key, value)?,
            "line_height" => params.line_height_multiply = parse_num(key, value)?,
            "tab_scale" => params.tab_scale = parse_num(key, value)?,
            "pos" => {
                let (x, y) = value
                    .split_once(',')
                    .ok_or_else(|| format!("subtitle error: invalid pos format: {value} (should be <x>,<y>)"))?;
                params.position = Some((parse_num("pos x", x)?, parse_num("pos y", y)?));
            }
            "layout_align" => params.layout = parse_layout_align(value)?,
            "text_align" => params.text_align = parse_text_align(value)?,
            "in_preview" => params.in_preview = parse_bool(key, value)?,
            "in_video" => params.in_video = parse_bool(key, value)?,
            _ => return Err(format!("subtitle error: cannot parse line: {line}")),
        }
    }

    if params.text.is_empty() {
        Ok(None)
    } else {
        Ok(Some(params))
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("subtitle error: invalid {key}: {value}"))
}

fn parse_color(key: &str, value: &str) -> Result<u32, String> {
    let value = value.trim();
    let parsed = if let Some(hex) = value.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    };
    parsed.ok_or_else(|| format!("subtitle error: invalid {key}: {value}"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(format!("subtitle error: invalid {key}: {other}")),
    }
}

/// Comma-separated combination like `bottom,center`.
fn parse_layout_align(value: &str) -> Result<(VerticalAlign, HorizontalAlign), String> {
    let mut vertical = VerticalAlign::Bottom;
    let mut horizontal = HorizontalAlign::Center;
    for token in value.split(',') {
        match token.trim() {
            "top" => vertical = VerticalAlign::Top,
            "middle" => vertical = VerticalAlign::Middle,
            "bottom" => vertical = VerticalAlign::Bottom,
            "left" => horizontal = HorizontalAlign::Left,
            "center" => horizontal = HorizontalAlign::Center,
            "right" => horizontal = HorizontalAlign::Right,
            other => {
                return Err(format!("subtitle error: invalid layout_align found at: {other}"));
            }
        }
    }
    Ok((vertical, horizontal))
}

fn parse_text_align(value: &str) -> Result<TextAlign, String> {
    match value.trim() {
        "left" => Ok(TextAlign::Left),
        "center" => Ok(TextAlign::Center),
        "right" => Ok(TextAlign::Right),
        other => Err(format!("subtitle error: invalid text_align found at: {other}")),
    }
}
