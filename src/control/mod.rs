//! Control surface: hook files translated into engine actions.
//!
//! The hook file's *name* selects the command; the body carries
//! parameters as `key=value` lines. Files are consumed (deleted) by the
//! watcher after dispatch.

pub mod subtitle;

use std::path::PathBuf;

use self::subtitle::SubtitleParams;

#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    StartRecord {
        basename: Option<String>,
        dir: Option<PathBuf>,
        /// Per-session look-back, still unclamped against the global K.
        lookback: Option<usize>,
    },
    StopRecord,
    Mute,
    Unmute,
    SetWhiteBalanceRed(f32),
    SetWhiteBalanceBlue(f32),
    SetWhiteBalance(String),
    SetExposure(String),
    SetRecordBuffer(usize),
    SetSubtitle(SubtitleParams),
    ClearSubtitle,
}

/// Translate a consumed hook file into an event. `name` is the file's
/// name, `content` its body.
pub fn parse_hook(name: &str, content: &str) -> Result<HookEvent, String> {
    match name {
        "start_record" => Ok(parse_start_record(content)),
        "stop_record" => Ok(HookEvent::StopRecord),
        "mute" => Ok(HookEvent::Mute),
        "unmute" => Ok(HookEvent::Unmute),
        "wbred" => parse_gain(content)
            .map(HookEvent::SetWhiteBalanceRed)
            .map_err(|e| format!("failed to set wbred: {e}")),
        "wbblue" => parse_gain(content)
            .map(HookEvent::SetWhiteBalanceBlue)
            .map_err(|e| format!("failed to set wbblue: {e}")),
        "set_recordbuf" => {
            let value: usize = content
                .trim()
                .parse()
                .map_err(|_| format!("invalid recordbuf: {}", content.trim()))?;
            if value < 1 {
                return Err(format!("invalid recordbuf: {value} (must be >= 1)"));
            }
            Ok(HookEvent::SetRecordBuffer(value))
        }
        "subtitle" => match subtitle::parse_subtitle_body(content)? {
            Some(params) => Ok(HookEvent::SetSubtitle(params)),
            None => Ok(HookEvent::ClearSubtitle),
        },
        _ => {
            if let Some(mode) = name.strip_prefix("wb_") {
                Ok(HookEvent::SetWhiteBalance(mode.to_string()))
            } else if let Some(mode) = name.strip_prefix("ex_") {
                Ok(HookEvent::SetExposure(mode.to_string()))
            } else {
                Err(format!("invalid hook: {name}"))
            }
        }
    }
}

fn parse_gain(content: &str) -> Result<f32, String> {
    content
        .trim()
        .parse::<f32>()
        .map_err(|_| format!("invalid gain: {}", content.trim()))
}

/// Body of `hooks/start_record`: `recordbuf=N`, `dir=...`, `filename=...`,
/// all optional. Malformed lines are logged and skipped, like every other
/// partially-valid hook body.
fn parse_start_record(content: &str) -> HookEvent {
    let mut basename = None;
    let mut dir = None;
    let mut lookback = None;

    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            log::error!("error parsing start_record line: {line}");
            continue;
        };
        match key {
            "recordbuf" => match value.trim().parse::<usize>() {
                Ok(v) => lookback = Some(v),
                Err(_) => log::error!("error parsing start_record line: {line}"),
            },
            "dir" => dir = Some(PathBuf::from(value)),
            "filename" => basename = Some(value.to_string()),
            _ => log::error!("failed to parse start_record line: {line}"),
        }
    }

    HookEvent::StartRecord {
        basename,
        dir,
        lookback,
    }
}
