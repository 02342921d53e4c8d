//! File-backed packet sources.
//!
//! The capture hardware and encoders live outside this crate, so the
//! binary can instead replay pre-encoded files through the engine: an
//! Annex-B H.264 elementary stream for video and an ADTS AAC stream for
//! audio. Frames are delivered at the configured cadence on plain
//! threads, just like the encoder callbacks would.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::engine::Engine;

/// Samples per AAC frame; an ADTS frame covers one encoder period.
const AAC_FRAME_SAMPLES: u32 = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct AccessUnit {
    pub data: Vec<u8>,
    pub keyframe: bool,
}

/// Split an Annex-B elementary stream into access units. Non-VCL NAL
/// units (SPS, PPS, SEI, AUD) stick to the VCL NAL that follows them, so
/// a parameter-set run and its IDR travel as one unit, the way the
/// hardware encoder delivers them.
pub fn split_access_units(data: &[u8]) -> Vec<AccessUnit> {
    let starts = nal_start_positions(data);
    let mut units = Vec::new();
    let mut unit_start: Option<usize> = None;
    let mut keyframe = false;

    for (i, &(sc_offset, header_offset)) in starts.iter().enumerate() {
        let end = starts
            .get(i + 1)
            .map(|&(next_sc, _)| next_sc)
            .unwrap_or(data.len());
        if unit_start.is_none() {
            unit_start = Some(sc_offset);
        }
        let nal_type = data[header_offset] & 0x1F;
        if nal_type == 5 {
            keyframe = true;
        }
        // A VCL NAL (coded slice) closes the access unit.
        if nal_type == 1 || nal_type == 5 {
            units.push(AccessUnit {
                data: data[unit_start.take().unwrap()..end].to_vec(),
                keyframe,
            });
            keyframe = false;
        }
    }
    if let Some(start) = unit_start {
        units.push(AccessUnit {
            data: data[start..].to_vec(),
            keyframe,
        });
    }
    units
}

/// `(start code offset, NAL header offset)` for every NAL in the buffer.
/// Both three- and four-byte start codes are recognized.
fn nal_start_positions(data: &[u8]) -> Vec<(usize, usize)> {
    let mut positions = Vec::new();
    let mut i = 0;
    while i + 3 < data.len() {
        if data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x01 {
            let sc_offset = if i > 0 && data[i - 1] == 0x00 { i - 1 } else { i };
            positions.push((sc_offset, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }
    positions
}

/// Split an ADTS stream into frames, header included. Bytes that do not
/// start with an ADTS sync word are skipped with a warning.
pub fn split_adts_frames(data: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut i = 0;
    while i + 7 <= data.len() {
        if data[i] != 0xFF || data[i + 1] & 0xF0 != 0xF0 {
            log::warn!("skipping garbage before ADTS sync at offset {i}");
            i += 1;
            continue;
        }
        let frame_len = ((data[i + 3] as usize & 0x03) << 11)
            | ((data[i + 4] as usize) << 3)
            | ((data[i + 5] as usize) >> 5);
        if frame_len < 7 || i + frame_len > data.len() {
            break;
        }
        frames.push(data[i..i + frame_len].to_vec());
        i += frame_len;
    }
    frames
}

/// Feed an Annex-B file through the engine at `fps`.
pub fn spawn_video_replay(
    engine: Arc<Engine>,
    path: &Path,
    fps: f64,
    keep_running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, String> {
    let data =
        fs::read(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let units = split_access_units(&data);
    if units.is_empty() {
        return Err(format!("no H.264 access units found in {}", path.display()));
    }
    log::info!("video replay: {} access units from {}", units.len(), path.display());

    let frame_interval = Duration::from_secs_f64(1.0 / fps);
    thread::Builder::new()
        .name("video-replay".into())
        .spawn(move || {
            for unit in &units {
                if !keep_running.load(Ordering::Relaxed) {
                    break;
                }
                engine.on_encoded_video(&unit.data, unit.keyframe);
                thread::sleep(frame_interval);
            }
            log::info!("video replay finished");
        })
        .map_err(|e| format!("failed to spawn video replay thread: {e}"))
}

/// Feed an ADTS file through the engine at the sample-rate cadence.
pub fn spawn_audio_replay(
    engine: Arc<Engine>,
    path: &Path,
    sample_rate: u32,
    keep_running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, String> {
    let data =
        fs::read(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let frames = split_adts_frames(&data);
    if frames.is_empty() {
        return Err(format!("no ADTS frames found in {}", path.display()));
    }
    log::info!("audio replay: {} frames from {}", frames.len(), path.display());

    let frame_interval = Duration::from_secs_f64(f64::from(AAC_FRAME_SAMPLES) / f64::from(sample_rate));
    thread::Builder::new()
        .name("audio-replay".into())
        .spawn(move || {
            for frame in &frames {
                if !keep_running.load(Ordering::Relaxed) {
                    break;
                }
                engine.on_encoded_audio(frame);
                thread::sleep(frame_interval);
            }
            log::info!("audio replay finished");
        })
        .map_err(|e| format!("failed to spawn audio replay thread: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(nal_type: u8, body_len: usize) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x00, 0x01, nal_type];
        v.extend(std::iter::repeat(0xAA).take(body_len));
        v
    }

    #[test]
    fn parameter_sets_travel_with_their_idr() {
        let mut stream = Vec::new();
        stream.extend(nal(0x27, 8)); // SPS
        stream.extend(nal(0x28, 4)); // PPS
        stream.extend(nal(0x25, 20)); // IDR
        stream.extend(nal(0x21, 16)); // non-IDR slice
        stream.extend(nal(0x21, 16));

        let units = split_access_units(&stream);
        assert_eq!(units.len(), 3);
        assert!(units[0].keyframe);
        assert_eq!(units[0].data.len(), 13 + 9 + 25);
        assert_eq!(units[0].data[4] & 0x1F, 7);
        assert!(!units[1].keyframe);
        assert_eq!(units[1].data[4] & 0x1F, 1);
    }

    #[test]
    fn three_byte_start_codes_are_recognized() {
        let mut stream = vec![0x00, 0x00, 0x01, 0x65, 0x10, 0x20];
        stream.extend_from_slice(&[0x00, 0x00, 0x01, 0x41, 0x30]);
        let units = split_access_units(&stream);
        assert_eq!(units.len(), 2);
        assert!(units[0].keyframe);
        assert_eq!(units[0].data, [0x00, 0x00, 0x01, 0x65, 0x10, 0x20]);
    }

    #[test]
    fn adts_frames_split_on_the_embedded_length() {
        // Two minimal ADTS frames: 7-byte header + payload.
        fn adts(payload_len: usize) -> Vec<u8> {
            let frame_len = 7 + payload_len;
            let mut v = vec![0xFF, 0xF1, 0x50];
            v.push(((frame_len >> 11) & 0x03) as u8);
            v.push(((frame_len >> 3) & 0xFF) as u8);
            v.push((((frame_len & 0x07) << 5) | 0x1F) as u8);
            v.push(0xFC);
            v.extend(std::iter::repeat(0x55).take(payload_len));
            v
        }
        let mut stream = adts(20);
        stream.extend(adts(33));

        let frames = split_adts_frames(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 27);
        assert_eq!(frames[1].len(), 40);
    }

    #[test]
    fn truncated_last_adts_frame_is_dropped() {
        let mut stream = vec![0xFF, 0xF1, 0x50, 0x00, 0x0A, 0x1F, 0xFC]; // claims 80+ bytes
        stream.extend_from_slice(&[0x01, 0x02]);
        assert!(split_adts_frames(&stream).is_empty());
    }
}
