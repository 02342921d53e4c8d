//! RTSP sidecar pusher over UNIX-domain sockets.
//!
//! The sidecar server exposes four SOCK_STREAM endpoints: video-control,
//! audio-control, video-data, audio-data.
//!
//! Wire layout, big-endian:
//!   control: {payload size (3 bytes)}{type 0x00}{stream name}            — video
//!            {payload size (3 bytes)}{type 0x01}{start time ns (8 bytes)} — audio
//!   data:    {payload size (3 bytes)}{type 0x02|0x03}{pts (6 bytes)}{payload}
//!
//! The audio start time is CLOCK_MONOTONIC nanoseconds: an opaque logical
//! origin, not wall-clock time.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const PACKET_TYPE_VIDEO_START: u8 = 0x00;
pub const PACKET_TYPE_AUDIO_START: u8 = 0x01;
pub const PACKET_TYPE_VIDEO_DATA: u8 = 0x02;
pub const PACKET_TYPE_AUDIO_DATA: u8 = 0x03;

/// Stream name announced on the video control socket; the sidecar maps
/// it to its RTSP mount point.
pub const STREAM_NAME: &[u8] = b"live/picam";

#[derive(Debug, Clone)]
pub struct RtspConfig {
    pub video_control_path: PathBuf,
    pub audio_control_path: PathBuf,
    pub video_data_path: PathBuf,
    pub audio_data_path: PathBuf,
}

#[derive(Debug)]
pub struct RtspSender {
    video_control: Mutex<UnixStream>,
    audio_control: Mutex<UnixStream>,
    video_data: Mutex<UnixStream>,
    audio_data: Mutex<UnixStream>,
}

impl RtspSender {
    /// Connect all four sockets. Failing here is a startup error: the
    /// sidecar server is expected to be listening already.
    pub fn connect(config: &RtspConfig) -> Result<Self, String> {
        Ok(Self {
            video_control: Mutex::new(connect(&config.video_control_path, "video control")?),
            audio_control: Mutex::new(connect(&config.audio_control_path, "audio control")?),
            video_data: Mutex::new(connect(&config.video_data_path, "video data")?),
            audio_data: Mutex::new(connect(&config.audio_data_path, "audio data")?),
        })
    }

    /// Announce the stream name on the video control socket.
    pub fn send_video_start(&self) -> Result<(), String> {
        send(&self.video_control, &video_start_message(), "video start")
    }

    /// Ship the capture origin on the audio control socket.
    pub fn send_audio_start(&self, start_time_ns: i64) -> Result<(), String> {
        send(
            &self.audio_control,
            &audio_start_message(start_time_ns),
            "audio start",
        )
    }

    pub fn send_video_frame(&self, data: &[u8], pts: i64) -> Result<(), String> {
        send(
            &self.video_data,
            &data_message(PACKET_TYPE_VIDEO_DATA, pts, data),
            "video frame",
        )
    }

    pub fn send_audio_frame(&self, data: &[u8], pts: i64) -> Result<(), String> {
        send(
            &self.audio_data,
            &data_message(PACKET_TYPE_AUDIO_DATA, pts, data),
            "audio frame",
        )
    }
}

fn connect(path: &Path, label: &str) -> Result<UnixStream, String> {
    UnixStream::connect(path).map_err(|e| {
        format!(
            "failed to connect to {label} socket ({}): {e}\n\
             perhaps the RTSP sidecar server is not running?",
            path.display()
        )
    })
}

fn send(socket: &Mutex<UnixStream>, message: &[u8], label: &str) -> Result<(), String> {
    socket
        .lock()
        .unwrap()
        .write_all(message)
        .map_err(|e| format!("rtsp {label} send failed: {e}"))
}

fn push_payload_size(buf: &mut Vec<u8>, size: usize) {
    buf.push((size >> 16) as u8);
    buf.push((size >> 8) as u8);
    buf.push(size as u8);
}

fn video_start_message() -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + 1 + STREAM_NAME.len());
    push_payload_size(&mut buf, 1 + STREAM_NAME.len());
    buf.push(PACKET_TYPE_VIDEO_START);
    buf.extend_from_slice(STREAM_NAME);
    buf
}

fn audio_start_message(start_time_ns: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    push_payload_size(&mut buf, 9);
    buf.push(PACKET_TYPE_AUDIO_START);
    buf.extend_from_slice(&start_time_ns.to_be_bytes());
    buf
}

fn data_message(packet_type: u8, pts: i64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + 7 + payload.len());
    push_payload_size(&mut buf, payload.len() + 7);
    buf.push(packet_type);
    buf.extend_from_slice(&pts.to_be_bytes()[2..8]); // low 6 bytes
    buf.extend_from_slice(payload);
    buf
}
