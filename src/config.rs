//! Command-line surface and derived pipeline parameters.

use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;

use crate::clock::PtsClock;
use crate::hls::crypto::SegmentEncryption;
use crate::mpegts::StreamLayout;
use crate::net::rtsp::RtspConfig;

#[derive(Parser, Debug, Clone, Serialize)]
#[command(name = "picast", version, about = "Live H.264/AAC MPEG-TS pipeline with HLS, \
pre-roll recording, TCP and RTSP-sidecar outputs")]
pub struct Options {
    /// Video width
    #[arg(short = 'w', long = "width", default_value_t = 1280)]
    pub video_width: u32,

    /// Video height
    #[arg(short = 'H', long = "height", default_value_t = 720)]
    pub video_height: u32,

    /// Video frame rate
    #[arg(short = 'f', long = "fps", default_value_t = 30.0)]
    pub video_fps: f64,

    /// H.264 bit rate (bits per second)
    #[arg(short = 'v', long = "videobitrate", default_value_t = 2_000_000)]
    pub video_bitrate: u64,

    /// Distance between two keyframes (defaults to one second of frames)
    #[arg(short = 'g', long = "gopsize")]
    pub gop_size: Option<u32>,

    /// Use variable frame rate (PTS from arrival time instead of a fixed step)
    #[arg(long = "vfr")]
    pub vfr: bool,

    /// Minimum frame rate in VFR mode
    #[arg(long = "minfps")]
    pub min_fps: Option<f64>,

    /// Maximum frame rate in VFR mode
    #[arg(long = "maxfps")]
    pub max_fps: Option<f64>,

    /// Audio channels (1 or 2)
    #[arg(short = 'c', long = "channels", default_value_t = 1)]
    pub audio_channels: u32,

    /// Audio sample rate
    #[arg(short = 'r', long = "samplerate", default_value_t = 48_000)]
    pub audio_sample_rate: u32,

    /// AAC bit rate (bits per second)
    #[arg(short = 'a', long = "audiobitrate", default_value_t = 40_000)]
    pub audio_bitrate: u64,

    /// Capture period size in samples (one encoded frame per period)
    #[arg(long = "audioperiodsize", default_value_t = 1024)]
    pub audio_period_size: u32,

    /// Microphone volume multiplier
    #[arg(long = "volume", default_value_t = 1.0)]
    pub audio_volume_multiply: f64,

    /// Disable audio capture entirely
    #[arg(long = "noaudio")]
    pub no_audio: bool,

    /// Enable HLS output into this directory
    #[arg(short = 'o', long = "hlsdir")]
    pub hls_output_dir: Option<PathBuf>,

    /// Segments listed in the HLS playlist
    #[arg(long = "hlsnumberofsegments", default_value_t = 3)]
    pub hls_number_of_segments: usize,

    /// Video keyframes per HLS segment
    #[arg(long = "hlskeyframespersegment", default_value_t = 1)]
    pub hls_keyframes_per_segment: u32,

    /// AES-128-CBC encrypt finished HLS segments
    #[arg(long = "hlsenc")]
    pub hls_encryption: bool,

    /// Key URI written into the playlist's #EXT-X-KEY line
    #[arg(long = "hlsenckeyuri")]
    pub hls_encryption_key_uri: Option<String>,

    /// Encryption key, 32 hex digits
    #[arg(long = "hlsenckey")]
    pub hls_encryption_key: Option<String>,

    /// Encryption IV, 32 hex digits
    #[arg(long = "hlsenciv")]
    pub hls_encryption_iv: Option<String>,

    /// Push packets to an RTSP sidecar over UNIX-domain sockets
    #[arg(long = "rtspout")]
    pub rtsp_out: bool,

    #[arg(long = "rtspvideocontrolpath", default_value = "/tmp/node_rtsp_rtmp_videoControl")]
    pub rtsp_video_control_path: PathBuf,

    #[arg(long = "rtspaudiocontrolpath", default_value = "/tmp/node_rtsp_rtmp_audioControl")]
    pub rtsp_audio_control_path: PathBuf,

    #[arg(long = "rtspvideodatapath", default_value = "/tmp/node_rtsp_rtmp_videoData")]
    pub rtsp_video_data_path: PathBuf,

    #[arg(long = "rtspaudiodatapath", default_value = "/tmp/node_rtsp_rtmp_audioData")]
    pub rtsp_audio_data_path: PathBuf,

    /// Push the MPEG-TS stream to tcp://host:port
    #[arg(long = "tcpout")]
    pub tcp_output: Option<String>,

    /// Keyframes of pre-roll kept for recordings
    #[arg(long = "recordbuf", default_value_t = 5)]
    pub record_buffer_keyframes: usize,

    /// Directory of the visible recording symlink
    #[arg(long = "recdir", default_value = "rec")]
    pub rec_dir: PathBuf,

    /// Recording flush staging directory
    #[arg(long = "rectmpdir", default_value = "rec/tmp")]
    pub rec_tmp_dir: PathBuf,

    /// Recording archive directory
    #[arg(long = "recarchivedir", default_value = "rec/archive")]
    pub rec_archive_dir: PathBuf,

    /// Directory for state files
    #[arg(long = "statedir", default_value = "state")]
    pub state_dir: PathBuf,

    /// Directory watched for hook files
    #[arg(long = "hooksdir", default_value = "hooks")]
    pub hooks_dir: PathBuf,

    /// Replay an Annex-B H.264 file as the video source
    #[arg(long = "videoin")]
    pub video_in: Option<PathBuf>,

    /// Replay an ADTS AAC file as the audio source
    #[arg(long = "audioin")]
    pub audio_in: Option<PathBuf>,

    /// Default log filter `debug` instead of `info`
    #[arg(long = "verbose")]
    pub verbose: bool,

    /// Print the resolved configuration as JSON and exit
    #[arg(long = "query")]
    pub query: bool,
}

impl Options {
    pub fn validate(&self) -> Result<(), String> {
        if self.video_fps <= 0.0 {
            return Err(format!("invalid fps: {}", self.video_fps));
        }
        if self.audio_channels != 1 && self.audio_channels != 2 {
            return Err(format!(
                "invalid channels: {} (must be 1 or 2)",
                self.audio_channels
            ));
        }
        if self.audio_sample_rate == 0 || self.audio_period_size == 0 {
            return Err("samplerate and audioperiodsize must be positive".into());
        }
        if self.record_buffer_keyframes < 1 {
            return Err(format!(
                "invalid recordbuf: {} (must be >= 1)",
                self.record_buffer_keyframes
            ));
        }
        if self.hls_number_of_segments < 1 || self.hls_keyframes_per_segment < 1 {
            return Err("hlsnumberofsegments and hlskeyframespersegment must be >= 1".into());
        }
        if let (Some(min), Some(max)) = (self.min_fps, self.max_fps) {
            if min > max {
                return Err(format!("minfps ({min}) is greater than maxfps ({max})"));
            }
        }
        if self.hls_encryption {
            if self.hls_encryption_key_uri.is_none() {
                return Err("hlsenc requires --hlsenckeyuri".into());
            }
            self.hls_encryption_settings()?;
        }
        Ok(())
    }

    pub fn video_pts_step(&self) -> i64 {
        PtsClock::video_step_for_fps(self.video_fps)
    }

    pub fn audio_pts_step(&self) -> i64 {
        PtsClock::audio_step_for(self.audio_sample_rate, self.audio_period_size)
    }

    /// Audio packets per second: one AAC frame per capture period.
    pub fn audio_fps(&self) -> f64 {
        f64::from(self.audio_sample_rate) / f64::from(self.audio_period_size)
    }

    pub fn resolved_gop_size(&self) -> u32 {
        self.gop_size.unwrap_or(self.video_fps.ceil() as u32)
    }

    pub fn stream_layout(&self) -> StreamLayout {
        StreamLayout {
            video: true,
            audio: !self.no_audio,
        }
    }

    pub fn rtsp_config(&self) -> RtspConfig {
        RtspConfig {
            video_control_path: self.rtsp_video_control_path.clone(),
            audio_control_path: self.rtsp_audio_control_path.clone(),
            video_data_path: self.rtsp_video_data_path.clone(),
            audio_data_path: self.rtsp_audio_data_path.clone(),
        }
    }

    /// Key/IV/URI for HLS segment encryption, when enabled.
    pub fn hls_encryption_settings(&self) -> Result<Option<SegmentEncryption>, String> {
        if !self.hls_encryption {
            return Ok(None);
        }
        let key = self
            .hls_encryption_key
            .as_deref()
            .ok_or("hlsenc requires --hlsenckey")
            .and_then(|s| parse_hex_16(s).map_err(|_| "invalid --hlsenckey (want 32 hex digits)"))
            .map_err(String::from)?;
        let iv = self
            .hls_encryption_iv
            .as_deref()
            .ok_or("hlsenc requires --hlsenciv")
            .and_then(|s| parse_hex_16(s).map_err(|_| "invalid --hlsenciv (want 32 hex digits)"))
            .map_err(String::from)?;
        let key_uri = self
            .hls_encryption_key_uri
            .clone()
            .ok_or("hlsenc requires --hlsenckeyuri")?;
        Ok(Some(SegmentEncryption { key, iv, key_uri }))
    }
}

/// 32 hex digits (an optional 0x prefix is accepted) into 16 bytes.
pub fn parse_hex_16(input: &str) -> Result<[u8; 16], String> {
    let hex = input.strip_prefix("0x").unwrap_or(input);
    if hex.len() != 32 {
        return Err(format!("want 32 hex digits, got {}", hex.len()));
    }
    let mut out = [0u8; 16];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).map_err(|_| "invalid hex".to_string())?;
        out[i] = u8::from_str_radix(s, 16).map_err(|_| format!("invalid hex byte: {s}"))?;
    }
    Ok(out)
}
