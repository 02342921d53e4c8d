//! The engine: PTS clock, packet ring, and multi-sink fan-out.
//!
//! Encoder collaborators deliver encoded frames through
//! [`Engine::on_encoded_video`] / [`Engine::on_encoded_audio`] on their
//! own threads. Each frame is stamped, appended to the ring, and handed
//! to every enabled sink under that sink's own lock, so a slow sink never
//! blocks capture and a failing sink only loses its own packets.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::PtsClock;
use crate::control::HookEvent;
use crate::hls::HlsSegmenter;
use crate::mpegts::StreamLayout;
use crate::net::rtsp::RtspSender;
use crate::net::tcp::TcpPusher;
use crate::record::{RecSettings, Recorder};
use crate::ring::{EncodedPacket, PacketRing, StreamKind};
use crate::source::{AudioControl, CameraControl, SubtitleRenderer};
use crate::state::StateDir;

/// H.264 access unit delimiter prepended to every IDR.
const ACCESS_UNIT_DELIMITER: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];

const NAL_TYPE_IDR: u8 = 5;
const NAL_TYPE_SPS: u8 = 7;

#[derive(Debug, Clone)]
pub struct EngineParams {
    pub vfr: bool,
    pub video_fps: f64,
    pub audio_fps: f64,
    pub video_pts_step: i64,
    pub audio_pts_step: i64,
    pub record_buffer_keyframes: usize,
    pub hls_keyframes_per_segment: u32,
    pub layout: StreamLayout,
    pub rec_dir: PathBuf,
    pub rec_tmp_dir: PathBuf,
    pub rec_archive_dir: PathBuf,
}

pub struct Sinks {
    pub hls: Option<HlsSegmenter>,
    pub tcp: Option<TcpPusher>,
    pub rtsp: Option<RtspSender>,
}

pub struct Collaborators {
    pub camera: Box<dyn CameraControl>,
    pub audio: Box<dyn AudioControl>,
    pub subtitles: Box<dyn SubtitleRenderer>,
}

pub struct Engine {
    params: EngineParams,
    clock: Mutex<PtsClock>,
    ring: Arc<Mutex<PacketRing>>,
    recorder: Recorder,
    hls: Option<Mutex<HlsSegmenter>>,
    tcp: Option<TcpPusher>,
    rtsp: Option<RtspSender>,
    camera: Box<dyn CameraControl>,
    audio: Box<dyn AudioControl>,
    subtitles: Box<dyn SubtitleRenderer>,
    /// SPS+PPS harvested from the first parameter-set NAL the encoder
    /// produced; replayed in front of every later IDR.
    sps_pps: Mutex<Vec<u8>>,
    /// Modular counter behind the HLS split decision.
    video_send_keyframe_count: AtomicU32,
}

impl Engine {
    pub fn new(
        params: EngineParams,
        state: StateDir,
        sinks: Sinks,
        collaborators: Collaborators,
    ) -> Self {
        if let Err(e) = state.set("record", "false") {
            log::warn!("{e}");
        }
        let ring = Arc::new(Mutex::new(PacketRing::new(
            params.video_fps,
            params.audio_fps,
            params.record_buffer_keyframes,
        )));
        let recorder = Recorder::new(ring.clone(), state, params.layout);
        Self {
            clock: Mutex::new(PtsClock::new(params.video_pts_step, params.audio_pts_step)),
            ring,
            recorder,
            hls: sinks.hls.map(Mutex::new),
            tcp: sinks.tcp,
            rtsp: sinks.rtsp,
            camera: collaborators.camera,
            audio: collaborators.audio,
            subtitles: collaborators.subtitles,
            sps_pps: Mutex::new(Vec::new()),
            video_send_keyframe_count: AtomicU32::new(0),
            params,
        }
    }

    /// Called by the video encoder's output thread with one Annex-B
    /// access unit. The first parameter-set buffer donates SPS/PPS;
    /// every bare IDR afterwards is prefixed with AUD + SPS + PPS so
    /// every keyframe is independently decodable.
    pub fn on_encoded_video(&self, data: &[u8], keyframe: bool) {
        let nal_type = if data.len() > 4 { data[4] & 0x1F } else { 0 };

        let mut prefixed: Option<Vec<u8>> = None;
        if nal_type == NAL_TYPE_SPS {
            match find_idr_start(data) {
                Some(offset) if offset > 0 => {
                    let mut sps_pps = self.sps_pps.lock().unwrap();
                    *sps_pps = data[..offset].to_vec();
                    log::debug!("harvested sps/pps ({} bytes)", sps_pps.len());
                    if let Some(rtsp) = &self.rtsp {
                        if let Err(e) = rtsp.send_video_frame(&sps_pps, 0) {
                            log::error!("{e}");
                        }
                    }
                }
                _ => log::error!("SPS/PPS was not found in the encoded frame"),
            }
        } else if nal_type == NAL_TYPE_IDR {
            let sps_pps = self.sps_pps.lock().unwrap();
            let mut buf =
                Vec::with_capacity(ACCESS_UNIT_DELIMITER.len() + sps_pps.len() + data.len());
            buf.extend_from_slice(&ACCESS_UNIT_DELIMITER);
            buf.extend_from_slice(&sps_pps);
            buf.extend_from_slice(data);
            prefixed = Some(buf);
        }
        let payload = prefixed.as_deref().unwrap_or(data);

        let (pts, frame_count, origin) = {
            let mut clock = self.clock.lock().unwrap();
            let origin = clock.mark_video_started(monotonic_ns());
            let pts = if self.params.vfr {
                clock.next_video_pts_vfr(monotonic_ns())
            } else {
                clock.next_video_pts_cfr()
            };
            (pts, clock.video_frame_count(), origin)
        };
        if let Some(origin) = origin {
            self.announce_capture_started(origin);
        }

        let packet = self.ring.lock().unwrap().append(EncodedPacket {
            pts,
            data: payload.to_vec(),
            stream: StreamKind::Video,
            keyframe,
        });
        self.fan_out(&packet, frame_count);
    }

    /// Called by the audio capture/encode thread with one ADTS AAC frame.
    pub fn on_encoded_audio(&self, data: &[u8]) {
        let (pts, origin) = {
            let mut clock = self.clock.lock().unwrap();
            let origin = clock.mark_audio_started(monotonic_ns());
            (clock.next_audio_pts(), origin)
        };
        if let Some(origin) = origin {
            self.announce_capture_started(origin);
        }

        let packet = self.ring.lock().unwrap().append(EncodedPacket {
            pts,
            data: data.to_vec(),
            stream: StreamKind::Audio,
            keyframe: true,
        });
        self.fan_out(&packet, 0);
    }

    /// Both streams have produced their first frame; tell the pushers
    /// where the logical timeline starts.
    fn announce_capture_started(&self, origin_ns: i64) {
        log::info!("capturing started");
        if let Some(rtsp) = &self.rtsp {
            if let Err(e) = rtsp.send_video_start() {
                log::error!("{e}");
            }
            if let Err(e) = rtsp.send_audio_start(origin_ns) {
                log::error!("{e}");
            }
        }
    }

    /// One packet to every enabled sink. Failures are per-sink: logged,
    /// never propagated, the sink stays live for the next packet.
    fn fan_out(&self, packet: &Arc<EncodedPacket>, video_frame_count: u64) {
        self.recorder.signal_write();

        if let Some(tcp) = &self.tcp {
            if let Err(e) = tcp.send(packet) {
                log::error!("tcp output error: {e}");
            }
        }

        if let Some(rtsp) = &self.rtsp {
            let sent = match packet.stream {
                StreamKind::Video => rtsp.send_video_frame(&packet.data, packet.pts),
                StreamKind::Audio => rtsp.send_audio_frame(&packet.data, packet.pts),
            };
            if let Err(e) = sent {
                log::error!("{e}");
            }
        }

        if let Some(hls) = &self.hls {
            let split = if packet.stream == StreamKind::Video && packet.keyframe {
                self.next_split_decision(video_frame_count)
            } else {
                false
            };
            let mut hls = hls.lock().unwrap();
            if let Err(e) = hls.write_packet(packet, split) {
                log::error!("hls write error: {e}");
                log::error!("please check if the disk is full");
            }
        }
    }

    /// Split every `hls_keyframes_per_segment` video keyframes, except on
    /// the very first video frame. The counter is reduced modulo N before
    /// incrementing, so N=1 splits on every keyframe from the second on.
    fn next_split_decision(&self, video_frame_count: u64) -> bool {
        let n = self.params.hls_keyframes_per_segment.max(1);
        let mut count = self.video_send_keyframe_count.load(Ordering::Relaxed);
        let split = count % n == 0 && video_frame_count != 1;
        count %= n;
        count += 1;
        self.video_send_keyframe_count.store(count, Ordering::Relaxed);
        split
    }

    pub fn handle_hook(&self, event: HookEvent) {
        match event {
            HookEvent::StartRecord {
                basename,
                dir,
                lookback,
            } => {
                let lookback = lookback.and_then(|k| self.clamp_lookback(k));
                let settings = RecSettings {
                    rec_dir: self.params.rec_dir.clone(),
                    rec_tmp_dir: self.params.rec_tmp_dir.clone(),
                    rec_archive_dir: self.params.rec_archive_dir.clone(),
                    basename,
                    dest_dir: dir,
                    lookback_keyframes: lookback,
                };
                if let Err(e) = self.recorder.start(settings) {
                    log::warn!("{e}");
                }
            }
            HookEvent::StopRecord => self.recorder.stop(),
            HookEvent::Mute => self.audio.mute(),
            HookEvent::Unmute => self.audio.unmute(),
            HookEvent::SetWhiteBalanceRed(gain) => {
                if let Err(e) = self.camera.set_white_balance_red(gain) {
                    log::error!("{e}");
                }
            }
            HookEvent::SetWhiteBalanceBlue(gain) => {
                if let Err(e) = self.camera.set_white_balance_blue(gain) {
                    log::error!("{e}");
                }
            }
            HookEvent::SetWhiteBalance(mode) => {
                if let Err(e) = self.camera.set_white_balance(&mode) {
                    log::error!("{e}");
                }
            }
            HookEvent::SetExposure(mode) => {
                if let Err(e) = self.camera.set_exposure(&mode) {
                    log::error!("{e}");
                }
            }
            HookEvent::SetRecordBuffer(keyframes) => {
                if let Err(e) = self.set_record_buffer(keyframes) {
                    log::error!("{e}");
                }
            }
            HookEvent::SetSubtitle(params) => self.subtitles.show(&params),
            HookEvent::ClearSubtitle => self.subtitles.clear(),
        }
    }

    fn clamp_lookback(&self, requested: usize) -> Option<usize> {
        let global = self.ring.lock().unwrap().record_buffer_keyframes();
        if requested > global {
            log::error!(
                "per-recording recordbuf ({requested}) cannot be greater than global \
                 recordbuf ({global}); using {global} \
                 (hint: raise it with --recordbuf {requested} or \
                 \"echo {requested} > hooks/set_recordbuf\")"
            );
            None
        } else {
            log::info!("using recordbuf={requested} for this recording");
            Some(requested)
        }
    }

    /// Change the global pre-roll depth. Disruptive: the buffered
    /// packets are dropped, so it is refused during a recording.
    pub fn set_record_buffer(&self, keyframes: usize) -> Result<(), String> {
        if self.recorder.is_recording() {
            return Err("recordbuf cannot be changed while recording".into());
        }
        if keyframes < 1 {
            return Err(format!("cannot change recordbuf to {keyframes} (must be >= 1)"));
        }
        let mut ring = self.ring.lock().unwrap();
        if ring.record_buffer_keyframes() == keyframes {
            log::debug!("recordbuf unchanged: {keyframes}");
            return Ok(());
        }
        ring.resize(keyframes);
        log::info!("recordbuf set to {keyframes}; existing record buffer cleared");
        Ok(())
    }

    pub fn start_record(&self, settings: RecSettings) -> Result<(), String> {
        self.recorder.start(settings)
    }

    pub fn stop_record(&self) {
        self.recorder.stop();
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub fn hls_most_recent_number(&self) -> Option<u64> {
        self.hls
            .as_ref()
            .map(|hls| hls.lock().unwrap().most_recent_number())
    }

    pub fn ring(&self) -> &Arc<Mutex<PacketRing>> {
        &self.ring
    }

    pub fn record_settings_from_defaults(&self) -> RecSettings {
        RecSettings {
            rec_dir: self.params.rec_dir.clone(),
            rec_tmp_dir: self.params.rec_tmp_dir.clone(),
            rec_archive_dir: self.params.rec_archive_dir.clone(),
            basename: None,
            dest_dir: None,
            lookback_keyframes: None,
        }
    }

    /// Orderly teardown: finalize an active recording, close HLS with its
    /// end-of-stream playlist. The pushers close with their sockets.
    pub fn shutdown(&self) {
        self.recorder.stop_and_join();
        if let Some(hls) = &self.hls {
            if let Err(e) = hls.lock().unwrap().finish() {
                log::error!("hls finalize error: {e}");
            }
        }
        log::info!("pipeline shut down");
    }
}

/// Offset of the `00 00 00 01 <idr>` start code inside an Annex-B
/// buffer, searching from the front.
fn find_idr_start(data: &[u8]) -> Option<usize> {
    data.windows(5).position(|w| {
        w[0] == 0x00 && w[1] == 0x00 && w[2] == 0x00 && w[3] == 0x01 && w[4] & 0x1F == NAL_TYPE_IDR
    })
}

fn monotonic_ns() -> i64 {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() * 1_000_000_000 + ts.tv_nsec(),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::{HlsConfig, HlsSegmenter};
    use crate::source::{NullAudio, NullCamera, NullSubtitles};
    use std::path::Path;

    fn params(root: &Path) -> EngineParams {
        EngineParams {
            vfr: false,
            video_fps: 30.0,
            audio_fps: 46.875,
            video_pts_step: 3000,
            audio_pts_step: 1920,
            record_buffer_keyframes: 5,
            hls_keyframes_per_segment: 1,
            layout: StreamLayout {
                video: true,
                audio: true,
            },
            rec_dir: root.join("rec"),
            rec_tmp_dir: root.join("rec/tmp"),
            rec_archive_dir: root.join("rec/archive"),
        }
    }

    fn engine(root: &Path, hls: bool) -> Engine {
        let state = StateDir::open(root.join("state")).unwrap();
        let hls = hls.then(|| {
            HlsSegmenter::new(HlsConfig {
                dir: root.join("hls"),
                num_recent_files: 3,
                num_retained_old_files: 10,
                encryption: None,
                layout: StreamLayout {
                    video: true,
                    audio: true,
                },
            })
            .unwrap()
        });
        Engine::new(
            params(root),
            state,
            Sinks {
                hls,
                tcp: None,
                rtsp: None,
            },
            Collaborators {
                camera: Box::new(NullCamera),
                audio: Box::new(NullAudio),
                subtitles: Box::new(NullSubtitles),
            },
        )
    }

    fn sps_pps_idr() -> Vec<u8> {
        let mut buf = vec![0x00, 0x00, 0x00, 0x01, 0x27, 0x64, 0x00, 0x29];
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x28, 0xEE, 0x06]);
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x25, 0x88, 0x80, 0x10]);
        buf
    }

    fn bare_idr() -> Vec<u8> {
        vec![0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x80, 0x20]
    }

    fn delta_frame() -> Vec<u8> {
        vec![0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x00]
    }

    #[test]
    fn split_every_keyframe_skips_the_first() {
        // hls_keyframes_per_segment = 1: every keyframe opens its own
        // segment, starting from keyframe #2.
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path(), true);

        engine.on_encoded_video(&sps_pps_idr(), true);
        assert_eq!(engine.hls_most_recent_number(), Some(1));
        engine.on_encoded_video(&delta_frame(), false);
        assert_eq!(engine.hls_most_recent_number(), Some(1));
        engine.on_encoded_video(&bare_idr(), true);
        assert_eq!(engine.hls_most_recent_number(), Some(2));
        engine.on_encoded_video(&bare_idr(), true);
        assert_eq!(engine.hls_most_recent_number(), Some(3));
        engine.shutdown();
    }

    #[test]
    fn idr_frames_get_aud_and_harvested_parameter_sets() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path(), false);

        engine.on_encoded_video(&sps_pps_idr(), true);
        engine.on_encoded_video(&bare_idr(), true);

        let ring = engine.ring().lock().unwrap();
        let newest = ring.get(ring.write_slot()).unwrap();
        let mut expected = vec![0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];
        // Harvested prefix: everything before the IDR start code.
        expected.extend_from_slice(&sps_pps_idr()[..15]);
        expected.extend_from_slice(&bare_idr());
        assert_eq!(newest.data, expected);
    }

    #[test]
    fn stream_pts_are_monotonic_per_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path(), false);

        engine.on_encoded_video(&sps_pps_idr(), true);
        for i in 0..40 {
            if i % 3 != 0 {
                engine.on_encoded_audio(&[0xFF, 0xF1, 0x50, 0x80, 0x04, 0x20, 0xFC]);
            }
            engine.on_encoded_video(&delta_frame(), false);
        }

        let ring = engine.ring().lock().unwrap();
        let mut video_prev = i64::MIN;
        let mut audio_prev = i64::MIN;
        let mut slot = ring.preroll_start_slot(5).unwrap();
        loop {
            if let Some(p) = ring.get(slot) {
                match p.stream {
                    StreamKind::Video => {
                        assert!(p.pts >= video_prev);
                        video_prev = p.pts;
                    }
                    StreamKind::Audio => {
                        assert!(p.pts >= audio_prev);
                        audio_prev = p.pts;
                    }
                }
            }
            if slot == ring.write_slot() {
                break;
            }
            slot = ring.next_slot(slot);
        }
    }

    #[test]
    fn recordbuf_change_is_refused_while_recording() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path(), false);
        engine.on_encoded_video(&sps_pps_idr(), true);

        let mut settings = engine.record_settings_from_defaults();
        settings.basename = Some("busy.ts".into());
        engine.start_record(settings).unwrap();

        let err = engine.set_record_buffer(3).unwrap_err();
        assert_eq!(err, "recordbuf cannot be changed while recording");

        engine.shutdown();
        // Once idle, the resize goes through and clears the buffer.
        engine.set_record_buffer(3).unwrap();
        let ring = engine.ring().lock().unwrap();
        assert_eq!(ring.record_buffer_keyframes(), 3);
        assert!(ring.is_empty());
    }
}
