//! On-disk recording with pre-roll.
//!
//! At most one session runs at a time, on its own worker thread:
//!
//!   Preparing   resolve temp/archive/visible paths, open the temp `.ts`
//!   BackFilling replay the ring from a historical keyframe, translating
//!               PTS so the file starts at zero
//!   Live        woken by the fan-out's edge signal, chase the ring in
//!               10-packet bursts
//!   Flushing    every 5 s, append the temp file to the archive so the
//!               archive stays playable up to the last flush
//!   Finalizing  append the tail, point the visible symlink at the
//!               archive, write the duration sidecar and metadata
//!
//! Ring reads happen under the ring mutex, held only long enough to copy
//! one slot reference.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use serde::Serialize;

use crate::mpegts::{StreamLayout, TsContinuity, TsWriter};
use crate::ring::PacketRing;
use crate::state::{ensure_dir, StateDir};

/// Packets copied from the ring per chase burst.
const REC_CHASE_PACKETS: usize = 10;

/// Wall-clock period between temp → archive flushes.
const FLUSH_PERIOD: Duration = Duration::from_secs(5);

const BUF_WRITER_SIZE: usize = 64 * 1024;

/// Recording refuses to start at or beyond this disk usage.
const DISK_USAGE_LIMIT_PERCENT: u64 = 95;

#[derive(Debug, Clone)]
pub struct RecSettings {
    /// Directory holding the visible symlink to the newest recording.
    pub rec_dir: PathBuf,
    /// Flush staging directory for the temp `.ts`.
    pub rec_tmp_dir: PathBuf,
    /// Default archive directory.
    pub rec_archive_dir: PathBuf,
    /// Basename override from the start_record hook.
    pub basename: Option<String>,
    /// Archive directory override from the start_record hook.
    pub dest_dir: Option<PathBuf>,
    /// Per-session look-back override, already clamped to the global K.
    pub lookback_keyframes: Option<usize>,
}

/// Written beside the archive on finalize.
#[derive(Serialize)]
struct RecordingMetadata {
    file: String,
    video_codec: String,
    audio_codec: String,
    duration_pts: i64,
    duration_seconds: f64,
}

#[derive(Default)]
struct WorkerState {
    is_recording: bool,
    needs_write: bool,
    needs_exit: bool,
}

struct Shared {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

pub struct Recorder {
    shared: Arc<Shared>,
    ring: Arc<Mutex<PacketRing>>,
    state_dir: StateDir,
    layout: StreamLayout,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Recorder {
    pub fn new(ring: Arc<Mutex<PacketRing>>, state_dir: StateDir, layout: StreamLayout) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(WorkerState::default()),
                cond: Condvar::new(),
            }),
            ring,
            state_dir,
            layout,
            thread: Mutex::new(None),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.shared.state.lock().unwrap().is_recording
    }

    /// Spawn the worker for a new session. Fails if a session is active
    /// or the disk is nearly full.
    pub fn start(&self, settings: RecSettings) -> Result<(), String> {
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.is_recording {
                return Err("recording is already started".into());
            }
            if disk_almost_full(&settings.rec_dir) {
                return Err("disk is almost full, recording not started".into());
            }
            st.is_recording = true;
            st.needs_write = false;
            st.needs_exit = false;
        }

        // Reap the previous session's thread, if any.
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        let shared = self.shared.clone();
        let ring = self.ring.clone();
        let state_dir = self.state_dir.clone();
        let layout = self.layout;
        let handle = thread::Builder::new()
            .name("recording".into())
            .spawn(move || {
                if let Err(e) = run_session(&shared, &ring, &state_dir, layout, settings) {
                    log::error!("recording session failed: {e}");
                }
                if let Err(e) = state_dir.set("record", "false") {
                    log::warn!("{e}");
                }
                let mut st = shared.state.lock().unwrap();
                st.is_recording = false;
                st.needs_exit = false;
            })
            .map_err(|e| {
                self.shared.state.lock().unwrap().is_recording = false;
                format!("failed to spawn recording thread: {e}")
            })?;
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Edge signal from the fan-out: one or more packets were appended.
    pub fn signal_write(&self) {
        let mut st = self.shared.state.lock().unwrap();
        if st.is_recording {
            st.needs_write = true;
            self.shared.cond.notify_one();
        }
    }

    /// Ask the worker to finalize. Does not block.
    pub fn stop(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.needs_exit = true;
        self.shared.cond.notify_one();
    }

    /// Stop and wait for the worker to finish (shutdown path).
    pub fn stop_and_join(&self) {
        self.stop();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run_session(
    shared: &Shared,
    ring: &Mutex<PacketRing>,
    state_dir: &StateDir,
    layout: StreamLayout,
    settings: RecSettings,
) -> Result<(), String> {
    // Preparing
    ensure_dir(&settings.rec_dir)?;
    ensure_dir(&settings.rec_tmp_dir)?;
    ensure_dir(&settings.rec_archive_dir)?;
    if let Some(dir) = &settings.dest_dir {
        ensure_dir(dir)?;
    }

    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let paths = decide_paths(&settings, &stamp);
    if fs::remove_file(&paths.archive).is_ok() {
        log::info!("removed existing file: {}", paths.archive.display());
    }

    let file = File::create(&paths.temp)
        .map_err(|e| format!("failed to create {}: {e}", paths.temp.display()))?;
    let mut writer = Some(TsWriter::new(
        BufWriter::with_capacity(BUF_WRITER_SIZE, file),
        layout,
    ));
    writer.as_mut().unwrap().write_header()?;

    log::info!("start recording to {}", paths.archive.display());
    state_dir.set("record", "true")?;

    // BackFilling: pick the starting keyframe, then replay in bursts so
    // the ring lock is never held for long.
    let (mut cursor, start_pts) = {
        let ring = ring.lock().unwrap();
        let lookback = settings
            .lookback_keyframes
            .unwrap_or_else(|| ring.record_buffer_keyframes());
        match ring.preroll_start_slot(lookback) {
            Some(slot) => {
                let pts = ring.get(slot).map(|p| p.pts).unwrap_or(0);
                (slot, pts)
            }
            None => (ring.write_slot(), 0),
        }
    };
    let mut last_written_pts = start_pts;
    loop {
        let caught_up = {
            let ring = ring.lock().unwrap();
            let w = writer.as_mut().unwrap();
            chase(&ring, w, &mut cursor, start_pts, &mut last_written_pts)?.1
        };
        if caught_up {
            break;
        }
    }

    // Live
    let mut flush_deadline = Instant::now() + FLUSH_PERIOD;
    let mut is_caught_up = false;
    loop {
        {
            let mut st = shared.state.lock().unwrap();
            while !st.needs_write && !st.needs_exit {
                st = shared.cond.wait(st).unwrap();
            }
            if st.needs_exit {
                break;
            }
            st.needs_write = false;
        }

        let (wrote, _) = {
            let ring = ring.lock().unwrap();
            let w = writer.as_mut().unwrap();
            chase(&ring, w, &mut cursor, start_pts, &mut last_written_pts)?
        };
        if wrote <= 2 && !is_caught_up {
            log::debug!("recording caught up with the ring");
            is_caught_up = true;
        }

        // Flushing
        if Instant::now() >= flush_deadline {
            flush_to_archive(&mut writer, &paths.temp, &paths.archive, layout)?;
            flush_deadline = Instant::now() + FLUSH_PERIOD;
        }
    }

    // Finalizing
    close_writer(writer.take().unwrap())?;
    append_file(&paths.temp, &paths.archive)?;
    let _ = fs::remove_file(&paths.temp);
    install_symlink(&paths.archive, &paths.visible, &settings.rec_dir)?;
    state_dir.set("last_rec", &paths.visible.to_string_lossy())?;

    let duration_pts = last_written_pts - start_pts;
    let duration_seconds = duration_pts as f64 / 90_000.0;
    state_dir.set(
        &paths.basename,
        &format!("duration_pts={duration_pts}\nduration_sec={duration_seconds}\n"),
    )?;
    write_metadata(&paths.archive, &paths.basename, duration_pts, duration_seconds);

    log::info!(
        "recording finished: {} ({duration_seconds:.2}s)",
        paths.archive.display()
    );
    Ok(())
}

struct SessionPaths {
    basename: String,
    visible: PathBuf,
    archive: PathBuf,
    temp: PathBuf,
}

/// Resolve the session's file names. An explicit basename is used as-is;
/// otherwise the local-time stamp gets a `-N` suffix until the visible
/// path is free.
fn decide_paths(settings: &RecSettings, stamp: &str) -> SessionPaths {
    let dest_dir = settings
        .dest_dir
        .clone()
        .unwrap_or_else(|| settings.rec_archive_dir.clone());

    let basename = match &settings.basename {
        Some(name) => name.clone(),
        None => {
            let mut candidate = format!("{stamp}.ts");
            let mut unique = 1;
            while fs::symlink_metadata(settings.rec_dir.join(&candidate)).is_ok() {
                unique += 1;
                candidate = format!("{stamp}-{unique}.ts");
            }
            candidate
        }
    };

    SessionPaths {
        visible: settings.rec_dir.join(&basename),
        archive: dest_dir.join(&basename),
        temp: settings.rec_tmp_dir.join(&basename),
        basename,
    }
}

/// Copy ring contents into the writer, up to [`REC_CHASE_PACKETS`] per
/// call. Returns (packets written, caught-up flag).
fn chase<W: io::Write>(
    ring: &PacketRing,
    writer: &mut TsWriter<W>,
    cursor: &mut usize,
    origin_pts: i64,
    last_written_pts: &mut i64,
) -> Result<(usize, bool), String> {
    if ring.is_empty() {
        return Ok((0, true));
    }
    let mut wrote = 0;
    loop {
        if wrote == REC_CHASE_PACKETS {
            return Ok((wrote, false));
        }
        if let Some(packet) = ring.get(*cursor) {
            writer.write_packet(
                packet.stream,
                packet.pts - origin_pts,
                &packet.data,
                packet.keyframe,
            )?;
            *last_written_pts = packet.pts;
            wrote += 1;
        }
        let done = *cursor == ring.write_slot();
        *cursor = ring.next_slot(*cursor);
        if done {
            return Ok((wrote, true));
        }
    }
}

fn close_writer(writer: TsWriter<BufWriter<File>>) -> Result<TsContinuity, String> {
    let (buf, continuity) = writer.into_inner();
    buf.into_inner()
        .map_err(|e| format!("failed to flush recording temp: {e}"))?;
    Ok(continuity)
}

/// Close the temp without a trailer, append it to the archive, and reopen
/// it truncated, continuing the same transport stream. The archive is
/// playable up to this point even if the process dies later.
fn flush_to_archive(
    writer: &mut Option<TsWriter<BufWriter<File>>>,
    temp: &Path,
    archive: &Path,
    layout: StreamLayout,
) -> Result<(), String> {
    log::debug!("flushing recording to {}", archive.display());
    let continuity = close_writer(writer.take().unwrap())?;
    append_file(temp, archive)?;
    let file = File::create(temp)
        .map_err(|e| format!("failed to reopen {}: {e}", temp.display()))?;
    *writer = Some(TsWriter::without_header(
        BufWriter::with_capacity(BUF_WRITER_SIZE, file),
        layout,
        continuity,
    ));
    Ok(())
}

fn append_file(src: &Path, dest: &Path) -> Result<u64, String> {
    let mut fsrc =
        File::open(src).map_err(|e| format!("failed to open {}: {e}", src.display()))?;
    let mut fdest = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dest)
        .map_err(|e| format!("failed to open {}: {e}", dest.display()))?;
    io::copy(&mut fsrc, &mut fdest)
        .map_err(|e| format!("failed to append {} to {}: {e}", src.display(), dest.display()))
}

/// Create or replace the visible symlink. Targets inside `rec_dir` are
/// linked relative to it so the whole directory can be moved.
fn install_symlink(archive: &Path, visible: &Path, rec_dir: &Path) -> Result<(), String> {
    let target = if let Ok(rel) = archive.strip_prefix(rec_dir) {
        rel.to_path_buf()
    } else if archive.is_absolute() {
        archive.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(archive))
            .unwrap_or_else(|_| archive.to_path_buf())
    };

    if fs::symlink_metadata(visible).is_ok() {
        log::info!("replacing existing symlink: {}", visible.display());
        let _ = fs::remove_file(visible);
    }
    std::os::unix::fs::symlink(&target, visible).map_err(|e| {
        format!(
            "cannot create symlink {} -> {}: {e}",
            visible.display(),
            target.display()
        )
    })
}

fn write_metadata(archive: &Path, basename: &str, duration_pts: i64, duration_seconds: f64) {
    let metadata = RecordingMetadata {
        file: basename.to_string(),
        video_codec: "h264".into(),
        audio_codec: "aac".into(),
        duration_pts,
        duration_seconds,
    };
    let path = PathBuf::from(format!("{}.json", archive.display()));
    match serde_json::to_string_pretty(&metadata) {
        Ok(json) => {
            if let Err(e) = fs::write(&path, json) {
                log::warn!("failed to write {}: {e}", path.display());
            }
        }
        Err(e) => log::warn!("failed to serialize recording metadata: {e}"),
    }
}

fn disk_almost_full(path: &Path) -> bool {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let blocks = stat.blocks() as f64;
            if blocks == 0.0 {
                return false;
            }
            let used = ((blocks - stat.blocks_free() as f64) * 100.0 / blocks).ceil() as u64;
            log::info!("disk usage {used}%");
            used >= DISK_USAGE_LIMIT_PERCENT
        }
        Err(e) => {
            log::warn!("statvfs {} failed: {e}", path.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpegts::reader::{assert_continuity, parse_pes_pts, split_packets};
    use crate::mpegts::VIDEO_PID;
    use crate::ring::{EncodedPacket, StreamKind};

    fn layout() -> StreamLayout {
        StreamLayout {
            video: true,
            audio: true,
        }
    }

    fn keyframe(pts: i64) -> EncodedPacket {
        let mut data = vec![0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x65, 0x88]);
        EncodedPacket {
            pts,
            data,
            stream: StreamKind::Video,
            keyframe: true,
        }
    }

    fn delta(pts: i64) -> EncodedPacket {
        EncodedPacket {
            pts,
            data: vec![0x00, 0x00, 0x00, 0x01, 0x41, 0x9A],
            stream: StreamKind::Video,
            keyframe: false,
        }
    }

    fn settings(root: &Path) -> RecSettings {
        RecSettings {
            rec_dir: root.join("rec"),
            rec_tmp_dir: root.join("rec/tmp"),
            rec_archive_dir: root.join("rec/archive"),
            basename: None,
            dest_dir: None,
            lookback_keyframes: None,
        }
    }

    fn filled_ring(keyframes: i64) -> Arc<Mutex<PacketRing>> {
        let mut ring = PacketRing::new(30.0, 46.875, 5);
        for kf in 0..keyframes {
            ring.append(keyframe(kf * 90_000));
            for frame in 1..5 {
                ring.append(delta(kf * 90_000 + frame * 3_000));
            }
        }
        Arc::new(Mutex::new(ring))
    }

    fn record_once(ring: Arc<Mutex<PacketRing>>, settings: RecSettings) -> Recorder {
        let tmp_state = settings.rec_dir.parent().unwrap().join("state");
        let state_dir = StateDir::open(tmp_state).unwrap();
        let recorder = Recorder::new(ring, state_dir, layout());
        recorder.start(settings).unwrap();
        recorder.stop_and_join();
        recorder
    }

    #[test]
    fn backfill_starts_at_a_keyframe_with_zero_pts() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = settings(tmp.path());
        s.basename = Some("clip.ts".into());
        s.lookback_keyframes = Some(2);
        record_once(filled_ring(4), s);

        let data = fs::read(tmp.path().join("rec/archive/clip.ts")).unwrap();
        let packets = split_packets(&data);
        assert_continuity(&packets);

        // First media packet is a video keyframe (random access + PCR)
        // whose PTS was translated to the session origin.
        let first_video = packets.iter().find(|p| p.pid == VIDEO_PID).unwrap();
        assert!(first_video.random_access);
        assert_eq!(parse_pes_pts(&first_video.payload), Some(0));
    }

    #[test]
    fn lookback_reaches_the_requested_keyframe() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = settings(tmp.path());
        s.basename = Some("clip.ts".into());
        s.lookback_keyframes = Some(2);
        record_once(filled_ring(4), s);

        // Keyframes at 0, 90_000, 180_000, 270_000; lookback 2 starts the
        // session at 180_000, so the sidecar spans two GOPs minus one frame.
        let sidecar = fs::read_to_string(tmp.path().join("state/clip.ts")).unwrap();
        assert!(sidecar.contains("duration_pts=102000\n"), "got: {sidecar}");
        assert!(sidecar.contains("duration_sec=1.13"), "got: {sidecar}");
    }

    #[test]
    fn finalize_installs_symlink_sidecar_and_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = settings(tmp.path());
        s.basename = Some("clip.ts".into());
        record_once(filled_ring(3), s);

        let visible = tmp.path().join("rec/clip.ts");
        let link = fs::read_link(&visible).unwrap();
        assert_eq!(link, PathBuf::from("archive/clip.ts"));
        assert!(fs::read(&visible).is_ok(), "symlink should resolve");
        assert!(!tmp.path().join("rec/tmp/clip.ts").exists());

        let state = fs::read_to_string(tmp.path().join("state/record")).unwrap();
        assert_eq!(state, "false");
        let last = fs::read_to_string(tmp.path().join("state/last_rec")).unwrap();
        assert!(last.ends_with("rec/clip.ts"));

        let meta: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(tmp.path().join("rec/archive/clip.ts.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta["video_codec"], "h264");
        assert!(meta["duration_pts"].as_i64().unwrap() > 0);
    }

    #[test]
    fn second_start_while_recording_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let ring = filled_ring(3);
        let state_dir = StateDir::open(tmp.path().join("state")).unwrap();
        let recorder = Recorder::new(ring, state_dir, layout());

        let mut s = settings(tmp.path());
        s.basename = Some("one.ts".into());
        recorder.start(s).unwrap();

        let mut s2 = settings(tmp.path());
        s2.basename = Some("two.ts".into());
        let err = recorder.start(s2).unwrap_err();
        assert!(err.contains("already started"));

        recorder.stop_and_join();
        assert!(!recorder.is_recording());
    }

    #[test]
    fn auto_basename_gets_a_unique_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let s = settings(tmp.path());
        fs::create_dir_all(&s.rec_dir).unwrap();
        fs::write(s.rec_dir.join("2026-01-01_00-00-00.ts"), b"").unwrap();

        let paths = decide_paths(&s, "2026-01-01_00-00-00");
        assert_eq!(paths.basename, "2026-01-01_00-00-00-2.ts");
        assert!(paths.temp.ends_with("rec/tmp/2026-01-01_00-00-00-2.ts"));
    }

    #[test]
    fn flush_keeps_the_archive_playable_and_continuous() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("tmp")).unwrap();
        let temp = tmp.path().join("tmp/clip.ts");
        let archive = tmp.path().join("clip.ts");

        let file = File::create(&temp).unwrap();
        let mut writer = Some(TsWriter::new(
            BufWriter::with_capacity(BUF_WRITER_SIZE, file),
            layout(),
        ));
        writer.as_mut().unwrap().write_header().unwrap();
        for i in 0..3 {
            let p = keyframe(i * 3_000);
            writer
                .as_mut()
                .unwrap()
                .write_packet(p.stream, p.pts, &p.data, true)
                .unwrap();
        }

        flush_to_archive(&mut writer, &temp, &archive, layout()).unwrap();

        // Archive alone is a valid stream; temp restarted empty.
        let after_flush = fs::read(&archive).unwrap();
        assert!(!after_flush.is_empty());
        assert_continuity(&split_packets(&after_flush));
        assert_eq!(fs::metadata(&temp).unwrap().len(), 0);

        // More packets, then the finalize append: still one stream.
        for i in 3..6 {
            let p = keyframe(i * 3_000);
            writer
                .as_mut()
                .unwrap()
                .write_packet(p.stream, p.pts, &p.data, true)
                .unwrap();
        }
        close_writer(writer.take().unwrap()).unwrap();
        append_file(&temp, &archive).unwrap();
        let full = fs::read(&archive).unwrap();
        assert!(full.len() > after_flush.len());
        assert_continuity(&split_packets(&full));
    }
}
