//! HTTP Live Streaming segmenter.
//!
//! Consumes the fan-out's packet stream, rotates `<seq>.ts` segment files
//! on video-keyframe splits, and rewrites `index.m3u8` atomically after
//! every rotation. Continuity counters are carried from one segment file
//! into the next so the concatenation of all segments is one valid
//! transport stream. Finished segments are optionally AES-128-CBC
//! encrypted in place.

pub mod crypto;

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;

use crate::mpegts::{StreamLayout, TsContinuity, TsWriter};
use crate::ring::{EncodedPacket, StreamKind};
use crate::state::ensure_dir;
use self::crypto::SegmentEncryption;

const INDEX_FILENAME: &str = "index.m3u8";

/// Finished segments kept on disk beyond the ones listed in the playlist.
pub const DEFAULT_NUM_RETAINED_OLD_FILES: usize = 10;

const BUF_WRITER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct HlsConfig {
    pub dir: PathBuf,
    /// Segments listed in the playlist.
    pub num_recent_files: usize,
    /// Extra finished segments retained on disk before unlinking.
    pub num_retained_old_files: usize,
    pub encryption: Option<SegmentEncryption>,
    pub layout: StreamLayout,
}

pub struct HlsSegmenter {
    config: HlsConfig,
    writer: Option<TsWriter<BufWriter<File>>>,
    /// Monotonic sequence number of the newest segment file.
    most_recent_number: u64,
    segment_start_pts: i64,
    last_packet_pts: i64,
    segment_durations: Vec<f64>,
    segment_durations_idx: usize,
    is_started: bool,
}

impl HlsSegmenter {
    pub fn new(config: HlsConfig) -> Result<Self, String> {
        ensure_dir(&config.dir)?;
        let durations = vec![0.0; config.num_recent_files];
        Ok(Self {
            config,
            writer: None,
            most_recent_number: 0,
            segment_start_pts: 0,
            last_packet_pts: 0,
            segment_durations: durations,
            segment_durations_idx: 0,
            is_started: false,
        })
    }

    pub fn most_recent_number(&self) -> u64 {
        self.most_recent_number
    }

    /// Write one packet, rotating the segment first when `split` is set.
    /// The fan-out decides splits (every Nth video keyframe).
    pub fn write_packet(&mut self, packet: &EncodedPacket, split: bool) -> Result<(), String> {
        if !self.is_started {
            self.is_started = true;
            self.open_next_segment(TsContinuity::default())?;
            self.segment_start_pts = packet.pts;
            self.segment_durations_idx = 0;
        }

        if split {
            self.push_duration(packet.pts);
            self.segment_start_pts = packet.pts;
            self.rotate()?;
        }

        if packet.stream == StreamKind::Video || !self.config.layout.video {
            self.last_packet_pts = packet.pts;
        }

        let writer = self.writer.as_mut().ok_or("hls segment writer missing")?;
        writer.write_packet(packet.stream, packet.pts, &packet.data, packet.keyframe)
    }

    /// Close the current segment and write the final playlist with
    /// `#EXT-X-ENDLIST`.
    pub fn finish(&mut self) -> Result<(), String> {
        if !self.is_started {
            return Ok(());
        }
        self.is_started = false;
        self.close_current_segment()?;
        self.push_duration(self.last_packet_pts);
        self.write_index(true)
    }

    fn rotate(&mut self) -> Result<(), String> {
        let continuity = self.close_current_segment()?;
        self.write_index(false)?;
        self.open_next_segment(continuity)
    }

    fn open_next_segment(&mut self, continuity: TsContinuity) -> Result<(), String> {
        self.most_recent_number += 1;
        let path = self.segment_path(self.most_recent_number);
        let file = File::create(&path)
            .map_err(|e| format!("failed to create segment {}: {e}", path.display()))?;
        let mut writer = TsWriter::with_continuity(
            BufWriter::with_capacity(BUF_WRITER_SIZE, file),
            self.config.layout,
            continuity,
        );
        writer.write_header()?;
        self.writer = Some(writer);
        Ok(())
    }

    fn close_current_segment(&mut self) -> Result<TsContinuity, String> {
        let writer = self.writer.take().ok_or("hls segment writer missing")?;
        let (buf, continuity) = writer.into_inner();
        buf.into_inner()
            .map_err(|e| format!("failed to flush segment: {e}"))?;
        if let Some(enc) = &self.config.encryption {
            crypto::encrypt_in_place(
                &self.segment_path(self.most_recent_number),
                &enc.key,
                &enc.iv,
            )?;
        }
        Ok(continuity)
    }

    fn segment_path(&self, seq: u64) -> PathBuf {
        self.config.dir.join(format!("{seq}.ts"))
    }

    fn push_duration(&mut self, end_pts: i64) {
        self.segment_durations_idx =
            (self.segment_durations_idx + 1) % self.segment_durations.len();
        self.segment_durations[self.segment_durations_idx] =
            (end_pts - self.segment_start_pts) as f64 / 90_000.0;
    }

    /// Sequence number range listed in the playlist (newest finished
    /// segment backwards, at most `num_recent_files` entries).
    fn listed_range(&self) -> (u64, usize) {
        let from_seq = (self.most_recent_number + 1)
            .saturating_sub(self.config.num_recent_files as u64)
            .max(1);
        let count = (self.most_recent_number - from_seq + 1) as usize;
        (from_seq, count)
    }

    fn target_duration(&self) -> u64 {
        let (_, count) = self.listed_range();
        let len = self.segment_durations.len();
        let mut idx = (self.segment_durations_idx + len - (count - 1)) % len;
        let mut max = 0.0f64;
        for _ in 0..count {
            max = max.max(self.segment_durations[idx]);
            idx = (idx + 1) % len;
        }
        max.ceil() as u64
    }

    /// Rewrite `index.m3u8` atomically (write temp, rename), then drop
    /// the oldest on-disk segment that fell out of the retention window.
    fn write_index(&mut self, is_end: bool) -> Result<(), String> {
        let mut out = String::new();
        out.push_str("#EXTM3U\n#EXT-X-VERSION:3\n");
        out.push_str(&format!(
            "#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:{}\n#EXT-X-ALLOW-CACHE:NO\n",
            self.target_duration(),
            self.most_recent_number,
        ));

        if let Some(enc) = &self.config.encryption {
            out.push_str(&format!(
                "#EXT-X-KEY:METHOD=AES-128,URI=\"{}\",IV=0x",
                enc.key_uri
            ));
            for byte in enc.iv {
                out.push_str(&format!("{byte:02X}"));
            }
            out.push('\n');
        }

        let (from_seq, count) = self.listed_range();
        let len = self.segment_durations.len();
        let mut idx = (self.segment_durations_idx + len - (count - 1)) % len;
        for i in 0..count {
            out.push_str(&format!(
                "#EXTINF:{:.5},\n{}.ts\n",
                self.segment_durations[idx],
                from_seq + i as u64,
            ));
            idx = (idx + 1) % len;
        }

        if is_end {
            out.push_str("#EXT-X-ENDLIST\n");
        }

        let tmp_path = self.config.dir.join(format!("_{INDEX_FILENAME}"));
        let index_path = self.config.dir.join(INDEX_FILENAME);
        fs::write(&tmp_path, &out)
            .map_err(|e| format!("failed to write {}: {e}", tmp_path.display()))?;
        fs::rename(&tmp_path, &index_path)
            .map_err(|e| format!("failed to rename playlist into place: {e}"))?;

        let expired = self.most_recent_number as i64
            - self.config.num_recent_files as i64
            - self.config.num_retained_old_files as i64;
        if expired >= 1 {
            let _ = fs::remove_file(self.segment_path(expired as u64));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpegts::reader::{assert_continuity, split_packets};

    fn layout() -> StreamLayout {
        StreamLayout {
            video: true,
            audio: true,
        }
    }

    fn config(dir: PathBuf, recent: usize, retained: usize) -> HlsConfig {
        HlsConfig {
            dir,
            num_recent_files: recent,
            num_retained_old_files: retained,
            encryption: None,
            layout: layout(),
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

    /// Drive `segments` one-second segments through the segmenter:
    /// a keyframe every 90_000 ticks, splits on each keyframe but the first.
    fn run_segments(hls: &mut HlsSegmenter, segments: usize) {
        for kf in 0..segments {
            let base = kf as i64 * 90_000;
            hls.write_packet(&keyframe(base), kf != 0).unwrap();
            for frame in 1..30 {
                hls.write_packet(&delta(base + frame * 3_000), false).unwrap();
            }
        }
        hls.finish().unwrap();
    }

    #[test]
    fn first_packet_opens_segment_one() {
        let tmp = tempfile::tempdir().unwrap();
        let mut hls = HlsSegmenter::new(config(tmp.path().into(), 3, 2)).unwrap();
        hls.write_packet(&keyframe(0), false).unwrap();
        assert_eq!(hls.most_recent_number(), 1);
        hls.finish().unwrap();
        assert!(tmp.path().join("1.ts").exists());
        assert!(tmp.path().join("index.m3u8").exists());
    }

    #[test]
    fn playlist_lists_recent_segments_with_durations() {
        let tmp = tempfile::tempdir().unwrap();
        let mut hls = HlsSegmenter::new(config(tmp.path().into(), 3, 10)).unwrap();
        run_segments(&mut hls, 5);

        let index = fs::read_to_string(tmp.path().join("index.m3u8")).unwrap();
        assert!(index.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n"));
        assert!(index.contains("#EXT-X-TARGETDURATION:1\n"));
        assert!(index.contains("#EXT-X-MEDIA-SEQUENCE:5\n"));
        assert!(index.contains("#EXT-X-ALLOW-CACHE:NO\n"));
        // Exactly the three newest segments are listed.
        assert!(!index.contains("2.ts"));
        assert!(index.contains("3.ts"));
        assert!(index.contains("4.ts"));
        assert!(index.contains("5.ts"));
        assert!(index.ends_with("#EXT-X-ENDLIST\n"));
        // Segments 3 and 4 span exactly one second; segment 5 ends at its
        // last delta frame, 29/30ths of a second in.
        assert_eq!(index.matches("#EXTINF:1.00000,\n").count(), 2);
        assert_eq!(index.matches("#EXTINF:0.96667,\n").count(), 1);
    }

    #[test]
    fn on_disk_retention_is_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let mut hls = HlsSegmenter::new(config(tmp.path().into(), 2, 1)).unwrap();
        run_segments(&mut hls, 8);

        let ts_files = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "ts"))
            .count();
        // At most num_recent + num_retained_old finished segments survive.
        assert!(ts_files <= 2 + 1 + 1, "too many segments left: {ts_files}");
        assert!(!tmp.path().join("1.ts").exists());
        assert!(tmp.path().join("8.ts").exists());
    }

    #[test]
    fn segments_concatenate_into_one_continuous_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let mut hls = HlsSegmenter::new(config(tmp.path().into(), 10, 10)).unwrap();
        run_segments(&mut hls, 4);

        let mut all = Vec::new();
        for seq in 1..=4 {
            all.extend(fs::read(tmp.path().join(format!("{seq}.ts"))).unwrap());
        }
        assert_continuity(&split_packets(&all));
    }

    #[test]
    fn reported_duration_matches_pts_span() {
        let tmp = tempfile::tempdir().unwrap();
        let mut hls = HlsSegmenter::new(config(tmp.path().into(), 5, 10)).unwrap();
        // 0.5-second segments: keyframe every 45_000 ticks.
        for kf in 0..3i64 {
            hls.write_packet(&keyframe(kf * 45_000), kf != 0).unwrap();
        }
        hls.write_packet(&delta(135_000), false).unwrap();
        hls.finish().unwrap();
        let index = fs::read_to_string(tmp.path().join("index.m3u8")).unwrap();
        assert_eq!(index.matches("#EXTINF:0.50000,\n").count(), 3);
        assert!(index.contains("#EXT-X-TARGETDURATION:1\n"));
    }

    #[test]
    fn encrypted_segments_match_cbc_of_plain_segments() {
        let plain_dir = tempfile::tempdir().unwrap();
        let enc_dir = tempfile::tempdir().unwrap();
        let key = [0x0Fu8; 16];
        let iv = [0xA0u8; 16];

        let mut plain = HlsSegmenter::new(config(plain_dir.path().into(), 5, 10)).unwrap();
        let mut enc_cfg = config(enc_dir.path().into(), 5, 10);
        enc_cfg.encryption = Some(SegmentEncryption {
            key,
            iv,
            key_uri: "https://example.com/a.key".into(),
        });
        let mut enc = HlsSegmenter::new(enc_cfg).unwrap();

        run_segments(&mut plain, 3);
        run_segments(&mut enc, 3);

        use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
        for seq in 1..=3 {
            let plain_bytes = fs::read(plain_dir.path().join(format!("{seq}.ts"))).unwrap();
            let enc_bytes = fs::read(enc_dir.path().join(format!("{seq}.ts"))).unwrap();
            let expected = cbc::Encryptor::<aes::Aes128>::new(&key.into(), &iv.into())
                .encrypt_padded_vec_mut::<Pkcs7>(&plain_bytes);
            assert_eq!(enc_bytes, expected, "segment {seq} ciphertext mismatch");
        }

        let index = fs::read_to_string(enc_dir.path().join("index.m3u8")).unwrap();
        assert!(index.contains(
            "#EXT-X-KEY:METHOD=AES-128,URI=\"https://example.com/a.key\",IV=0xA0A0A0A0A0A0A0A0A0A0A0A0A0A0A0A0\n"
        ));
    }
}
