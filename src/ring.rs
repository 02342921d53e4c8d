//! Encoded-packet ring with a circular keyframe index.
//!
//! The fan-out appends every encoded packet here; the slot is overwritten
//! in place when the ring wraps. A parallel ring of keyframe slot indices
//! lets a recording reach back `K` keyframes into the past (pre-roll).
//! Slots hold `Arc<EncodedPacket>` so a trailing reader copies a slot
//! reference under the ring lock and reads the payload without it.

use std::sync::Arc;

/// Extra slots beyond the worst-case packet count for `K` keyframes.
const RING_MARGIN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    /// MPEG-TS program stream index: 0 = video, 1 = audio.
    pub fn index(self) -> u8 {
        match self {
            StreamKind::Video => 0,
            StreamKind::Audio => 1,
        }
    }
}

#[derive(Debug)]
pub struct EncodedPacket {
    pub pts: i64,
    pub data: Vec<u8>,
    pub stream: StreamKind,
    pub keyframe: bool,
}

/// Worst-case slot count for `keyframes` keyframes of look-back:
/// two laps of both streams at one packet per frame/period, plus margin.
pub fn capacity_for(video_fps: f64, audio_fps: f64, keyframes: usize) -> usize {
    let k = keyframes as f64;
    ((video_fps + 1.0) * k * 2.0 + (audio_fps + 1.0) * k * 2.0) as usize + RING_MARGIN
}

pub struct PacketRing {
    slots: Vec<Option<Arc<EncodedPacket>>>,
    /// Slot index of the most recently written packet.
    write_idx: usize,
    appended: u64,
    /// Circular buffer of slot indices where video keyframes landed.
    keyframe_slots: Vec<usize>,
    /// Index of the most recently marked keyframe.
    keyframe_idx: usize,
    keyframes_marked: u64,
    keyframes_filled: bool,
    video_fps: f64,
    audio_fps: f64,
}

impl PacketRing {
    pub fn new(video_fps: f64, audio_fps: f64, keyframes: usize) -> Self {
        Self {
            slots: (0..capacity_for(video_fps, audio_fps, keyframes))
                .map(|_| None)
                .collect(),
            write_idx: 0,
            appended: 0,
            keyframe_slots: vec![0; keyframes],
            keyframe_idx: 0,
            keyframes_marked: 0,
            keyframes_filled: false,
            video_fps,
            audio_fps,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The configured look-back depth `K`.
    pub fn record_buffer_keyframes(&self) -> usize {
        self.keyframe_slots.len()
    }

    /// Slot index of the most recently written packet.
    pub fn write_slot(&self) -> usize {
        self.write_idx
    }

    pub fn is_empty(&self) -> bool {
        self.appended == 0
    }

    /// The slot that follows `slot` in write order.
    pub fn next_slot(&self, slot: usize) -> usize {
        (slot + 1) % self.slots.len()
    }

    pub fn get(&self, slot: usize) -> Option<Arc<EncodedPacket>> {
        self.slots[slot].clone()
    }

    /// Append one packet, overwriting the oldest slot once the ring has
    /// wrapped. Video keyframes are also recorded in the keyframe index.
    /// Returns the stored packet for the fan-out.
    pub fn append(&mut self, packet: EncodedPacket) -> Arc<EncodedPacket> {
        if self.appended > 0 {
            self.write_idx = (self.write_idx + 1) % self.slots.len();
        }

        if self.slots[self.write_idx].is_some() && self.keyframes_marked > 0 {
            // Overwriting the oldest retained keyframe means the surviving
            // look-back is about to shrink below K.
            let next_kf = (self.keyframe_idx + 1) % self.keyframe_slots.len();
            if self.write_idx == self.keyframe_slots[next_kf] {
                log::warn!(
                    "record buffer is starving; recorded file may not start \
                     from a keyframe (try a smaller GOP or a larger recordbuf)"
                );
            }
        }

        let mark_keyframe = packet.stream == StreamKind::Video && packet.keyframe;
        let stored = Arc::new(packet);
        self.slots[self.write_idx] = Some(stored.clone());
        self.appended += 1;

        if mark_keyframe {
            self.mark_keyframe();
        }

        stored
    }

    fn mark_keyframe(&mut self) {
        if self.keyframes_marked > 0 {
            self.keyframe_idx += 1;
            if self.keyframe_idx >= self.keyframe_slots.len() {
                self.keyframe_idx = 0;
                self.keyframes_filled = true;
            }
        }
        self.keyframe_slots[self.keyframe_idx] = self.write_idx;
        self.keyframes_marked += 1;
    }

    /// Slot of the keyframe `lookback` keyframes before the newest one,
    /// where the recording back-fill begins. `None` until the first
    /// keyframe has been seen.
    pub fn preroll_start_slot(&self, lookback: usize) -> Option<usize> {
        if self.keyframes_marked == 0 {
            return None;
        }
        let k = self.keyframe_slots.len();
        let lookback = lookback.clamp(1, k);
        let ordinal = if !self.keyframes_filled && lookback as u64 > self.keyframes_marked {
            // Not enough pre-roll history yet; start from the oldest.
            0
        } else {
            (self.keyframe_idx + k - (lookback - 1)) % k
        };
        Some(self.keyframe_slots[ordinal])
    }

    /// Reallocate both rings for a new look-back depth, dropping all
    /// buffered packets. The caller must have verified that no recording
    /// is in progress.
    pub fn resize(&mut self, keyframes: usize) {
        let capacity = capacity_for(self.video_fps, self.audio_fps, keyframes);
        self.slots = (0..capacity).map(|_| None).collect();
        self.keyframe_slots = vec![0; keyframes];
        self.write_idx = 0;
        self.appended = 0;
        self.keyframe_idx = 0;
        self.keyframes_marked = 0;
        self.keyframes_filled = false;
    }
}
