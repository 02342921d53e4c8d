//! Dual-clock PTS controller.
//!
//! Audio is the reference clock: every audio period advances `audio_pts`
//! by a fixed step. Video PTS chases the audio timeline — small drift is
//! worked off with ±150-tick nudges, large drift (≥ 0.5 s) snaps the
//! video clock onto the audio clock. All values are 90 kHz ticks.

/// Drift at which the video clock is reset onto the audio clock (0.5 s).
pub const PTS_DIFF_TOO_LARGE: i64 = 45_000;

/// Minimal PTS correction unit while speeding up or down.
pub const PTS_NUDGE: i64 = 150;

/// |drift| below which the clock settles back into normal mode.
pub const PTS_NORMAL_BAND: i64 = 2_000;

/// Upper bound for the per-frame video step (frame rate floor ~1.31 fps).
pub const MAX_VIDEO_PTS_STEP: i64 = 68_480;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtsMode {
    Normal,
    SpeedUp,
    SpeedDown,
}

#[derive(Debug)]
pub struct PtsClock {
    audio_pts: i64,
    video_pts: i64,
    video_step: i64,
    audio_step: i64,
    mode: PtsMode,
    speed_up_count: u32,
    speed_down_count: u32,
    reset_count: u32,
    video_frame_count: u64,
    audio_frame_count: u64,
    /// Last emitted video PTS (VFR extrapolation base).
    last_pts: i64,
    /// Monotonic ns of the last VFR stamp; 0 until the first VFR frame.
    time_for_last_pts: i64,
    video_started: bool,
    audio_started: bool,
    wall_start_ns: Option<i64>,
}

impl PtsClock {
    pub fn new(video_step: i64, audio_step: i64) -> Self {
        Self {
            audio_pts: 0,
            video_pts: 0,
            video_step,
            audio_step,
            mode: PtsMode::Normal,
            speed_up_count: 0,
            speed_down_count: 0,
            reset_count: 0,
            video_frame_count: 0,
            audio_frame_count: 0,
            last_pts: 0,
            time_for_last_pts: 0,
            video_started: false,
            audio_started: false,
            wall_start_ns: None,
        }
    }

    /// Per-frame video step for a frame rate, capped at [`MAX_VIDEO_PTS_STEP`].
    pub fn video_step_for_fps(fps: f64) -> i64 {
        let step = (90_000.0 / fps).round() as i64;
        step.min(MAX_VIDEO_PTS_STEP)
    }

    /// Per-period audio step derived from the capture geometry.
    pub fn audio_step_for(sample_rate: u32, period_size: u32) -> i64 {
        90_000 * i64::from(period_size) / i64::from(sample_rate)
    }

    pub fn next_audio_pts(&mut self) -> i64 {
        self.audio_frame_count += 1;
        // Audio timing is the base clock, so it is never adjusted.
        self.audio_pts += self.audio_step;
        self.audio_pts
    }

    /// Constant-frame-rate video PTS, drifting toward the audio timeline.
    pub fn next_video_pts_cfr(&mut self) -> i64 {
        self.video_frame_count += 1;

        if self.video_pts == 0 {
            self.video_pts = self.audio_pts - self.video_step;
            log::debug!("initial video pts set to {}", self.video_pts);
        }

        let diff = self.audio_pts - self.video_pts - self.video_step;
        let tolerance = (self.video_step + self.audio_step) * 2;
        let pts = if diff >= PTS_DIFF_TOO_LARGE {
            // Video PTS fell too far behind; snap onto the audio clock.
            self.reset_count += 1;
            log::debug!("video pts reset (diff={diff})");
            self.audio_pts
        } else if diff >= tolerance {
            if self.mode != PtsMode::SpeedUp {
                self.mode = PtsMode::SpeedUp;
                self.speed_up_count += 1;
                log::debug!("video pts speed-up (diff={diff})");
            }
            self.video_pts + self.video_step + PTS_NUDGE
        } else if diff <= -tolerance {
            if self.mode != PtsMode::SpeedDown {
                self.mode = PtsMode::SpeedDown;
                self.speed_down_count += 1;
                log::debug!("video pts speed-down (diff={diff})");
            }
            self.video_pts + self.video_step - PTS_NUDGE
        } else {
            let mut pts = self.video_pts + self.video_step;
            if diff.abs() < PTS_NORMAL_BAND {
                if self.mode != PtsMode::Normal {
                    log::debug!("video pts back to normal");
                    self.mode = PtsMode::Normal;
                }
            } else {
                // Still outside the settle band: keep nudging in the
                // direction of the current mode.
                match self.mode {
                    PtsMode::SpeedUp => pts += PTS_NUDGE,
                    PtsMode::SpeedDown => pts -= PTS_NUDGE,
                    PtsMode::Normal => {}
                }
            }
            pts
        };

        self.video_pts = pts;
        self.last_pts = pts;
        pts
    }

    /// Variable-frame-rate video PTS from elapsed monotonic time.
    /// `now_ns` is CLOCK_MONOTONIC nanoseconds.
    pub fn next_video_pts_vfr(&mut self, now_ns: i64) -> i64 {
        self.video_frame_count += 1;

        if self.time_for_last_pts == 0 {
            self.video_pts = self.audio_pts;
        } else {
            // ns → 90 kHz ticks in fixed point (× 9 / 100_000).
            let elapsed = now_ns - self.time_for_last_pts;
            self.video_pts = self.last_pts + elapsed * 9 / 100_000;
        }
        self.last_pts = self.video_pts;
        self.time_for_last_pts = now_ns;

        self.video_pts
    }

    /// Record that the video side produced its first frame. Returns the
    /// latched capture origin if this completes the pair.
    pub fn mark_video_started(&mut self, now_ns: i64) -> Option<i64> {
        self.video_started = true;
        self.latch_start(now_ns)
    }

    /// Record that the audio side produced its first frame. Returns the
    /// latched capture origin if this completes the pair.
    pub fn mark_audio_started(&mut self, now_ns: i64) -> Option<i64> {
        self.audio_started = true;
        self.latch_start(now_ns)
    }

    fn latch_start(&mut self, now_ns: i64) -> Option<i64> {
        if self.video_started && self.audio_started && self.wall_start_ns.is_none() {
            self.wall_start_ns = Some(now_ns);
            Some(now_ns)
        } else {
            None
        }
    }

    pub fn audio_pts(&self) -> i64 {
        self.audio_pts
    }

    pub fn video_pts(&self) -> i64 {
        self.video_pts
    }

    pub fn mode(&self) -> PtsMode {
        self.mode
    }

    pub fn video_frame_count(&self) -> u64 {
        self.video_frame_count
    }

    pub fn speed_up_count(&self) -> u32 {
        self.speed_up_count
    }

    pub fn speed_down_count(&self) -> u32 {
        self.speed_down_count
    }

    pub fn reset_count(&self) -> u32 {
        self.reset_count
    }

    pub fn wall_start_ns(&self) -> Option<i64> {
        self.wall_start_ns
    }
}
