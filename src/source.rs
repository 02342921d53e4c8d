//! Collaborator seams.
//!
//! Camera glue, the hardware H.264 encoder, the ALSA reader, the AAC
//! encoder and the text overlay renderer live outside this crate. The
//! engine calls back into them through these traits; builds without
//! hardware attach the no-op implementations below.

use crate::control::subtitle::SubtitleParams;

pub trait CameraControl: Send + Sync {
    fn set_white_balance(&self, mode: &str) -> Result<(), String>;
    fn set_white_balance_red(&self, gain: f32) -> Result<(), String>;
    fn set_white_balance_blue(&self, gain: f32) -> Result<(), String>;
    fn set_exposure(&self, mode: &str) -> Result<(), String>;
}

pub trait AudioControl: Send + Sync {
    /// Zero-fill the PCM period buffer before encoding.
    fn mute(&self);
    fn unmute(&self);
}

pub trait SubtitleRenderer: Send + Sync {
    fn show(&self, params: &SubtitleParams);
    fn clear(&self);
}

/// Stand-ins for builds without the hardware collaborators.
pub struct NullCamera;

impl CameraControl for NullCamera {
    fn set_white_balance(&self, mode: &str) -> Result<(), String> {
        log::debug!("no camera attached; ignoring white balance mode {mode}");
        Ok(())
    }

    fn set_white_balance_red(&self, gain: f32) -> Result<(), String> {
        log::debug!("no camera attached; ignoring wbred {gain}");
        Ok(())
    }

    fn set_white_balance_blue(&self, gain: f32) -> Result<(), String> {
        log::debug!("no camera attached; ignoring wbblue {gain}");
        Ok(())
    }

    fn set_exposure(&self, mode: &str) -> Result<(), String> {
        log::debug!("no camera attached; ignoring exposure mode {mode}");
        Ok(())
    }
}

pub struct NullAudio;

impl AudioControl for NullAudio {
    fn mute(&self) {
        log::debug!("no microphone attached; ignoring mute");
    }

    fn unmute(&self) {
        log::debug!("no microphone attached; ignoring unmute");
    }
}

pub struct NullSubtitles;

impl SubtitleRenderer for NullSubtitles {
    fn show(&self, params: &SubtitleParams) {
        log::debug!("no overlay renderer attached; ignoring subtitle {:?}", params.text);
    }

    fn clear(&self) {
        log::debug!("no overlay renderer attached; ignoring subtitle clear");
    }
}
