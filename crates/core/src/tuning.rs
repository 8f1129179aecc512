use crate::media::{AudioConstraints, VideoConstraints};
use crate::sampler::SamplerTuning;
use sightline_native_utils::audio::{LIVE_INPUT_SAMPLE_RATE, LIVE_OUTPUT_SAMPLE_RATE};

/// Timing and sizing knobs of a live session.
#[derive(Debug, Clone)]
pub struct SessionTuning {
    /// Reconnect attempts before the session gives up.
    pub max_retries: u32,
    /// Samples per outbound microphone chunk, at `capture_rate`.
    pub capture_chunk: usize,
    pub capture_rate: u32,
    /// Rate of the PCM chunks the remote service streams back.
    pub playback_rate: u32,
    pub sampler: SamplerTuning,
    pub audio: AudioConstraints,
    pub video: VideoConstraints,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            max_retries: 5,
            capture_chunk: 4096,
            capture_rate: LIVE_INPUT_SAMPLE_RATE,
            playback_rate: LIVE_OUTPUT_SAMPLE_RATE,
            sampler: SamplerTuning::default(),
            audio: AudioConstraints::default(),
            video: VideoConstraints::default(),
        }
    }
}
