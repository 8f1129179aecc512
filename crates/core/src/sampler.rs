//! Adaptive camera frame sampling.
//!
//! Every tick the current frame is reduced to a small thumbnail and compared
//! with the previous one. A frame is sent when the scene moved enough or when
//! nothing has been sent for a heartbeat interval.

use crate::mode::Mode;
use crate::state::{SessionContext, SessionState};
use crate::transport::{FrameChunk, Outbound, OutboundTx};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A live video track.
#[cfg_attr(test, automock)]
pub trait FrameSource: Send {
    /// The most recent frame, or `None` when the camera has nothing yet.
    fn current_frame(&mut self) -> Option<RgbImage>;
}

#[derive(Debug, Clone)]
pub struct SamplerTuning {
    pub tick: Duration,
    pub heartbeat: Duration,
    /// Edge of the square thumbnail used for motion scoring.
    pub thumbnail_size: u32,
    /// Mean per-pixel channel difference above which a frame counts as motion.
    pub change_threshold: f64,
    pub target_width: u32,
    pub jpeg_quality: u8,
}

impl Default for SamplerTuning {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            heartbeat: Duration::from_secs(2),
            thumbnail_size: 64,
            change_threshold: 20.0,
            target_width: 640,
            jpeg_quality: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleDecision {
    Skip,
    Motion(f64),
    Heartbeat,
}

impl SampleDecision {
    pub fn transmits(&self) -> bool {
        !matches!(self, SampleDecision::Skip)
    }
}

pub struct FrameSampler {
    tuning: SamplerTuning,
    baseline: Option<RgbImage>,
    last_sent: Option<Instant>,
}

impl FrameSampler {
    pub fn new(tuning: SamplerTuning) -> Self {
        Self {
            tuning,
            baseline: None,
            last_sent: None,
        }
    }

    /// Sum of absolute channel differences divided by the pixel count.
    pub fn motion_score(previous: &RgbImage, current: &RgbImage) -> f64 {
        let pixels = (current.width() * current.height()) as f64;
        if pixels == 0.0 || previous.dimensions() != current.dimensions() {
            return f64::INFINITY;
        }
        let total: u64 = previous
            .as_raw()
            .iter()
            .zip(current.as_raw())
            .map(|(a, b)| a.abs_diff(*b) as u64)
            .sum();
        total as f64 / pixels
    }

    /// Decides whether `frame` should be sent at `now`. The thumbnail always
    /// replaces the baseline.
    pub fn evaluate(&mut self, frame: &RgbImage, now: Instant) -> SampleDecision {
        let size = self.tuning.thumbnail_size;
        let thumbnail = imageops::resize(frame, size, size, FilterType::Triangle);

        let score = self
            .baseline
            .as_ref()
            .map(|baseline| Self::motion_score(baseline, &thumbnail));
        self.baseline = Some(thumbnail);

        let decision = match score {
            Some(score) if score > self.tuning.change_threshold => SampleDecision::Motion(score),
            _ if self.heartbeat_due(now) => SampleDecision::Heartbeat,
            _ => SampleDecision::Skip,
        };
        if decision.transmits() {
            self.last_sent = Some(now);
        }
        decision
    }

    fn heartbeat_due(&self, now: Instant) -> bool {
        match self.last_sent {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.tuning.heartbeat,
        }
    }

    /// Scales `frame` to the target width and encodes it as JPEG.
    pub fn encode(&self, frame: &RgbImage) -> anyhow::Result<Vec<u8>> {
        let width = self.tuning.target_width.max(1);
        let height = ((frame.height() as u64 * width as u64) / frame.width().max(1) as u64).max(1) as u32;
        let scaled = imageops::resize(frame, width, height, FilterType::Triangle);

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.tuning.jpeg_quality).encode_image(&scaled)?;
        Ok(jpeg)
    }

    pub fn reset(&mut self) {
        self.baseline = None;
        self.last_sent = None;
    }
}

/// Samples `source` every tick while the session is running and queues the
/// chosen frames tagged with the mode active at send time.
pub async fn run_sampler(
    ctx: Arc<SessionContext>,
    mut source: Box<dyn FrameSource>,
    mut sampler: FrameSampler,
    outbound: OutboundTx,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(sampler.tuning.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if ctx.state() != SessionState::Running {
            continue;
        }
        let Some(frame) = source.current_frame() else {
            continue;
        };
        let decision = sampler.evaluate(&frame, Instant::now());
        if !decision.transmits() {
            continue;
        }
        let jpeg = match sampler.encode(&frame) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::warn!("failed to encode frame: {}", e);
                continue;
            }
        };
        let mode: Mode = ctx.mode();
        tracing::trace!(?decision, %mode, bytes = jpeg.len(), "sending frame");
        match outbound.try_send(Outbound::Frame(FrameChunk { jpeg, mode })) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::debug!("outbound queue full, frame dropped"),
            Err(TrySendError::Closed(_)) => break,
        }
    }
    sampler.reset();
    tracing::debug!("sampler stopped");
}
