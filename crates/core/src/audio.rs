//! Microphone capture and gap-free playback.

use crate::state::{SessionContext, SessionState};
use crate::transport::{AudioChunk, Outbound, OutboundTx};
use rubato::{FastFixedIn, Resampler};
use sightline_native_utils::audio::{create_resampler, decode_pcm16, encode_pcm16};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Frames handed to the resampler per call.
const RESAMPLE_BLOCK: usize = 1024;

/// A playback context that can start PCM at an absolute time on its clock.
pub trait AudioOutput: Send {
    /// Playback clock, in seconds.
    fn current_time(&self) -> f64;

    /// Plays mono `samples` recorded at `sample_rate` starting at `at`.
    fn start(&mut self, id: u64, at: f64, samples: Vec<f32>, sample_rate: u32);

    /// Stops a chunk whether or not it has started. Returns false when it had
    /// already finished; never fails.
    fn stop(&mut self, id: u64) -> bool;

    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub id: u64,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledChunk {
    fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Schedules inbound audio back to back on an [`AudioOutput`].
///
/// Each chunk starts at `max(cursor, now)` and pushes the cursor forward by
/// its own duration, so bursts queue up without gaps or overlap.
pub struct AudioPipeline {
    output: Box<dyn AudioOutput>,
    sample_rate: u32,
    cursor: f64,
    next_id: u64,
    pending: Vec<ScheduledChunk>,
}

impl AudioPipeline {
    pub fn new(output: Box<dyn AudioOutput>, sample_rate: u32) -> Self {
        Self {
            output,
            sample_rate,
            cursor: 0.0,
            next_id: 0,
            pending: Vec::new(),
        }
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Chunks scheduled and not yet known to have finished.
    pub fn pending(&self) -> &[ScheduledChunk] {
        &self.pending
    }

    pub fn schedule(&mut self, samples: Vec<f32>) -> Option<ScheduledChunk> {
        if samples.is_empty() {
            return None;
        }
        let now = self.output.current_time();
        self.pending.retain(|c| c.end() > now);

        let start = self.cursor.max(now);
        let duration = samples.len() as f64 / self.sample_rate as f64;
        let chunk = ScheduledChunk {
            id: self.next_id,
            start,
            duration,
        };
        self.next_id += 1;

        self.output.start(chunk.id, start, samples, self.sample_rate);
        self.cursor = start + duration;
        self.pending.push(chunk);
        Some(chunk)
    }

    /// Decodes and schedules one inbound chunk. Nothing is scheduled while
    /// the session is paused, and undecodable chunks are dropped.
    pub fn play_encoded(&mut self, ctx: &SessionContext, payload: &str) -> Option<ScheduledChunk> {
        if ctx.state() == SessionState::Paused {
            tracing::trace!("paused, dropping inbound audio");
            return None;
        }
        match decode_pcm16(payload) {
            Ok(samples) => self.schedule(samples),
            Err(e) => {
                tracing::debug!("dropping undecodable audio chunk: {}", e);
                None
            }
        }
    }

    /// Stops everything scheduled and rewinds the cursor. Safe to repeat.
    pub fn flush(&mut self) {
        for chunk in self.pending.drain(..) {
            if !self.output.stop(chunk.id) {
                tracing::trace!("chunk {} had already finished", chunk.id);
            }
        }
        self.cursor = 0.0;
    }

    pub fn close(mut self) {
        self.flush();
        self.output.close();
    }
}

/// Turns raw microphone buffers into fixed-size chunks at the wire rate.
pub struct CaptureChunker {
    chunk_size: usize,
    in_rate: u32,
    out_rate: u32,
    resampler: Option<FastFixedIn<f32>>,
    input: VecDeque<f32>,
    output: Vec<f32>,
}

impl CaptureChunker {
    pub fn new(in_rate: u32, out_rate: u32, chunk_size: usize) -> anyhow::Result<Self> {
        let resampler = if in_rate == out_rate {
            None
        } else {
            Some(create_resampler(
                in_rate as f64,
                out_rate as f64,
                RESAMPLE_BLOCK,
            )?)
        };
        Ok(Self {
            chunk_size,
            in_rate,
            out_rate,
            resampler,
            input: VecDeque::new(),
            output: Vec::with_capacity(chunk_size * 2),
        })
    }

    /// Buffers `samples` and returns every complete chunk now available.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        match self.resampler.as_mut() {
            None => self.output.extend_from_slice(samples),
            Some(resampler) => {
                self.input.extend(samples);
                while self.input.len() >= resampler.input_frames_next() {
                    let block: Vec<f32> = self.input.drain(..resampler.input_frames_next()).collect();
                    match resampler.process(&[block.as_slice()], None) {
                        Ok(resampled) => {
                            if let Some(channel) = resampled.first() {
                                self.output.extend_from_slice(channel);
                            }
                        }
                        Err(e) => tracing::warn!(
                            "capture resample {}Hz -> {}Hz failed: {}",
                            self.in_rate,
                            self.out_rate,
                            e
                        ),
                    }
                }
            }
        }

        let mut chunks = Vec::new();
        while self.output.len() >= self.chunk_size {
            chunks.push(self.output.drain(..self.chunk_size).collect());
        }
        chunks
    }
}

/// Streams microphone chunks to the transport while the session is active.
///
/// Capture continues while paused so a spoken resume request still reaches
/// the remote service. A full outbound queue drops the chunk.
pub async fn run_capture(
    ctx: Arc<SessionContext>,
    mut microphone: mpsc::Receiver<Vec<f32>>,
    mut chunker: CaptureChunker,
    outbound: OutboundTx,
    cancel: CancellationToken,
) {
    let mut dropped = 0u64;
    loop {
        let samples = tokio::select! {
            _ = cancel.cancelled() => break,
            samples = microphone.recv() => match samples {
                Some(samples) => samples,
                None => break,
            },
        };
        if !ctx.state().is_active() {
            continue;
        }
        for chunk in chunker.push(&samples) {
            let message = Outbound::Audio(AudioChunk {
                data: encode_pcm16(&chunk),
                sample_rate: chunker.out_rate,
            });
            match outbound.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    if dropped % 50 == 1 {
                        tracing::warn!("outbound queue full, dropped {} audio chunks", dropped);
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("outbound closed, capture stopping");
                    return;
                }
            }
        }
    }
    tracing::debug!("capture stopped");
}
