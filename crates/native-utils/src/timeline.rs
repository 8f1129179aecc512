//! Sample-accurate playback timeline.
//!
//! Chunks are placed at absolute start times and rendered by the output
//! device callback. The timeline's clock only advances when frames are
//! rendered, so `now()` is the position of the next frame the device hears.

use std::collections::VecDeque;

#[derive(Debug)]
struct TimelineChunk {
    id: u64,
    start: u64,
    samples: Vec<f32>,
}

impl TimelineChunk {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

#[derive(Debug)]
pub struct PlaybackTimeline {
    sample_rate: u32,
    position: u64,
    chunks: VecDeque<TimelineChunk>,
}

impl PlaybackTimeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            position: 0,
            chunks: VecDeque::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Current playback clock in seconds.
    pub fn now(&self) -> f64 {
        self.position as f64 / self.sample_rate as f64
    }

    /// Places `samples` so that the first one is heard at `start_secs`.
    pub fn insert(&mut self, id: u64, start_secs: f64, samples: Vec<f32>) {
        let start = (start_secs.max(0.0) * self.sample_rate as f64).round() as u64;
        let at = self
            .chunks
            .iter()
            .position(|c| c.start > start)
            .unwrap_or(self.chunks.len());
        self.chunks.insert(at, TimelineChunk { id, start, samples });
    }

    /// Removes a chunk whether or not it has started playing. Returns false
    /// when the chunk already finished or was never inserted.
    pub fn cancel(&mut self, id: u64) -> bool {
        let before = self.chunks.len();
        self.chunks.retain(|c| c.id != id);
        before != self.chunks.len()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn is_idle(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Fills `out` with mono samples and advances the clock by `out.len()` frames.
    pub fn render(&mut self, out: &mut [f32]) {
        for slot in out.iter_mut() {
            let t = self.position;
            while self.chunks.front().is_some_and(|c| c.end() <= t) {
                self.chunks.pop_front();
            }
            *slot = match self.chunks.front() {
                Some(chunk) if chunk.start <= t => chunk.samples[(t - chunk.start) as usize],
                _ => 0.0,
            };
            self.position += 1;
        }
    }
}
