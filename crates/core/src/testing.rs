//! In-memory stand-ins for the device and transport seams.

use crate::audio::AudioOutput;
use crate::media::{AudioConstraints, DeviceError, MediaDevices, MediaStream, VideoConstraints};
use crate::sampler::FrameSource;
use crate::transport::{
    Connection, InboundMessage, Outbound, SessionConfig, Transport, TransportEvent, TransportLink,
};
use async_trait::async_trait;
use image::RgbImage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct OutputLog {
    now: f64,
    started: Vec<(u64, f64, usize)>,
    stopped: Vec<u64>,
    closed: bool,
}

/// Records what an [`AudioPipeline`](crate::audio::AudioPipeline) schedules.
pub struct FakeOutput {
    log: Arc<Mutex<OutputLog>>,
}

#[derive(Clone)]
pub struct PlayedOutput {
    log: Arc<Mutex<OutputLog>>,
}

impl FakeOutput {
    pub fn new() -> (Self, PlayedOutput) {
        let log = Arc::new(Mutex::new(OutputLog::default()));
        (Self { log: log.clone() }, PlayedOutput { log })
    }
}

impl AudioOutput for FakeOutput {
    fn current_time(&self) -> f64 {
        self.log.lock().unwrap().now
    }

    fn start(&mut self, id: u64, at: f64, samples: Vec<f32>, _sample_rate: u32) {
        self.log.lock().unwrap().started.push((id, at, samples.len()));
    }

    fn stop(&mut self, id: u64) -> bool {
        let mut log = self.log.lock().unwrap();
        log.stopped.push(id);
        true
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closed = true;
    }
}

impl PlayedOutput {
    pub fn set_time(&self, now: f64) {
        self.log.lock().unwrap().now = now;
    }

    pub fn started(&self) -> Vec<(u64, f64, usize)> {
        self.log.lock().unwrap().started.clone()
    }

    pub fn stopped(&self) -> Vec<u64> {
        self.log.lock().unwrap().stopped.clone()
    }

    pub fn closed(&self) -> bool {
        self.log.lock().unwrap().closed
    }
}

/// Always returns the same frame.
pub struct StillFrame(pub RgbImage);

impl FrameSource for StillFrame {
    fn current_frame(&mut self) -> Option<RgbImage> {
        Some(self.0.clone())
    }
}

/// Hands out silent streams and counts acquisitions and releases.
#[derive(Clone, Default)]
pub struct FakeDevices {
    pub acquired: Arc<AtomicUsize>,
    pub stopped: Arc<AtomicUsize>,
    pub outputs: Arc<Mutex<Vec<PlayedOutput>>>,
    microphone: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
    acquire_delay: Duration,
}

impl FakeDevices {
    /// Devices whose `acquire` takes `delay` to complete.
    pub fn slow(delay: Duration) -> Self {
        Self {
            acquire_delay: delay,
            ..Self::default()
        }
    }

    /// Feeds the microphone of the live stream.
    pub fn microphone(&self) -> Option<mpsc::Sender<Vec<f32>>> {
        self.microphone.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(
        &self,
        _audio: AudioConstraints,
        _video: VideoConstraints,
    ) -> Result<MediaStream, DeviceError> {
        if !self.acquire_delay.is_zero() {
            tokio::time::sleep(self.acquire_delay).await;
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let (mic_tx, mic_rx) = mpsc::channel(4);
        *self.microphone.lock().unwrap() = Some(mic_tx);
        let stopped = self.stopped.clone();
        let microphone = self.microphone.clone();
        let frame = StillFrame(RgbImage::new(32, 24));
        Ok(MediaStream::new(16_000, mic_rx, Box::new(frame)).on_stop(move || {
            microphone.lock().unwrap().take();
            stopped.fetch_add(1, Ordering::SeqCst);
        }))
    }

    async fn open_output(&self, _sample_rate: u32) -> anyhow::Result<Box<dyn AudioOutput>> {
        let (output, played) = FakeOutput::new();
        self.outputs.lock().unwrap().push(played);
        Ok(Box::new(output))
    }
}

/// The remote end of one [`FakeTransport`] connection.
pub struct RemoteEnd {
    pub config: SessionConfig,
    pub events: mpsc::Sender<TransportEvent>,
    pub outbound: mpsc::Receiver<Outbound>,
}

impl RemoteEnd {
    pub async fn open(&self) {
        let _ = self.events.send(TransportEvent::Open).await;
    }

    pub async fn message(&self, message: InboundMessage) {
        let _ = self.events.send(TransportEvent::Message(message)).await;
    }

    pub async fn close(&self, reason: &str) {
        let _ = self
            .events
            .send(TransportEvent::Closed(Some(reason.to_string())))
            .await;
    }

    /// Drains outbound messages, skipping audio and frames.
    pub fn control_messages(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            if !matches!(message, Outbound::Audio(_) | Outbound::Frame(_)) {
                out.push(message);
            }
        }
        out
    }

    /// Drains outbound messages and counts frames.
    pub fn frame_count(&mut self) -> usize {
        let mut frames = 0;
        while let Ok(message) = self.outbound.try_recv() {
            if matches!(message, Outbound::Frame(_)) {
                frames += 1;
            }
        }
        frames
    }
}

struct FakeConnection {
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn close(&mut self) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands each opened connection's remote end to the test.
///
/// Opens fail while `failures` is non-zero.
#[derive(Clone)]
pub struct FakeTransport {
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    pub opens: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
}

impl FakeTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        (
            Self {
                remotes,
                opens: Arc::new(AtomicUsize::new(0)),
                closes: Arc::new(AtomicUsize::new(0)),
                failures: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, config: SessionConfig) -> anyhow::Result<TransportLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("connection refused");
        }
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(16);
        let _ = self.remotes.send(RemoteEnd {
            config,
            events: events_tx,
            outbound: outbound_rx,
        });
        Ok(TransportLink {
            outbound: outbound_tx,
            events: events_rx,
            connection: Box::new(FakeConnection {
                closes: self.closes.clone(),
            }),
        })
    }
}
