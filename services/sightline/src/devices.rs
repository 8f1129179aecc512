//! Desktop media devices: cpal microphone and speaker, and a snapshot file
//! standing in for the camera.
//!
//! cpal streams are not `Send`, so each one lives on its own thread for as
//! long as the session holds it. The thread reports readiness once and then
//! parks until it is told to stop.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use image::RgbImage;
use sightline_core::audio::AudioOutput;
use sightline_core::media::{
    AudioConstraints, DeviceError, MediaDevices, MediaStream, VideoConstraints,
};
use sightline_core::sampler::FrameSource;
use sightline_native_utils::audio::{StreamResampler, downmix};
use sightline_native_utils::device;
use sightline_native_utils::timeline::PlaybackTimeline;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, mpsc as std_mpsc};
use std::thread::JoinHandle;
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};

/// Microphone buffers queued ahead of the capture task.
const MIC_QUEUE: usize = 64;
/// Source frames per resampler pass for playback.
const RESAMPLE_BLOCK: usize = 480;

pub struct CpalDevices {
    input_device: Option<String>,
    output_device: Option<String>,
    camera: Option<PathBuf>,
}

impl CpalDevices {
    pub fn new(
        input_device: Option<String>,
        output_device: Option<String>,
        camera: Option<PathBuf>,
    ) -> Self {
        Self {
            input_device,
            output_device,
            camera,
        }
    }
}

/// Maps a platform error onto the two failure kinds the session reports.
fn device_error(device: &str, error: impl Display) -> DeviceError {
    let reason = error.to_string();
    let lowered = reason.to_lowercase();
    if lowered.contains("permission") || lowered.contains("denied") {
        DeviceError::PermissionDenied(device.to_string())
    } else {
        DeviceError::Unavailable {
            device: device.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn acquire(
        &self,
        audio: AudioConstraints,
        video: VideoConstraints,
    ) -> Result<MediaStream, DeviceError> {
        let camera: Box<dyn FrameSource> = match &self.camera {
            Some(path) => Box::new(SnapshotCamera::open(path)?),
            None => {
                tracing::warn!("No camera configured, the session will be audio only");
                Box::new(NoCamera)
            }
        };
        tracing::debug!(
            "Camera wanted at {}x{} facing {:?}",
            video.ideal_width,
            video.ideal_height,
            video.facing
        );

        let (mic_tx, mic_rx) = mpsc::channel(MIC_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let input_device = self.input_device.clone();

        std::thread::Builder::new()
            .name("sightline-mic".to_string())
            .spawn(move || match open_microphone(input_device, &audio, mic_tx) {
                Ok((stream, sample_rate)) => {
                    let _ = ready_tx.send(Ok(sample_rate));
                    // Parked until the stream is released or dropped.
                    let _ = stop_rx.recv();
                    drop(stream);
                    tracing::debug!("Microphone stream stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| device_error("microphone", e))?;

        let sample_rate = ready_rx
            .await
            .map_err(|e| device_error("microphone", e))??;
        tracing::info!("Microphone capturing at {}hz", sample_rate);

        Ok(MediaStream::new(sample_rate, mic_rx, camera).on_stop(move || {
            let _ = stop_tx.send(());
        }))
    }

    async fn open_output(&self, sample_rate: u32) -> anyhow::Result<Box<dyn AudioOutput>> {
        let output = CpalOutput::open(self.output_device.clone(), sample_rate).await?;
        Ok(Box::new(output))
    }
}

fn open_microphone(
    device_name: Option<String>,
    constraints: &AudioConstraints,
    mic_tx: mpsc::Sender<Vec<f32>>,
) -> Result<(cpal::Stream, u32), DeviceError> {
    let input =
        device::get_or_default_input(device_name).map_err(|e| device_error("microphone", e))?;
    tracing::info!("Using input device: {:?}", input.name().unwrap_or_default());
    if constraints.echo_cancellation || constraints.noise_suppression {
        tracing::debug!("Echo cancellation and noise suppression are left to the platform");
    }

    let input_config = input
        .default_input_config()
        .map_err(|e| device_error("microphone", e))?;
    let input_config = StreamConfig {
        channels: input_config.channels(),
        sample_rate: input_config.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };
    let channel_count = input_config.channels as usize;
    tracing::info!("Input stream config: {:?}", &input_config);

    let input_data_fn = move |data: &[f32], _: &cpal::InputCallbackInfo| {
        if let Err(e) = mic_tx.try_send(downmix(data, channel_count)) {
            tracing::trace!("Dropping microphone buffer: {}", e);
        }
    };
    let stream = input
        .build_input_stream(
            &input_config,
            input_data_fn,
            move |err| tracing::error!("An error occurred on input stream: {}", err),
            None,
        )
        .map_err(|e| device_error("microphone", e))?;
    stream.play().map_err(|e| device_error("microphone", e))?;

    Ok((stream, input_config.sample_rate.0))
}

/// Speaker output backed by a [`PlaybackTimeline`] at the stream rate.
///
/// The output callback renders the timeline and converts it to the device
/// rate as one continuous signal.
pub struct CpalOutput {
    timeline: Arc<Mutex<PlaybackTimeline>>,
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

type SpeakerReady = anyhow::Result<Arc<Mutex<PlaybackTimeline>>>;

impl CpalOutput {
    /// Opens the speaker for PCM at `sample_rate`.
    pub async fn open(device_name: Option<String>, sample_rate: u32) -> anyhow::Result<Self> {
        let (ready_tx, ready_rx) = oneshot::channel::<SpeakerReady>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("sightline-speaker".to_string())
            .spawn(move || match open_speaker(device_name, sample_rate) {
                Ok((stream, timeline)) => {
                    let _ = ready_tx.send(Ok(timeline));
                    let _ = stop_rx.recv();
                    drop(stream);
                    tracing::debug!("Speaker stream stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let timeline = ready_rx
            .await
            .map_err(|_| anyhow::anyhow!("Speaker thread exited before reporting"))??;

        Ok(Self {
            timeline,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    fn timeline(&self) -> std::sync::MutexGuard<'_, PlaybackTimeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_speaker(
    device_name: Option<String>,
    sample_rate: u32,
) -> anyhow::Result<(cpal::Stream, Arc<Mutex<PlaybackTimeline>>)> {
    let output = device::get_or_default_output(device_name)?;
    tracing::info!("Using output device: {:?}", output.name().unwrap_or_default());

    let output_config = output.default_output_config()?;
    let output_config = StreamConfig {
        channels: output_config.channels(),
        sample_rate: output_config.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };
    let channel_count = (output_config.channels as usize).max(1);
    let device_rate = output_config.sample_rate.0;
    tracing::info!("Output stream config: {:?}", &output_config);
    tracing::info!("Speaker playing {}hz audio at {}hz", sample_rate, device_rate);

    let timeline = Arc::new(Mutex::new(PlaybackTimeline::new(sample_rate)));
    let rendered = timeline.clone();
    let mut resampler = StreamResampler::new(sample_rate, device_rate, RESAMPLE_BLOCK)?;
    let mut mono = Vec::new();
    let output_data_fn = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
        mono.clear();
        mono.resize(data.len() / channel_count, 0.0);
        let mut timeline = rendered.lock().unwrap_or_else(PoisonError::into_inner);
        resampler.fill(&mut mono, |block| timeline.render(block));
        drop(timeline);
        // Mono is copied to every channel.
        for (frame, sample) in data.chunks_mut(channel_count).zip(&mono) {
            frame.fill(*sample);
        }
    };
    let stream = output.build_output_stream(
        &output_config,
        output_data_fn,
        move |err| tracing::error!("An error occurred on output stream: {}", err),
        None,
    )?;
    stream.play()?;

    Ok((stream, timeline))
}

impl AudioOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        self.timeline().now()
    }

    fn start(&mut self, id: u64, at: f64, samples: Vec<f32>, sample_rate: u32) {
        let mut timeline = self.timeline();
        if sample_rate != timeline.sample_rate() {
            tracing::warn!(
                "Dropping {}hz chunk on a {}hz output",
                sample_rate,
                timeline.sample_rate()
            );
            return;
        }
        timeline.insert(id, at, samples);
    }

    fn stop(&mut self, id: u64) -> bool {
        self.timeline().cancel(id)
    }

    fn close(&mut self) {
        self.timeline().clear();
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Speaker thread panicked");
            }
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Camera stand-in that serves the latest image written to a file.
///
/// The file is decoded again whenever its modification time changes, so an
/// external capture tool can keep overwriting it.
pub struct SnapshotCamera {
    path: PathBuf,
    modified: Option<SystemTime>,
    frame: Option<RgbImage>,
}

impl SnapshotCamera {
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        std::fs::metadata(path)
            .map_err(|e| device_error("camera", format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            modified: None,
            frame: None,
        })
    }
}

impl FrameSource for SnapshotCamera {
    fn current_frame(&mut self) -> Option<RgbImage> {
        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();
        if self.frame.is_none() || (modified.is_some() && modified != self.modified) {
            match image::open(&self.path) {
                Ok(image) => {
                    self.frame = Some(image.to_rgb8());
                    self.modified = modified;
                }
                // A half-written file keeps the previous frame.
                Err(e) => tracing::debug!("Could not decode {}: {}", self.path.display(), e),
            }
        }
        self.frame.clone()
    }
}

/// Frame source for sessions without a camera.
struct NoCamera;

impl FrameSource for NoCamera {
    fn current_frame(&mut self) -> Option<RgbImage> {
        None
    }
}
