use crate::audio::AudioOutput;
use crate::sampler::FrameSource;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;

/// Why the camera or microphone could not be opened.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("permission to use the {0} was denied")]
    PermissionDenied(String),
    #[error("the {device} is unavailable: {reason}")]
    Unavailable { device: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct AudioConstraints {
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    User,
    Environment,
}

#[derive(Debug, Clone)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing: Facing,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            facing: Facing::Environment,
        }
    }
}

/// Live microphone and camera tracks.
///
/// The session takes the tracks out to feed its capture and sampling tasks;
/// the stream itself stays with the session until it is released.
pub struct MediaStream {
    input_sample_rate: u32,
    microphone: Option<mpsc::Receiver<Vec<f32>>>,
    camera: Option<Box<dyn FrameSource>>,
    on_stop: Option<Box<dyn FnOnce() + Send>>,
}

impl MediaStream {
    /// `microphone` yields mono samples at `input_sample_rate`.
    pub fn new(
        input_sample_rate: u32,
        microphone: mpsc::Receiver<Vec<f32>>,
        camera: Box<dyn FrameSource>,
    ) -> Self {
        Self {
            input_sample_rate,
            microphone: Some(microphone),
            camera: Some(camera),
            on_stop: None,
        }
    }

    /// Registers the hook that shuts the underlying devices down.
    pub fn on_stop(mut self, stop: impl FnOnce() + Send + 'static) -> Self {
        self.on_stop = Some(Box::new(stop));
        self
    }

    pub fn input_sample_rate(&self) -> u32 {
        self.input_sample_rate
    }

    pub fn take_microphone(&mut self) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.microphone.take()
    }

    pub fn take_camera(&mut self) -> Option<Box<dyn FrameSource>> {
        self.camera.take()
    }

    /// Stops every track. Calling it again is a no-op.
    pub fn stop_tracks(&mut self) {
        self.microphone = None;
        self.camera = None;
        if let Some(stop) = self.on_stop.take() {
            stop();
        }
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.stop_tracks();
    }
}

/// Platform access to the camera, microphone and speaker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(
        &self,
        audio: AudioConstraints,
        video: VideoConstraints,
    ) -> Result<MediaStream, DeviceError>;

    /// Stops the stream's tracks. Dropping a stream stops them as well.
    async fn release(&self, stream: MediaStream) {
        drop(stream);
    }

    /// Opens a playback context for PCM at `sample_rate`.
    async fn open_output(&self, sample_rate: u32) -> anyhow::Result<Box<dyn AudioOutput>>;
}
