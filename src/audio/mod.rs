//! Audio devices for the live session
//!
//! Capture and playback are hidden behind the [`AudioBackend`] trait so the
//! session controller never touches cpal directly. The cpal implementation
//! keeps every stream on its own device thread; the handles returned here are
//! `Send` and release their stream exactly once, on `close()` or on drop.

pub mod capture;
mod device_thread;
pub mod output;
pub mod pcm;
pub mod playback;

use std::sync::Arc;

use thiserror::Error;

pub use capture::{frame_volume, CaptureConfig, CpalInput, FrameAccumulator};
pub use output::CpalOutput;
pub use pcm::{DecodeError, EncodedChunk, PlaybackBuffer};
pub use playback::{BufferId, PlaybackScheduler, ScheduledBuffer};

/// Errors that can occur while opening or running audio devices.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("No audio output device found")]
    NoOutputDevice,
    #[error("No supported audio configuration: {0}")]
    NoSupportedConfig(String),
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Audio device closed")]
    Closed,
}

impl AudioError {
    /// Permission failures are reported separately from missing hardware
    pub fn is_permission(&self) -> bool {
        matches!(self, AudioError::PermissionDenied(_))
    }
}

/// Receives each complete capture frame. Called on the device thread.
pub type FrameSink = Box<dyn FnMut(Vec<f32>) + Send + 'static>;

/// Notified when a scheduled buffer finishes playing on its own.
pub type EndedNotifier = Arc<dyn Fn(BufferId) + Send + Sync + 'static>;

/// A microphone stream that produces frames once started.
pub trait InputDevice: Send {
    /// Begin delivering frames to the sink registered at open time
    fn start(&mut self) -> Result<(), AudioError>;

    /// Stop the microphone and release the stream. Idempotent.
    fn close(&mut self);
}

/// An output device with a monotonic clock and sample-accurate scheduling.
pub trait OutputDevice: Send {
    /// Current position of the output clock in seconds
    fn current_time(&self) -> f64;

    /// Play `buffer` starting at `when` (seconds on the output clock).
    /// A start time in the past plays immediately.
    fn start(&mut self, id: BufferId, buffer: PlaybackBuffer, when: f64);

    /// Stop a buffer immediately, regardless of playback position.
    fn stop(&mut self, id: BufferId);

    /// Release the device. Idempotent.
    fn close(&mut self);
}

/// Opens the input and output devices for a session.
pub trait AudioBackend: Send + Sync + 'static {
    fn open_input(
        &self,
        config: CaptureConfig,
        sink: FrameSink,
    ) -> Result<Box<dyn InputDevice>, AudioError>;

    fn open_output(
        &self,
        sample_rate: u32,
        ended: EndedNotifier,
    ) -> Result<Box<dyn OutputDevice>, AudioError>;
}

/// Backend using the host's default cpal devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(
        &self,
        config: CaptureConfig,
        sink: FrameSink,
    ) -> Result<Box<dyn InputDevice>, AudioError> {
        Ok(Box::new(CpalInput::open(config, sink)?))
    }

    fn open_output(
        &self,
        sample_rate: u32,
        ended: EndedNotifier,
    ) -> Result<Box<dyn OutputDevice>, AudioError> {
        Ok(Box::new(CpalOutput::open(sample_rate, ended)?))
    }
}

/// Classify a cpal build error, separating permission problems from the rest.
pub(crate) fn classify_build_error(err: cpal::BuildStreamError) -> AudioError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            AudioError::StreamCreationFailed("device not available".to_string())
        }
        cpal::BuildStreamError::StreamConfigNotSupported => {
            AudioError::NoSupportedConfig("stream config not supported".to_string())
        }
        cpal::BuildStreamError::BackendSpecific { err } => {
            let description = err.description;
            let lower = description.to_lowercase();
            if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
                AudioError::PermissionDenied(description)
            } else {
                AudioError::StreamCreationFailed(description)
            }
        }
        other => AudioError::StreamCreationFailed(other.to_string()),
    }
}
