//! Audio capture, codec and device access for live calls
//!
//! Microphone audio is captured through CPAL on a dedicated thread, downmixed,
//! resampled to 16kHz and cut into fixed 4096-sample frames. The same raw
//! signal feeds a level meter for the call visualizer.

pub mod capture;
mod cpal_host;
pub mod meter;
pub mod pcm;
pub mod resample;

pub use capture::{
    CaptureConfig, CaptureCounters, CapturePipeline, FrameAssembler, FrameSink, MuteControl,
};
pub use cpal_host::CpalHost;
pub use meter::{create_level_tap, run_level_meter, LevelFrame, LevelTap, MeterSource};
pub use pcm::{AudioBuffer, AudioFrame, CodecError, MediaBlob};

use crate::playback::OutputContext;

/// Errors that can occur while acquiring or running an audio device
#[derive(Debug, Clone)]
pub enum AudioError {
    /// No device, or access to it was denied
    DeviceUnavailable(String),
    /// The device offers no sample format we can handle
    UnsupportedFormat(String),
    /// The device stream could not be built or started
    StreamFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::DeviceUnavailable(e) => write!(f, "Audio device unavailable: {}", e),
            AudioError::UnsupportedFormat(e) => write!(f, "Unsupported audio format: {}", e),
            AudioError::StreamFailed(e) => write!(f, "Audio stream failed: {}", e),
        }
    }
}

impl std::error::Error for AudioError {}

/// Callback receiving interleaved f32 samples from an input device
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// An acquired (but not necessarily running) input device
pub trait InputDevice: Send {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Begin delivering samples to `on_samples`
    fn start(&mut self, on_samples: SampleCallback) -> Result<(), AudioError>;

    /// Stop the stream; no callback runs after this returns. Idempotent.
    fn stop(&mut self);
}

/// Source of input devices and output contexts
///
/// `CpalHost` talks to real hardware; tests provide in-memory hosts.
pub trait AudioHost: Send + Sync + 'static {
    /// Acquire the named input device, or the default one
    fn open_input(&self, device: Option<&str>) -> Result<Box<dyn InputDevice>, AudioError>;

    /// Open a clocked output; the speaker mix is copied to `tap` when given
    fn open_output(
        &self,
        device: Option<&str>,
        tap: Option<LevelTap>,
    ) -> Result<Box<dyn OutputContext>, AudioError>;
}
