//! Microphone capture pipeline
//!
//! Turns the device callback into a steady sequence of fixed-size frames:
//!
//! ```text
//! device callback ──▶ downmix ──┬──▶ level tap (always)
//!                               └──▶ resample 16kHz ──▶ 4096-sample block
//!                                                          │ muted? drop
//!                                                          ▼
//!                                                 AudioFrame ──▶ sink
//! ```
//!
//! The sink is called from the audio thread and must not block.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::meter::LevelTap;
use super::pcm::{AudioFrame, INPUT_SAMPLE_RATE};
use super::resample::{downmix, Resampler};
use super::{AudioError, AudioHost, InputDevice};

/// Samples per outbound frame
pub const CAPTURE_BLOCK_SIZE: usize = 4096;

/// Receives each completed frame exactly once, in capture order
pub type FrameSink = Box<dyn FnMut(AudioFrame) + Send + 'static>;

/// Capture format settings
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Rate of the frames handed to the sink
    pub sample_rate: u32,
    /// Samples per frame
    pub block_size: usize,
    /// Input device name; `None` for the system default
    pub device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: INPUT_SAMPLE_RATE,
            block_size: CAPTURE_BLOCK_SIZE,
            device: None,
        }
    }
}

/// Frame counters shared with the audio thread
#[derive(Debug, Default)]
pub struct CaptureCounters {
    pub frames_sent: AtomicU64,
    pub frames_muted: AtomicU64,
}

impl CaptureCounters {
    pub fn sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn muted(&self) -> u64 {
        self.frames_muted.load(Ordering::Relaxed)
    }
}

/// Shared mute switch of one capture pipeline
///
/// Muting gates the outbound path only; visualization keeps running.
#[derive(Debug, Clone)]
pub struct MuteControl(Arc<AtomicBool>);

impl MuteControl {
    pub fn set(&self, muted: bool) {
        if self.0.swap(muted, Ordering::SeqCst) != muted {
            log::info!("Microphone {}", if muted { "muted" } else { "unmuted" });
        }
    }
}

/// Block assembly, mute gating and tap fan-out for one capture stream
///
/// Lives inside the device callback; holds no locks.
pub struct FrameAssembler {
    device_channels: usize,
    resampler: Resampler,
    block: Vec<f32>,
    block_size: usize,
    sample_rate: u32,
    muted: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    sink: FrameSink,
    tap: Option<LevelTap>,
}

impl FrameAssembler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_rate: u32,
        device_channels: u16,
        config: &CaptureConfig,
        muted: Arc<AtomicBool>,
        running: Arc<AtomicBool>,
        counters: Arc<CaptureCounters>,
        sink: FrameSink,
        tap: Option<LevelTap>,
    ) -> Self {
        let block_size = config.block_size.max(1);
        Self {
            device_channels: device_channels.max(1) as usize,
            resampler: Resampler::new(device_rate, config.sample_rate),
            block: Vec::with_capacity(block_size),
            block_size,
            sample_rate: config.sample_rate,
            muted,
            running,
            counters,
            sink,
            tap,
        }
    }

    /// Feed one device callback's worth of interleaved samples
    pub fn push_interleaved(&mut self, data: &[f32]) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let mono = downmix(data, self.device_channels);

        // Visualization sees everything, muted or not; a full tap just skips a frame
        if let Some(tap) = &self.tap {
            let _ = tap.try_send(mono.clone());
        }

        for sample in self.resampler.process(&mono) {
            self.block.push(sample);
            if self.block.len() == self.block_size {
                self.complete_block();
            }
        }
    }

    fn complete_block(&mut self) {
        let samples = std::mem::replace(&mut self.block, Vec::with_capacity(self.block_size));

        if self.muted.load(Ordering::SeqCst) {
            self.counters.frames_muted.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let frame = AudioFrame::from_samples(&samples, self.sample_rate);
        (self.sink)(frame);
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
    }
}

/// Exclusive microphone access producing outbound frames
pub struct CapturePipeline {
    device: Box<dyn InputDevice>,
    config: CaptureConfig,
    muted: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    started: bool,
}

impl CapturePipeline {
    /// Acquire the configured input device without starting it
    pub fn open(host: &dyn AudioHost, config: CaptureConfig) -> Result<Self, AudioError> {
        let device = host.open_input(config.device.as_deref())?;

        log::info!(
            "Capture device ready: {} Hz, {} channel(s) -> {} Hz frames of {} samples",
            device.sample_rate(),
            device.channels(),
            config.sample_rate,
            config.block_size
        );

        Ok(Self {
            device,
            config,
            muted: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(CaptureCounters::default()),
            started: false,
        })
    }

    /// Start producing frames into `sink`; raw audio also goes to `tap`
    pub fn start(&mut self, sink: FrameSink, tap: Option<LevelTap>) -> Result<(), AudioError> {
        if self.started {
            log::warn!("Capture already started, ignoring");
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);

        let mut assembler = FrameAssembler::new(
            self.device.sample_rate(),
            self.device.channels(),
            &self.config,
            self.muted.clone(),
            self.running.clone(),
            self.counters.clone(),
            sink,
            tap,
        );

        if let Err(e) = self
            .device
            .start(Box::new(move |data| assembler.push_interleaved(data)))
        {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.started = true;
        log::info!("Capture started");
        Ok(())
    }

    /// Switch gating the outbound path; usable while the pipeline is starting
    pub fn mute_control(&self) -> MuteControl {
        MuteControl(self.muted.clone())
    }

    pub fn counters(&self) -> Arc<CaptureCounters> {
        self.counters.clone()
    }

    /// Release the device; no frame is delivered after this returns
    pub fn stop(&mut self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.device.stop();
        if was_running {
            log::info!(
                "Capture stopped ({} frames sent, {} muted)",
                self.counters.sent(),
                self.counters.muted()
            );
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
