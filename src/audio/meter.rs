//! Level meter for the call visualizer
//!
//! Both the microphone (before the mute gate) and the speaker mix feed a
//! bounded tap channel. The meter task buffers recent samples, computes
//! RMS bars, applies EMA smoothing and publishes a frame at ~30fps.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// Number of visualization bars
pub const NUM_BARS: usize = 24;

/// Buffer capacity (~200ms at 48kHz mono)
const BUFFER_CAPACITY: usize = 10_000;

/// EMA smoothing factor (0.3 = 30% new value, 70% previous)
const EMA_ALPHA: f32 = 0.3;

/// Frame interval for 30fps emission
const FRAME_INTERVAL_MS: u64 = 33;

/// Sender side of a visualization tap (raw mono samples)
pub type LevelTap = mpsc::Sender<Vec<f32>>;

/// Receiver side of a visualization tap
pub type LevelTapReceiver = mpsc::Receiver<Vec<f32>>;

/// Which side of the call a level frame describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MeterSource {
    Microphone,
    Speaker,
}

/// One published visualization frame
#[derive(Debug, Clone, Serialize)]
pub struct LevelFrame {
    pub source: MeterSource,
    pub bars: [f32; NUM_BARS],
}

impl LevelFrame {
    /// Overall level (mean of the bars), for compact renderers
    pub fn level(&self) -> f32 {
        self.bars.iter().sum::<f32>() / NUM_BARS as f32
    }
}

/// Create a bounded tap channel; senders use `try_send` and never block audio
pub fn create_level_tap() -> (LevelTap, LevelTapReceiver) {
    mpsc::channel(100)
}

/// Ring buffer of recent samples used for visualization
pub struct LevelBuffer {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl LevelBuffer {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(BUFFER_CAPACITY),
            capacity: BUFFER_CAPACITY,
        }
    }

    /// Add samples, dropping the oldest when at capacity
    pub fn push_samples(&mut self, samples: &[f32]) {
        let len = samples.len();

        if len >= self.capacity {
            self.samples.clear();
            self.samples.extend(&samples[len - self.capacity..]);
            return;
        }

        let to_remove = (self.samples.len() + len).saturating_sub(self.capacity);
        if to_remove > 0 {
            self.samples.drain(0..to_remove);
        }

        self.samples.extend(samples);
    }

    /// Compute NUM_BARS normalized RMS values (0.0-1.0)
    pub fn compute_bars(&self) -> [f32; NUM_BARS] {
        let mut bars = [0.0f32; NUM_BARS];

        if self.samples.is_empty() {
            return bars;
        }

        let samples_per_bar = (self.samples.len() / NUM_BARS).max(1);

        for (bar_idx, bar) in bars.iter_mut().enumerate() {
            let start = bar_idx * samples_per_bar;
            let end = ((bar_idx + 1) * samples_per_bar).min(self.samples.len());

            if start >= self.samples.len() {
                break;
            }

            let count = end - start;
            if count == 0 {
                continue;
            }

            let sum_squares: f64 = (start..end)
                .map(|i| {
                    let s = self.samples[i] as f64;
                    s * s
                })
                .sum();

            let rms = (sum_squares / count as f64).sqrt();
            *bar = (rms as f32).clamp(0.0, 1.0);
        }

        bars
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

impl Default for LevelBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// EMA smoothing state:
/// smoothed[i] = alpha * current[i] + (1 - alpha) * previous[i]
struct EmaState {
    prev_bars: [f32; NUM_BARS],
    initialized: bool,
}

impl EmaState {
    fn new() -> Self {
        Self {
            prev_bars: [0.0f32; NUM_BARS],
            initialized: false,
        }
    }

    fn apply(&mut self, bars: &mut [f32; NUM_BARS]) {
        if !self.initialized {
            self.prev_bars = *bars;
            self.initialized = true;
            return;
        }

        for (bar, prev) in bars.iter_mut().zip(self.prev_bars.iter()) {
            *bar = EMA_ALPHA * *bar + (1.0 - EMA_ALPHA) * prev;
        }

        self.prev_bars = *bars;
    }
}

/// Run a level meter until `cancel` fires or the tap closes
///
/// Each tick drains the tap, recomputes the bars and hands a smoothed
/// `LevelFrame` to `publish`.
pub async fn run_level_meter(
    source: MeterSource,
    mut rx: LevelTapReceiver,
    cancel: CancellationToken,
    publish: Arc<dyn Fn(LevelFrame) + Send + Sync>,
) {
    let mut buffer = LevelBuffer::new();
    let mut ema = EmaState::new();
    let mut tick = interval(Duration::from_millis(FRAME_INTERVAL_MS));

    log::debug!("Level meter started ({:?})", source);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = tick.tick() => {
                loop {
                    match rx.try_recv() {
                        Ok(samples) => buffer.push_samples(&samples),
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            log::debug!("Level tap closed ({:?})", source);
                            return;
                        }
                    }
                }

                let mut bars = buffer.compute_bars();
                ema.apply(&mut bars);
                publish(LevelFrame { source, bars });
            }
        }
    }

    buffer.clear();
    log::debug!("Level meter stopped ({:?})", source);
}
