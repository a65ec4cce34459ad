//! Sample-rate conversion between device rates and wire rates
//!
//! Capture devices typically run at 44.1/48kHz while the live stream wants
//! 16kHz in and delivers 24kHz out. Integer downsampling ratios use simple
//! averaging; everything else falls back to linear interpolation.

/// Streaming resampler for a mono signal
///
/// Keeps the fractional read position between calls so that consecutive
/// device callbacks resample as one continuous signal.
///
/// Thread-safety: NOT internally synchronized; owned by the capture callback.
#[derive(Debug)]
pub struct Resampler {
    source_rate: u32,
    target_rate: u32,
    /// Position of the next output sample, in source samples, relative to `carry`
    position: f64,
    /// Last source sample of the previous call (for interpolation across calls)
    carry: Option<f32>,
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        Self {
            source_rate,
            target_rate,
            position: 0.0,
            carry: None,
        }
    }

    /// Ratio of source samples consumed per output sample
    fn step(&self) -> f64 {
        self.source_rate as f64 / self.target_rate as f64
    }

    /// Whether this resampler passes samples through unchanged
    pub fn is_passthrough(&self) -> bool {
        self.source_rate == self.target_rate || self.source_rate == 0 || self.target_rate == 0
    }

    /// Resample the next block of the signal
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return input.to_vec();
        }

        // Virtual signal: [carry?, input...]; index 0 is carry when present
        let carry = self.carry;
        let offset = usize::from(carry.is_some());
        let total = input.len() + offset;
        let sample_at = |i: usize| -> f32 {
            match (i, carry) {
                (0, Some(c)) => c,
                _ => input[i - offset],
            }
        };

        let step = self.step();
        let mut out = Vec::with_capacity((input.len() as f64 / step).ceil() as usize + 1);
        let mut pos = self.position;

        while pos + 1.0 < total as f64 {
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = sample_at(idx);
            let b = sample_at(idx + 1);
            out.push(a + (b - a) * frac);
            pos += step;
        }

        if total > 0 {
            // Re-base so the last sample becomes the next call's carry
            self.carry = Some(sample_at(total - 1));
            self.position = pos - (total - 1) as f64;
        }

        out
    }
}

/// Resample a complete buffer in one shot
///
/// Integer downsampling ratios (e.g. 48kHz → 16kHz) average each group of
/// source samples; any other ratio uses linear interpolation.
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    // Guard against division by zero
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate {
        return samples.to_vec();
    }

    if source_rate > target_rate && source_rate % target_rate == 0 {
        let ratio = (source_rate / target_rate) as usize;
        return samples
            .chunks(ratio)
            .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
            .collect();
    }

    let mut resampler = Resampler::new(source_rate, target_rate);
    let mut out = resampler.process(samples);
    // Flush the tail so the output covers the whole input duration
    let expected = (samples.len() as u64 * target_rate as u64 / source_rate as u64) as usize;
    if let Some(&last) = samples.last() {
        while out.len() < expected {
            out.push(last);
        }
    }
    out
}

/// Average interleaved channels down to a single mono channel
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}
