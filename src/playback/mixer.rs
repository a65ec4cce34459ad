//! Sample-clock mixer backing the speaker output
//!
//! Voices are placed at absolute frame positions on a clock that only the
//! device callback advances (`render`). Everything here is plain data so the
//! timing rules can be tested without an audio device.

use super::UnitId;

#[derive(Debug)]
struct Voice {
    id: UnitId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mono mixer with an absolute frame clock
#[derive(Debug)]
pub struct Mixer {
    sample_rate: u32,
    frames_rendered: u64,
    voices: Vec<Voice>,
    finished: Vec<UnitId>,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames_rendered: 0,
            voices: Vec::new(),
            finished: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Seconds rendered so far
    pub fn current_time(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    /// Place mono samples (already at the mixer rate) at time `when`
    ///
    /// A start time that the clock has already passed is moved to the
    /// current frame so no samples are skipped.
    pub fn schedule(&mut self, id: UnitId, samples: Vec<f32>, when: f64) {
        let requested = (when.max(0.0) * self.sample_rate as f64).round() as u64;
        let start_frame = requested.max(self.frames_rendered);
        self.voices.push(Voice {
            id,
            start_frame,
            samples,
        });
    }

    /// Remove a voice; returns false when it was not playing
    pub fn stop(&mut self, id: UnitId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    /// Render the next block into interleaved `out`, returning the mono mix
    pub fn render(&mut self, out: &mut [f32], channels: usize) -> Vec<f32> {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        let base = self.frames_rendered;
        let mut mix = vec![0.0f32; frames];

        for voice in &self.voices {
            let block_end = base + frames as u64;
            if voice.start_frame >= block_end || voice.end_frame() <= base {
                continue;
            }
            let from = voice.start_frame.max(base);
            let to = voice.end_frame().min(block_end);
            for abs in from..to {
                mix[(abs - base) as usize] += voice.samples[(abs - voice.start_frame) as usize];
            }
        }

        for (frame, &value) in out.chunks_mut(channels).zip(mix.iter()) {
            let value = value.clamp(-1.0, 1.0);
            for sample in frame.iter_mut() {
                *sample = value;
            }
        }

        self.frames_rendered += frames as u64;

        let now = self.frames_rendered;
        let finished = &mut self.finished;
        self.voices.retain(|v| {
            if v.end_frame() <= now {
                finished.push(v.id);
                false
            } else {
                true
            }
        });

        mix
    }

    /// Ids of voices that played to completion since the last call
    pub fn take_finished(&mut self) -> Vec<UnitId> {
        std::mem::take(&mut self.finished)
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Drop every voice without reporting completion
    pub fn clear(&mut self) {
        self.voices.clear();
        self.finished.clear();
    }
}
