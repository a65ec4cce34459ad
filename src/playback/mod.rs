//! Playback of streamed model speech
//!
//! Inbound audio chunks arrive in bursts with varying durations. The
//! scheduler decodes each one and queues it back-to-back against the output
//! clock so playback is gapless and never overlaps; an interruption from the
//! server stops everything that is queued.
//!
//! ```text
//! base64 PCM16 ──▶ PlaybackScheduler ──start_at(t)──▶ OutputContext (Mixer)
//!                    next_start_time                   sample clock
//!                    in-flight set   ◀──take_finished──
//! ```

mod mixer;
mod scheduler;

pub use mixer::Mixer;
pub use scheduler::{PlaybackScheduler, PlaybackUnit, ScheduledChunk};

use crate::audio::pcm::AudioBuffer;

/// Identifier of one scheduled playback unit
pub type UnitId = u64;

/// Clocked audio output that plays buffers at absolute times
///
/// Times are seconds on the output's own playback clock, which starts at 0
/// when the context is opened.
pub trait OutputContext: Send {
    /// Current position of the playback clock in seconds
    fn current_time(&self) -> f64;

    /// Start playing `buffer` at `when`; a time in the past starts immediately
    fn start_at(&mut self, id: UnitId, buffer: &AudioBuffer, when: f64);

    /// Halt a unit; stopping a finished or unknown unit is a no-op
    fn stop(&mut self, id: UnitId);

    /// Units that finished playing naturally since the last call
    fn take_finished(&mut self) -> Vec<UnitId>;

    /// Release the output device
    fn close(&mut self);
}
