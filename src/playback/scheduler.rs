//! Gapless scheduling of inbound speech chunks
//!
//! Arrival order is playback order: each chunk starts at
//! `max(next_start_time, clock)` and pushes the cursor forward by its own
//! duration. There is no reordering by content.

use std::collections::HashMap;

use super::{OutputContext, UnitId};
use crate::audio::pcm::{bytes_to_audio_buffer, decode_base64, AudioBuffer, CodecError};

/// A decoded buffer and the time it was scheduled to start
#[derive(Debug, Clone)]
pub struct PlaybackUnit {
    pub id: UnitId,
    pub buffer: AudioBuffer,
    pub start: f64,
}

impl PlaybackUnit {
    pub fn end(&self) -> f64 {
        self.start + self.buffer.duration()
    }
}

/// Summary of a successfully scheduled chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub id: UnitId,
    pub start: f64,
    pub duration: f64,
}

/// Decodes inbound PCM16 chunks and queues them back-to-back on an output
///
/// Single-writer: only the session's inbound handler touches the scheduler,
/// one event at a time.
pub struct PlaybackScheduler {
    output: Box<dyn OutputContext>,
    channels: u16,
    /// End of the last scheduled unit; 0 means "nothing scheduled"
    next_start_time: f64,
    in_flight: HashMap<UnitId, PlaybackUnit>,
    next_unit_id: UnitId,
    closed: bool,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn OutputContext>, channels: u16) -> Self {
        Self {
            output,
            channels,
            next_start_time: 0.0,
            in_flight: HashMap::new(),
            next_unit_id: 0,
            closed: false,
        }
    }

    /// Decode and schedule one base64 PCM16 chunk
    ///
    /// A decode failure leaves the cursor and in-flight set untouched.
    pub fn enqueue_base64(
        &mut self,
        data: &str,
        sample_rate: u32,
    ) -> Result<ScheduledChunk, CodecError> {
        let bytes = decode_base64(data)?;
        self.enqueue_bytes(&bytes, sample_rate)
    }

    /// Decode and schedule one chunk of raw PCM16 LE bytes
    pub fn enqueue_bytes(
        &mut self,
        bytes: &[u8],
        sample_rate: u32,
    ) -> Result<ScheduledChunk, CodecError> {
        let buffer = bytes_to_audio_buffer(bytes, sample_rate, self.channels)?;
        Ok(self.schedule(buffer))
    }

    /// Queue an already decoded buffer after everything scheduled so far
    pub fn schedule(&mut self, buffer: AudioBuffer) -> ScheduledChunk {
        self.reap_finished();

        let clock = self.output.current_time();
        if self.next_start_time > 0.0 && self.next_start_time < clock {
            // Chunks are arriving slower than real time; the gap stays audible
            log::debug!(
                "Playback underrun: cursor {:.3}s behind clock {:.3}s",
                clock - self.next_start_time,
                clock
            );
        }

        let start = self.next_start_time.max(clock);
        let duration = buffer.duration();
        let id = self.next_unit_id;
        self.next_unit_id += 1;

        self.output.start_at(id, &buffer, start);
        self.next_start_time = start + duration;
        self.in_flight.insert(id, PlaybackUnit { id, buffer, start });

        ScheduledChunk {
            id,
            start,
            duration,
        }
    }

    /// Stop everything queued and start the next chunk fresh against the clock
    ///
    /// Returns the number of units that were in flight.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.in_flight.len();
        for id in self.in_flight.keys() {
            self.output.stop(*id);
        }
        self.in_flight.clear();
        self.next_start_time = 0.0;
        // Anything that finished meanwhile is no longer tracked
        let _ = self.output.take_finished();
        stopped
    }

    /// Release units whose playback completed
    pub fn reap_finished(&mut self) {
        for id in self.output.take_finished() {
            self.in_flight.remove(&id);
        }
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn current_time(&self) -> f64 {
        self.output.current_time()
    }

    /// Stop all playback and release the output; idempotent
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.interrupt();
        self.output.close();
        self.closed = true;
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::{encode_pcm16, OUTPUT_SAMPLE_RATE};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        clock: f64,
        started: Vec<(UnitId, f64, f64)>,
        stopped: Vec<UnitId>,
        finished: Vec<UnitId>,
        closed: bool,
    }

    #[derive(Clone, Default)]
    struct FakeOutput(Arc<Mutex<FakeState>>);

    impl FakeOutput {
        fn set_clock(&self, t: f64) {
            self.0.lock().unwrap().clock = t;
        }
        fn finish(&self, id: UnitId) {
            self.0.lock().unwrap().finished.push(id);
        }
    }

    impl OutputContext for FakeOutput {
        fn current_time(&self) -> f64 {
            self.0.lock().unwrap().clock
        }
        fn start_at(&mut self, id: UnitId, buffer: &AudioBuffer, when: f64) {
            self.0
                .lock()
                .unwrap()
                .started
                .push((id, when, buffer.duration()));
        }
        fn stop(&mut self, id: UnitId) {
            self.0.lock().unwrap().stopped.push(id);
        }
        fn take_finished(&mut self) -> Vec<UnitId> {
            std::mem::take(&mut self.0.lock().unwrap().finished)
        }
        fn close(&mut self) {
            self.0.lock().unwrap().closed = true;
        }
    }

    fn chunk(seconds: f64) -> String {
        let frames = (seconds * OUTPUT_SAMPLE_RATE as f64) as usize;
        STANDARD.encode(encode_pcm16(&vec![0.1; frames]))
    }

    fn scheduler() -> (PlaybackScheduler, FakeOutput) {
        let output = FakeOutput::default();
        (PlaybackScheduler::new(Box::new(output.clone()), 1), output)
    }

    #[test]
    fn test_chunks_are_back_to_back() {
        let (mut sched, _output) = scheduler();
        let durations = [0.5, 0.25, 1.0, 0.125];
        let mut prev_end = 0.0;

        for d in durations {
            let c = sched.enqueue_base64(&chunk(d), OUTPUT_SAMPLE_RATE).unwrap();
            assert!(c.start >= prev_end - 1e-9);
            assert!((c.start - prev_end).abs() < 1e-9, "gap before chunk {}", c.id);
            prev_end = c.start + c.duration;
        }
        assert!((sched.next_start_time() - 1.875).abs() < 1e-9);
        assert_eq!(sched.in_flight_len(), 4);
    }

    #[test]
    fn test_start_clamped_to_clock() {
        let (mut sched, output) = scheduler();
        sched.enqueue_base64(&chunk(0.5), OUTPUT_SAMPLE_RATE).unwrap();

        // Clock passed the end of the queue: next chunk starts now, not in the past
        output.set_clock(2.0);
        let c = sched.enqueue_base64(&chunk(0.5), OUTPUT_SAMPLE_RATE).unwrap();
        assert!((c.start - 2.0).abs() < 1e-9);
        assert!((sched.next_start_time() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_interrupt_resets_cursor_and_in_flight() {
        let (mut sched, output) = scheduler();
        let a = sched.enqueue_base64(&chunk(1.0), OUTPUT_SAMPLE_RATE).unwrap();
        assert!((sched.next_start_time() - 1.0).abs() < 1e-9);

        assert_eq!(sched.interrupt(), 1);
        assert_eq!(sched.in_flight_len(), 0);
        assert_eq!(sched.next_start_time(), 0.0);
        assert_eq!(output.0.lock().unwrap().stopped, vec![a.id]);

        // B must not inherit A's stale end time
        output.set_clock(0.2);
        let b = sched.enqueue_base64(&chunk(0.5), OUTPUT_SAMPLE_RATE).unwrap();
        assert!((b.start - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_interrupt_with_nothing_queued() {
        let (mut sched, _output) = scheduler();
        assert_eq!(sched.interrupt(), 0);
        assert_eq!(sched.next_start_time(), 0.0);
    }

    #[test]
    fn test_finished_units_leave_in_flight_set() {
        let (mut sched, output) = scheduler();
        let a = sched.enqueue_base64(&chunk(0.25), OUTPUT_SAMPLE_RATE).unwrap();
        sched.enqueue_base64(&chunk(0.25), OUTPUT_SAMPLE_RATE).unwrap();

        output.finish(a.id);
        sched.reap_finished();
        assert_eq!(sched.in_flight_len(), 1);

        // Interrupt only stops what is still in flight
        sched.interrupt();
        assert!(!output.0.lock().unwrap().stopped.contains(&a.id));
    }

    #[test]
    fn test_invalid_length_leaves_cursor_unchanged() {
        let (mut sched, _output) = scheduler();
        sched.enqueue_base64(&chunk(0.5), OUTPUT_SAMPLE_RATE).unwrap();
        let before = sched.next_start_time();

        let odd = STANDARD.encode([1u8, 2, 3]);
        let err = sched.enqueue_base64(&odd, OUTPUT_SAMPLE_RATE).unwrap_err();
        assert!(matches!(err, CodecError::InvalidBufferLength { .. }));
        assert_eq!(sched.next_start_time(), before);
        assert_eq!(sched.in_flight_len(), 1);

        // Subsequent chunks still schedule normally
        let c = sched.enqueue_base64(&chunk(0.5), OUTPUT_SAMPLE_RATE).unwrap();
        assert!((c.start - before).abs() < 1e-9);
    }

    #[test]
    fn test_malformed_base64_is_dropped() {
        let (mut sched, _output) = scheduler();
        let err = sched
            .enqueue_base64("%%%not-base64%%%", OUTPUT_SAMPLE_RATE)
            .unwrap_err();
        assert!(matches!(err, CodecError::MalformedInput(_)));
        assert_eq!(sched.next_start_time(), 0.0);
        assert_eq!(sched.in_flight_len(), 0);
    }

    #[test]
    fn test_empty_chunk_is_zero_duration() {
        let (mut sched, _output) = scheduler();
        let c = sched.enqueue_bytes(&[], OUTPUT_SAMPLE_RATE).unwrap();
        assert_eq!(c.duration, 0.0);
    }

    #[test]
    fn test_close_stops_and_releases_output() {
        let (mut sched, output) = scheduler();
        sched.enqueue_base64(&chunk(0.5), OUTPUT_SAMPLE_RATE).unwrap();
        sched.close();
        sched.close();

        let state = output.0.lock().unwrap();
        assert!(state.closed);
        assert_eq!(state.stopped.len(), 1);
        assert_eq!(sched.next_start_time(), 0.0);
    }
}
