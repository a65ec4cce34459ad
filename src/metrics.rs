//! Per-call metrics for Sales Boss Live
//!
//! Tracks connection time, audio traffic, interruptions, tool calls and error
//! history for each call. Summarised when a call ends.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Maximum number of completed calls to retain in history
const MAX_CALL_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Metrics for a finished call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMetrics {
    pub call_id: String,
    /// Unix timestamp when the call was started (seconds)
    pub started_at: u64,
    /// Time from "call" to the stream opening, in milliseconds
    pub connect_ms: u64,
    /// Time the stream was open, in milliseconds
    pub talk_ms: u64,
    pub frames_sent: u64,
    pub frames_muted: u64,
    pub chunks_scheduled: u64,
    pub chunks_dropped: u64,
    pub interruptions: u64,
    pub tool_calls: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Summary across all recorded calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Average connect time (ms) across calls that opened
    pub avg_connect_ms: u64,
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: u64,
    /// Category of error (e.g., "audio", "transport", "tool")
    pub error_type: String,
    pub message: String,
    pub call_id: Option<String>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct CallInProgress {
    call_id: Uuid,
    started_at: Instant,
    started_at_unix: u64,
    opened_at: Option<Instant>,
    connect_duration: Option<Duration>,
    frames_sent: u64,
    frames_muted: u64,
    chunks_scheduled: u64,
    chunks_dropped: u64,
    interruptions: u64,
    tool_calls: u64,
}

impl CallInProgress {
    fn new(call_id: Uuid) -> Self {
        Self {
            call_id,
            started_at: Instant::now(),
            started_at_unix: unix_now(),
            opened_at: None,
            connect_duration: None,
            frames_sent: 0,
            frames_muted: 0,
            chunks_scheduled: 0,
            chunks_dropped: 0,
            interruptions: 0,
            tool_calls: 0,
        }
    }

    fn to_metrics(&self, success: bool, error_message: Option<String>) -> CallMetrics {
        CallMetrics {
            call_id: self.call_id.to_string(),
            started_at: self.started_at_unix,
            connect_ms: self
                .connect_duration
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            talk_ms: self
                .opened_at
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0),
            frames_sent: self.frames_sent,
            frames_muted: self.frames_muted,
            chunks_scheduled: self.chunks_scheduled,
            chunks_dropped: self.chunks_dropped,
            interruptions: self.interruptions,
            tool_calls: self.tool_calls,
            success,
            error_message,
        }
    }
}

/// Collects and stores metrics for calls
pub struct MetricsCollector {
    /// History of finished calls (newest first)
    history: VecDeque<CallMetrics>,
    /// History of errors (newest first)
    errors: VecDeque<ErrorRecord>,
    current_call: Option<CallInProgress>,
    total_calls: u64,
    successful_calls: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_CALL_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current_call: None,
            total_calls: 0,
            successful_calls: 0,
        }
    }

    /// Start tracking a new call
    ///
    /// An unfinished previous call is recorded as failed.
    pub fn start_call(&mut self, call_id: Uuid) {
        if let Some(old) = self.current_call.take() {
            log::warn!(
                "Metrics: discarding in-progress call {} to start call {}",
                old.call_id,
                call_id
            );
            let metrics = old.to_metrics(false, Some("Discarded: new call started".to_string()));
            self.add_to_history(metrics);
        }

        log::debug!("Metrics: starting call {}", call_id);
        self.current_call = Some(CallInProgress::new(call_id));
        self.total_calls += 1;
    }

    fn current(&mut self, call_id: Uuid) -> Option<&mut CallInProgress> {
        self.current_call.as_mut().filter(|c| c.call_id == call_id)
    }

    /// The stream for `call_id` opened
    pub fn call_opened(&mut self, call_id: Uuid) {
        if let Some(call) = self.current(call_id) {
            let now = Instant::now();
            call.connect_duration = Some(now.duration_since(call.started_at));
            call.opened_at = Some(now);
            log::info!(
                "Metrics: call {} connected in {:?}",
                call_id,
                call.connect_duration.unwrap_or_default()
            );
        }
    }

    pub fn chunk_scheduled(&mut self, call_id: Uuid) {
        if let Some(call) = self.current(call_id) {
            call.chunks_scheduled += 1;
        }
    }

    pub fn chunk_dropped(&mut self, call_id: Uuid) {
        if let Some(call) = self.current(call_id) {
            call.chunks_dropped += 1;
        }
    }

    pub fn interruption(&mut self, call_id: Uuid) {
        if let Some(call) = self.current(call_id) {
            call.interruptions += 1;
        }
    }

    pub fn tool_call(&mut self, call_id: Uuid) {
        if let Some(call) = self.current(call_id) {
            call.tool_calls += 1;
        }
    }

    /// Final capture counters for the call
    pub fn capture_totals(&mut self, call_id: Uuid, frames_sent: u64, frames_muted: u64) {
        if let Some(call) = self.current(call_id) {
            call.frames_sent = frames_sent;
            call.frames_muted = frames_muted;
        }
    }

    /// Mark the call as ended normally
    pub fn call_ended(&mut self, call_id: Uuid) {
        if self.current(call_id).is_none() {
            return;
        }
        if let Some(call) = self.current_call.take() {
            let metrics = call.to_metrics(true, None);
            log::info!(
                "Metrics: call {} ended - talk {}ms, {} frames sent ({} muted), {} chunks played, {} interruptions, {} tool calls",
                metrics.call_id,
                metrics.talk_ms,
                metrics.frames_sent,
                metrics.frames_muted,
                metrics.chunks_scheduled,
                metrics.interruptions,
                metrics.tool_calls
            );
            self.add_to_history(metrics);
            self.successful_calls += 1;
        }
    }

    /// Mark the call as failed with an error message
    pub fn call_failed(&mut self, call_id: Uuid, error: String) {
        if self.current(call_id).is_some() {
            if let Some(call) = self.current_call.take() {
                let metrics = call.to_metrics(false, Some(error.clone()));
                log::warn!(
                    "Metrics: call {} failed after {}ms - {}",
                    metrics.call_id,
                    metrics.connect_ms + metrics.talk_ms,
                    error
                );
                self.add_to_history(metrics);
            }
        }

        self.record_error("call".to_string(), error, Some(call_id.to_string()));
    }

    /// Record an error (not necessarily tied to a call)
    pub fn record_error(&mut self, error_type: String, message: String, call_id: Option<String>) {
        let error = ErrorRecord {
            timestamp: unix_now(),
            error_type,
            message,
            call_id,
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let opened: Vec<_> = self.history.iter().filter(|c| c.connect_ms > 0).collect();
        let avg_connect_ms = if opened.is_empty() {
            0
        } else {
            opened.iter().map(|c| c.connect_ms).sum::<u64>() / opened.len() as u64
        };

        MetricsSummary {
            total_calls: self.total_calls,
            successful_calls: self.successful_calls,
            failed_calls: self.total_calls.saturating_sub(self.successful_calls),
            avg_connect_ms,
            last_error: self.errors.front().cloned(),
        }
    }

    /// Finished calls (newest first)
    pub fn get_history(&self) -> Vec<CallMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Errors (newest first)
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    fn add_to_history(&mut self, metrics: CallMetrics) {
        self.history.push_front(metrics);
        while self.history.len() > MAX_CALL_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_progress(collector: &MetricsCollector) -> Option<Uuid> {
        collector.current_call.as_ref().map(|c| c.call_id)
    }

    #[test]
    fn test_new_collector_is_empty() {
        let collector = MetricsCollector::new();
        let summary = collector.get_summary();

        assert_eq!(summary.total_calls, 0);
        assert_eq!(summary.failed_calls, 0);
        assert!(collector.get_history().is_empty());
        assert!(collector.get_errors().is_empty());
    }

    #[test]
    fn test_successful_call_tracking() {
        let mut collector = MetricsCollector::new();
        let id = Uuid::new_v4();

        collector.start_call(id);
        assert_eq!(in_progress(&collector), Some(id));
        std::thread::sleep(Duration::from_millis(5));
        collector.call_opened(id);
        collector.chunk_scheduled(id);
        collector.chunk_scheduled(id);
        collector.chunk_dropped(id);
        collector.interruption(id);
        collector.tool_call(id);
        collector.capture_totals(id, 12, 3);
        collector.call_ended(id);

        assert_eq!(in_progress(&collector), None);
        let history = collector.get_history();
        assert_eq!(history.len(), 1);
        let call = &history[0];
        assert!(call.success);
        assert!(call.connect_ms >= 5);
        assert_eq!(call.chunks_scheduled, 2);
        assert_eq!(call.chunks_dropped, 1);
        assert_eq!(call.interruptions, 1);
        assert_eq!(call.tool_calls, 1);
        assert_eq!(call.frames_sent, 12);
        assert_eq!(call.frames_muted, 3);

        let summary = collector.get_summary();
        assert_eq!(summary.successful_calls, 1);
        assert!(summary.avg_connect_ms >= 5);
    }

    #[test]
    fn test_failed_call_records_error() {
        let mut collector = MetricsCollector::new();
        let id = Uuid::new_v4();

        collector.start_call(id);
        collector.call_failed(id, "Connection refused".into());

        let summary = collector.get_summary();
        assert_eq!(summary.total_calls, 1);
        assert_eq!(summary.failed_calls, 1);
        let err = summary.last_error.unwrap();
        assert_eq!(err.message, "Connection refused");
        assert_eq!(err.call_id, Some(id.to_string()));
        assert!(!collector.get_history()[0].success);
    }

    #[test]
    fn test_updates_for_other_calls_are_ignored() {
        let mut collector = MetricsCollector::new();
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();

        collector.start_call(id);
        collector.chunk_scheduled(other);
        collector.call_ended(other);

        assert_eq!(in_progress(&collector), Some(id));
        assert!(collector.get_history().is_empty());
    }

    #[test]
    fn test_starting_over_unfinished_call_discards_it() {
        let mut collector = MetricsCollector::new();
        collector.start_call(Uuid::new_v4());
        collector.start_call(Uuid::new_v4());

        let history = collector.get_history();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert_eq!(collector.get_summary().total_calls, 2);
    }

    #[test]
    fn test_error_history_is_bounded() {
        let mut collector = MetricsCollector::new();
        for i in 0..(MAX_ERROR_HISTORY + 5) {
            collector.record_error("audio".into(), format!("error {}", i), None);
        }
        let errors = collector.get_errors();
        assert_eq!(errors.len(), MAX_ERROR_HISTORY);
        assert_eq!(errors[0].message, format!("error {}", MAX_ERROR_HISTORY + 4));
    }
}
