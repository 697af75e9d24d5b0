//! Latency and error tracking for dialogue exchanges.
//!
//! The streaming design exists to minimize the time between sending a turn
//! and hearing the first synthesized audio; this module keeps that number
//! observable. Samples and errors are retained in bounded histories
//! (newest first) for diagnostics.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::ClientError;
use crate::DialogueEvent;

/// Maximum number of latency samples to retain.
const MAX_SAMPLE_HISTORY: usize = 50;

/// Maximum number of errors to retain.
const MAX_ERROR_HISTORY: usize = 20;

/// One first-audio latency measurement.
#[derive(Debug, Clone, Serialize)]
pub struct LatencySample {
    /// Request stage the sample belongs to (`start_convo_stream`, `talk_stream`).
    pub stage: String,
    /// Elapsed time from request submission to the first audio payload.
    pub elapsed_ms: u64,
    pub at: DateTime<Utc>,
}

/// Record of a backend error.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub stage: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Bounded history of latency samples and errors.
#[derive(Debug, Default)]
pub struct LatencyRecorder {
    samples: VecDeque<LatencySample>,
    errors: VecDeque<ErrorRecord>,
}

impl LatencyRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_latency(&mut self, stage: &str, elapsed_ms: u64) {
        log::info!("First audio for {} after {}ms", stage, elapsed_ms);
        self.samples.push_front(LatencySample {
            stage: stage.to_string(),
            elapsed_ms,
            at: Utc::now(),
        });
        while self.samples.len() > MAX_SAMPLE_HISTORY {
            self.samples.pop_back();
        }
    }

    pub fn record_error(&mut self, stage: &str, message: &str) {
        self.errors.push_front(ErrorRecord {
            stage: stage.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        });
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    /// Average first-audio latency for one stage, if any samples exist.
    pub fn average_ms(&self, stage: &str) -> Option<u64> {
        let matching: Vec<u64> = self
            .samples
            .iter()
            .filter(|s| s.stage == stage)
            .map(|s| s.elapsed_ms)
            .collect();
        if matching.is_empty() {
            return None;
        }
        Some(matching.iter().sum::<u64>() / matching.len() as u64)
    }

    /// Latency samples, newest first.
    pub fn samples(&self) -> Vec<LatencySample> {
        self.samples.iter().cloned().collect()
    }

    /// Error history, newest first.
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.errors.front().cloned()
    }
}

/// Shared reporting handle: records into the [`LatencyRecorder`] and emits
/// the matching [`DialogueEvent`] in one call, so the two observable
/// channels can never drift apart.
#[derive(Clone)]
pub struct Reporter {
    events: mpsc::UnboundedSender<DialogueEvent>,
    recorder: Arc<Mutex<LatencyRecorder>>,
}

impl Reporter {
    pub fn new(
        events: mpsc::UnboundedSender<DialogueEvent>,
        recorder: Arc<Mutex<LatencyRecorder>>,
    ) -> Self {
        Self { events, recorder }
    }

    /// Emit an event; a dropped receiver is not an error.
    pub fn emit(&self, event: DialogueEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Dialogue event receiver dropped");
        }
    }

    /// Report a first-audio latency sample.
    pub fn latency(&self, stage: &str, elapsed_ms: u64) {
        if let Ok(mut recorder) = self.recorder.lock() {
            recorder.record_latency(stage, elapsed_ms);
        }
        self.emit(DialogueEvent::LatencySample {
            stage: stage.to_string(),
            elapsed_ms,
        });
    }

    /// Report a backend error tagged with its stage.
    pub fn backend_error(&self, stage: &str, error: &ClientError) {
        let message = error.to_string();
        log::warn!("Backend error at {}: {}", stage, message);
        if let Ok(mut recorder) = self.recorder.lock() {
            recorder.record_error(stage, &message);
        }
        self.emit(DialogueEvent::BackendError {
            stage: stage.to_string(),
            message,
        });
    }

    /// Report a backend-originated error message (SSE `error` events carry
    /// free text, not a `ClientError`).
    pub fn backend_message(&self, stage: &str, message: &str) {
        log::warn!("Backend reported error at {}: {}", stage, message);
        if let Ok(mut recorder) = self.recorder.lock() {
            recorder.record_error(stage, message);
        }
        self.emit(DialogueEvent::BackendError {
            stage: stage.to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_are_per_stage() {
        let mut recorder = LatencyRecorder::new();
        recorder.record_latency("talk_stream", 100);
        recorder.record_latency("talk_stream", 300);
        recorder.record_latency("start_convo_stream", 50);

        assert_eq!(recorder.average_ms("talk_stream"), Some(200));
        assert_eq!(recorder.average_ms("start_convo_stream"), Some(50));
        assert_eq!(recorder.average_ms("health"), None);
    }

    #[test]
    fn histories_are_bounded_newest_first() {
        let mut recorder = LatencyRecorder::new();
        for i in 0..(MAX_SAMPLE_HISTORY as u64 + 10) {
            recorder.record_latency("talk_stream", i);
        }
        let samples = recorder.samples();
        assert_eq!(samples.len(), MAX_SAMPLE_HISTORY);
        assert_eq!(samples[0].elapsed_ms, MAX_SAMPLE_HISTORY as u64 + 9);
    }

    #[test]
    fn reporter_mirrors_into_both_channels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Mutex::new(LatencyRecorder::new()));
        let reporter = Reporter::new(tx, recorder.clone());

        reporter.latency("talk_stream", 120);
        reporter.backend_error("talk", &ClientError::HttpStatus(500));

        match rx.try_recv().unwrap() {
            DialogueEvent::LatencySample { stage, elapsed_ms } => {
                assert_eq!(stage, "talk_stream");
                assert_eq!(elapsed_ms, 120);
            }
            other => panic!("expected LatencySample, got {:?}", other),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            DialogueEvent::BackendError { .. }
        ));

        let recorder = recorder.lock().unwrap();
        assert_eq!(recorder.samples().len(), 1);
        assert!(recorder.last_error().unwrap().message.contains("500"));
    }
}
