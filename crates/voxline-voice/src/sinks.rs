//! Outbound seams of a call: transport audio, transcript broadcast, and the
//! end-of-call summary. All sinks are fire-and-forget from the orchestrator's
//! point of view, so a slow consumer never stalls the audio path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Who produced a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Human,
    Ai,
}

/// One finalized transcript line, pushed to observers as the call progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Recognition confidence for human lines; `None` for AI lines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl TranscriptEvent {
    pub fn human(text: impl Into<String>, confidence: Option<f64>) -> Self {
        Self {
            speaker: Speaker::Human,
            text: text.into(),
            timestamp: Utc::now(),
            confidence,
        }
    }

    pub fn ai(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Ai,
            text: text.into(),
            timestamp: Utc::now(),
            confidence: None,
        }
    }
}

/// Snapshot persisted when a call ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSummary {
    pub call_id: String,
    pub message_count: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

/// Caller-facing audio path. `deliver_audio` hands off mixed output bytes;
/// `interrupted` tells the transport to flush anything it has buffered
/// because the human started talking over the AI.
pub trait TransportSink: Send + Sync {
    fn deliver_audio(&self, audio: Vec<u8>);
    fn interrupted(&self);
}

/// Observer path for live transcripts (dashboards, recordings).
pub trait BroadcastSink: Send + Sync {
    fn transcript(&self, event: TranscriptEvent);

    /// Unstable interim fragment, UI feedback only. Default: ignored.
    fn interim(&self, _text: &str, _confidence: f64) {}
}

/// Persistence path for the end-of-call record.
pub trait SummarySink: Send + Sync {
    fn save_summary(&self, summary: CallSummary);
}

/// Optional hook invoked with each sentence just before synthesis.
pub type OnSpeak = Arc<dyn Fn(&str) + Send + Sync>;

/// No-op transport for calls with no audio consumer attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransport;

impl TransportSink for NullTransport {
    fn deliver_audio(&self, _audio: Vec<u8>) {}
    fn interrupted(&self) {}
}

/// No-op broadcast sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBroadcast;

impl BroadcastSink for NullBroadcast {
    fn transcript(&self, _event: TranscriptEvent) {}
}

/// No-op summary sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSummary;

impl SummarySink for NullSummary {
    fn save_summary(&self, _summary: CallSummary) {}
}
