//! **Transcriber** - streaming speech-to-text contract consumed by the
//! orchestrator.
//!
//! A provider implementation opens a live stream and pushes events through a
//! channel: interim fragments for UI feedback, final transcripts that drive a
//! turn, and `SpeechStart` for barge-in detection. The core never implements
//! recognition itself.

use crate::error::{CallError, CallResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;
use voxline_core::CallType;

/// Audio encoding of the inbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// 8-bit mu-law, telephony legs.
    Mulaw,
    /// 16-bit little-endian PCM, browser capture.
    Linear16,
}

impl AudioEncoding {
    /// Encoding and sample rate appropriate to the call's transport.
    pub fn for_call_type(call_type: CallType) -> (Self, u32) {
        match call_type {
            CallType::Phone => (AudioEncoding::Mulaw, 8000),
            CallType::Browser => (AudioEncoding::Linear16, 16000),
        }
    }
}

/// Events emitted by a live transcription stream.
#[derive(Debug, Clone)]
pub enum TranscriberEvent {
    /// Unstable fragment, UI feedback only.
    Interim { text: String, confidence: f32 },
    /// Stable transcript for one utterance; drives a conversation turn.
    Final { text: String, confidence: f32 },
    /// Voice activity detected; barge-in when a reply is in flight.
    SpeechStart,
    Error(String),
    Closed,
}

/// Live stream returned by `Transcriber::start_stream`: the event receiver
/// plus a handle for pushing caller audio.
pub struct TranscriberStream {
    pub events: mpsc::UnboundedReceiver<TranscriberEvent>,
    pub handle: Box<dyn TranscriberHandle>,
}

/// Audio-ingress side of a live stream.
pub trait TranscriberHandle: Send + Sync {
    fn send_audio(&self, audio: &[u8]) -> CallResult<()>;
    fn close(&self);
}

/// Streaming transcription capability.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn start_stream(
        &self,
        encoding: AudioEncoding,
        sample_rate: u32,
    ) -> CallResult<TranscriberStream>;
}

/// Scripted transcriber for tests and demos: events are injected by the test
/// driver instead of a recognition provider, and forwarded audio is counted.
pub struct ScriptedTranscriber {
    tx: Mutex<Option<mpsc::UnboundedSender<TranscriberEvent>>>,
    audio_bytes: Arc<AtomicUsize>,
    fail_on_start: bool,
}

impl ScriptedTranscriber {
    pub fn new() -> Self {
        Self {
            tx: Mutex::new(None),
            audio_bytes: Arc::new(AtomicUsize::new(0)),
            fail_on_start: false,
        }
    }

    /// Transcriber whose stream cannot be opened, for start-failure tests.
    pub fn failing() -> Self {
        Self {
            fail_on_start: true,
            ..Self::new()
        }
    }

    /// Inject an event into the live stream. Returns false when no stream is
    /// open or the receiver is gone.
    pub fn emit(&self, event: TranscriberEvent) -> bool {
        let Ok(guard) = self.tx.lock() else {
            return false;
        };
        match guard.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Total bytes forwarded through `send_audio`.
    pub fn audio_bytes_received(&self) -> usize {
        self.audio_bytes.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedTranscriber {
    fn default() -> Self {
        Self::new()
    }
}

struct ScriptedHandle {
    tx: mpsc::UnboundedSender<TranscriberEvent>,
    audio_bytes: Arc<AtomicUsize>,
}

impl TranscriberHandle for ScriptedHandle {
    fn send_audio(&self, audio: &[u8]) -> CallResult<()> {
        self.audio_bytes.fetch_add(audio.len(), Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        let _ = self.tx.send(TranscriberEvent::Closed);
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn start_stream(
        &self,
        encoding: AudioEncoding,
        sample_rate: u32,
    ) -> CallResult<TranscriberStream> {
        if self.fail_on_start {
            return Err(CallError::Transcription("scripted stream refused".into()));
        }
        debug!("scripted transcriber stream open ({encoding:?} @ {sample_rate} Hz)");
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self
            .tx
            .lock()
            .map_err(|e| CallError::Transcription(format!("stream lock poisoned: {e}")))?;
        *guard = Some(tx.clone());
        drop(guard);
        Ok(TranscriberStream {
            events: rx,
            handle: Box::new(ScriptedHandle {
                tx,
                audio_bytes: self.audio_bytes.clone(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_follows_call_type() {
        assert_eq!(
            AudioEncoding::for_call_type(CallType::Phone),
            (AudioEncoding::Mulaw, 8000)
        );
        assert_eq!(
            AudioEncoding::for_call_type(CallType::Browser),
            (AudioEncoding::Linear16, 16000)
        );
    }

    #[tokio::test]
    async fn scripted_stream_delivers_events_and_counts_audio() {
        let transcriber = ScriptedTranscriber::new();
        let mut stream = transcriber
            .start_stream(AudioEncoding::Linear16, 16000)
            .await
            .unwrap();

        stream.handle.send_audio(&[0u8; 320]).unwrap();
        assert_eq!(transcriber.audio_bytes_received(), 320);

        assert!(transcriber.emit(TranscriberEvent::SpeechStart));
        assert!(matches!(
            stream.events.recv().await,
            Some(TranscriberEvent::SpeechStart)
        ));

        stream.handle.close();
        assert!(matches!(
            stream.events.recv().await,
            Some(TranscriberEvent::Closed)
        ));
    }

    #[tokio::test]
    async fn failing_transcriber_refuses_to_open() {
        let transcriber = ScriptedTranscriber::failing();
        assert!(transcriber
            .start_stream(AudioEncoding::Mulaw, 8000)
            .await
            .is_err());
    }

    #[test]
    fn emit_without_stream_reports_false() {
        let transcriber = ScriptedTranscriber::new();
        assert!(!transcriber.emit(TranscriberEvent::SpeechStart));
    }
}
