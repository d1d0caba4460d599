//! **Synthesizer** - text-to-speech contract: one `synthesize` call emits
//! audio chunks one or more times, then the stream closes.
//!
//! Connection pooling and per-request churn are implementation details behind
//! the trait; the orchestrator sees a stateless text-in/audio-out capability.

use crate::error::{CallError, CallResult};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Events on a synthesis stream. The stream closing means `done`.
#[derive(Debug, Clone)]
pub enum SynthesisEvent {
    Audio(Vec<u8>),
    Error(String),
}

/// Receiver side of one synthesis request.
pub type SynthesisStream = mpsc::UnboundedReceiver<SynthesisEvent>;

/// Speech-synthesis capability consumed by the orchestrator.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Establish any provider session. Default: nothing to do.
    async fn connect(&self) -> CallResult<()> {
        Ok(())
    }

    /// Synthesize one sentence. The returned stream yields audio chunks as
    /// they arrive and closes when synthesis is done.
    async fn synthesize(&self, text: &str) -> CallResult<SynthesisStream>;

    /// Tear down any provider session. Default: nothing to do.
    async fn close(&self) {}
}

const DEFAULT_TTS_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TTS_MODEL: &str = "tts-1";
const DEFAULT_TTS_VOICE: &str = "alloy";

/// Production synthesizer: OpenAI-compatible `/audio/speech` over HTTP.
/// Response bytes are re-emitted chunk by chunk as they stream in. Uses
/// `VOXLINE_TTS_API_URL`, `VOXLINE_TTS_API_KEY` (or `OPENAI_API_KEY`),
/// `VOXLINE_TTS_MODEL`, and `VOXLINE_TTS_VOICE`.
#[derive(Debug, Clone)]
pub struct HttpSynthesizer {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// TTS model: tts-1 (fast) or tts-1-hd (higher quality).
    pub model: String,
    /// Voice id (alloy, echo, fable, onyx, nova, shimmer, ...).
    pub voice: String,
    client: reqwest::Client,
}

impl HttpSynthesizer {
    /// Build from environment: VOXLINE_TTS_API_URL, VOXLINE_TTS_API_KEY (or
    /// OPENAI_API_KEY), VOXLINE_TTS_MODEL, VOXLINE_TTS_VOICE.
    pub fn from_env() -> CallResult<Self> {
        let base_url = std::env::var("VOXLINE_TTS_API_URL")
            .unwrap_or_else(|_| DEFAULT_TTS_API_URL.to_string());
        let api_key = std::env::var("VOXLINE_TTS_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                CallError::Config("synthesizer requires VOXLINE_TTS_API_KEY or OPENAI_API_KEY".into())
            })?;
        let model =
            std::env::var("VOXLINE_TTS_MODEL").unwrap_or_else(|_| DEFAULT_TTS_MODEL.to_string());
        let voice =
            std::env::var("VOXLINE_TTS_VOICE").unwrap_or_else(|_| DEFAULT_TTS_VOICE.to_string());
        Self::new(base_url, api_key, model, voice)
    }

    /// Create with explicit config (e.g. for tests or non-env wiring).
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> CallResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CallError::Synthesis(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: voice.into(),
            client,
        })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> CallResult<SynthesisStream> {
        let text = text.trim();
        let (tx, rx) = mpsc::unbounded_channel();
        if text.is_empty() {
            return Ok(rx);
        }

        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::Synthesis(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(CallError::Synthesis(format!("TTS API error {status}: {body}")));
        }

        // Forward body bytes as they arrive; the channel closing marks done.
        tokio::spawn(async move {
            let mut stream = res.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if !bytes.is_empty()
                            && tx.send(SynthesisEvent::Audio(bytes.to_vec())).is_err()
                        {
                            // Receiver dropped (interruption); stop pulling.
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("TTS stream error: {e}");
                        let _ = tx.send(SynthesisEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Placeholder synthesizer for tests and demos: emits one silent chunk per
/// request so the pipeline can be exercised without a provider.
#[derive(Debug, Clone)]
pub struct PlaceholderSynthesizer {
    chunk_bytes: usize,
}

impl PlaceholderSynthesizer {
    pub fn new() -> Self {
        Self { chunk_bytes: 320 }
    }

    pub fn with_chunk_bytes(chunk_bytes: usize) -> Self {
        Self { chunk_bytes }
    }
}

impl Default for PlaceholderSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Synthesizer for PlaceholderSynthesizer {
    async fn synthesize(&self, text: &str) -> CallResult<SynthesisStream> {
        debug!("placeholder synthesis: {} chars", text.len());
        let (tx, rx) = mpsc::unbounded_channel();
        if !text.trim().is_empty() {
            let _ = tx.send(SynthesisEvent::Audio(vec![0u8; self.chunk_bytes]));
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn placeholder_emits_one_chunk_then_done() {
        let synth = PlaceholderSynthesizer::with_chunk_bytes(8);
        let mut stream = synth.synthesize("Hello.").await.unwrap();
        match stream.recv().await {
            Some(SynthesisEvent::Audio(bytes)) => assert_eq!(bytes.len(), 8),
            other => panic!("expected audio, got {other:?}"),
        }
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn placeholder_skips_empty_text() {
        let synth = PlaceholderSynthesizer::new();
        let mut stream = synth.synthesize("   ").await.unwrap();
        assert!(stream.recv().await.is_none());
    }
}
