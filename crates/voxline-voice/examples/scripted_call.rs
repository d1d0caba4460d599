//! Scripted Call Demo - a full call turn loop with no provider credentials.
//!
//! Drives the orchestrator with a scripted transcriber and responder so the
//! whole pipeline (session, segmentation, synthesis, noise mixing, barge-in)
//! can be watched from the terminal. Set `VOXLINE_LLM_API_KEY` and
//! `VOXLINE_TTS_API_KEY` (or `OPENAI_API_KEY`) and swap in `ChatBridge` /
//! `HttpSynthesizer` to run against live providers.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use voxline_core::{CallType, ScriptedResponder, SessionStore, SledBackend};
use voxline_voice::{
    CallOrchestrator, CallRegistry, NoiseKind, NoiseProfile, OrchestratorConfig,
    PlaceholderSynthesizer, ScriptedTranscriber, TranscriberEvent, TranscriptEvent,
    TransportSink,
};

struct LoggingTransport;

impl TransportSink for LoggingTransport {
    fn deliver_audio(&self, audio: Vec<u8>) {
        info!("→ transport: {} bytes of mixed audio", audio.len());
    }
    fn interrupted(&self) {
        info!("→ transport: flush, caller barged in");
    }
}

struct LoggingBroadcast;

impl voxline_voice::BroadcastSink for LoggingBroadcast {
    fn transcript(&self, event: TranscriptEvent) {
        info!("📝 {:?}: {}", event.speaker, event.text);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Scripted Call Demo - transcriber → responder → synthesizer → transport");

    let store = Arc::new(SessionStore::new(Box::new(SledBackend::temporary()?)));
    let transcriber = Arc::new(ScriptedTranscriber::new());

    let config = OrchestratorConfig::new("demo-call", CallType::Browser)
        .with_purpose("checking an order status")
        .with_noise(NoiseProfile::new(NoiseKind::Office, 25))
        .with_transport(Arc::new(LoggingTransport))
        .with_broadcast(Arc::new(LoggingBroadcast))
        .with_on_speak(Arc::new(|sentence: &str| {
            info!("🔊 speaking: {sentence}");
        }));

    let call = Arc::new(CallOrchestrator::new(
        config,
        store.clone(),
        transcriber.clone(),
        Arc::new(ScriptedResponder::new(vec![
            "Your order shipped yesterday. ",
            "It should arrive by Friday.",
        ])),
        Arc::new(PlaceholderSynthesizer::new()),
    ));

    let registry = CallRegistry::new();
    registry.insert("demo-call", call.clone());

    call.start().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("--- caller asks a question ---");
    transcriber.emit(TranscriberEvent::Final {
        text: "Where is my order?".into(),
        confidence: 0.96,
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    info!("--- caller barges in mid-reply ---");
    transcriber.emit(TranscriberEvent::Final {
        text: "Actually, one more thing.".into(),
        confidence: 0.94,
    });
    transcriber.emit(TranscriberEvent::SpeechStart);
    tokio::time::sleep(Duration::from_millis(300)).await;

    info!("history: {} messages", store.get_history("demo-call").len());
    registry.stop_all().await;
    Ok(())
}
