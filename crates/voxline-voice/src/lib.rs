//! # Voxline Voice - real-time call turn orchestration
//!
//! The audio-clocked half of the pipeline: per-call orchestration of
//! streaming transcription, sentence-by-sentence reply synthesis, ambient
//! noise mixing, and barge-in interruption.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Call Orchestrator                       │
//! │  ┌─────────────┐   ┌─────────────┐   ┌──────────────────┐  │
//! │  │ Transcriber │ → │  Responder  │ → │ Sentence Segment │  │
//! │  │  (stream)   │   │ (LLM chat)  │   │  + Synthesizer   │  │
//! │  └─────────────┘   └─────────────┘   └──────────────────┘  │
//! │        ↓ SpeechStart                          ↓             │
//! │  ┌─────────────┐                     ┌──────────────────┐  │
//! │  │   Barge-in  │────── interrupt ──→ │  Noise Mixer +   │  │
//! │  │   handler   │                     │  Transport Sink  │  │
//! │  └─────────────┘                     └──────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod noise;
pub mod orchestrator;
pub mod registry;
pub mod segment;
pub mod sinks;
pub mod synthesizer;
pub mod transcriber;

pub use error::{CallError, CallResult};
pub use noise::{NoiseKind, NoiseMixer, NoiseProfile, LOOP_SAMPLE_RATE};
pub use orchestrator::{CallOrchestrator, CallState, OrchestratorConfig, ResponseMode};
pub use registry::CallRegistry;
pub use segment::SentenceSegmenter;
pub use sinks::{
    BroadcastSink, CallSummary, NullBroadcast, NullSummary, NullTransport, OnSpeak, Speaker,
    SummarySink, TranscriptEvent, TransportSink,
};
pub use synthesizer::{
    HttpSynthesizer, PlaceholderSynthesizer, SynthesisEvent, SynthesisStream, Synthesizer,
};
pub use transcriber::{
    AudioEncoding, ScriptedTranscriber, Transcriber, TranscriberEvent, TranscriberHandle,
    TranscriberStream,
};
