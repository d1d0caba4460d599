//! Call orchestrator - the per-call coordination layer.
//!
//! One orchestrator owns a single call end to end: it opens the transcription
//! stream, turns each final transcript into a conversation turn (generate,
//! segment into sentences, synthesize, mix ambient noise, deliver), and
//! handles barge-in when the caller talks over a reply in flight.
//!
//! Turn handling is spawned per final transcript so the event loop keeps
//! draining transcriber events while a reply is being produced. If it blocked
//! on the turn instead, `SpeechStart` could never interrupt anything.

use crate::error::{CallError, CallResult};
use crate::noise::{NoiseKind, NoiseMixer, NoiseProfile};
use crate::segment::SentenceSegmenter;
use crate::sinks::{
    BroadcastSink, CallSummary, NullBroadcast, NullSummary, NullTransport, OnSpeak, SummarySink,
    TranscriptEvent, TransportSink,
};
use crate::synthesizer::{SynthesisEvent, Synthesizer};
use crate::transcriber::{AudioEncoding, Transcriber, TranscriberEvent, TranscriberHandle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voxline_core::{
    create_system_prompt, CallMetadata, CallType, ConversationContext, Responder, Role,
    SessionStore, DEFAULT_GREETING, DEFAULT_SYSTEM_PROMPT, FALLBACK_UTTERANCE,
};

/// How replies are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    /// Stream tokens and synthesize sentence by sentence as they complete.
    #[default]
    Streaming,
    /// Wait for the full reply, then speak it in one piece.
    Blocking,
}

/// Observable lifecycle of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Created but not started.
    Idle,
    /// Live, waiting for caller speech.
    Listening,
    /// A reply is being generated or spoken.
    Responding,
    /// Stopped. Terminal.
    Ended,
}

/// Per-call configuration plus the outbound sinks. Sinks default to no-ops so
/// a call can be driven without any consumer attached.
pub struct OrchestratorConfig {
    pub call_id: String,
    pub call_type: CallType,
    pub response_mode: ResponseMode,
    pub noise: NoiseProfile,
    system_prompt: Option<String>,
    greeting: Option<String>,
    caller_id: Option<String>,
    purpose: Option<String>,
    transport: Arc<dyn TransportSink>,
    broadcast: Arc<dyn BroadcastSink>,
    summary: Arc<dyn SummarySink>,
    on_speak: Option<OnSpeak>,
}

impl OrchestratorConfig {
    pub fn new(call_id: impl Into<String>, call_type: CallType) -> Self {
        Self {
            call_id: call_id.into(),
            call_type,
            response_mode: ResponseMode::default(),
            noise: NoiseProfile::default(),
            system_prompt: None,
            greeting: None,
            caller_id: None,
            purpose: None,
            transport: Arc::new(NullTransport),
            broadcast: Arc::new(NullBroadcast),
            summary: Arc::new(NullSummary),
            on_speak: None,
        }
    }

    /// Explicit system prompt. When absent, one is derived from the call
    /// purpose, falling back to the generic assistant prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }

    pub fn with_caller_id(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }

    pub fn with_noise(mut self, noise: NoiseProfile) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_response_mode(mut self, mode: ResponseMode) -> Self {
        self.response_mode = mode;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn TransportSink>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_broadcast(mut self, broadcast: Arc<dyn BroadcastSink>) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn with_summary(mut self, summary: Arc<dyn SummarySink>) -> Self {
        self.summary = summary;
        self
    }

    /// Hook called with each sentence just before synthesis.
    pub fn with_on_speak(mut self, on_speak: OnSpeak) -> Self {
        self.on_speak = Some(on_speak);
        self
    }

    fn resolve_system_prompt(&self) -> String {
        match (&self.system_prompt, &self.purpose) {
            (Some(prompt), _) => prompt.clone(),
            (None, Some(purpose)) => create_system_prompt(purpose),
            (None, None) => DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

struct Inner {
    call_id: String,
    call_type: CallType,
    response_mode: ResponseMode,
    greeting: String,

    store: Arc<SessionStore>,
    transcriber: Arc<dyn Transcriber>,
    responder: Arc<dyn Responder>,
    synthesizer: Arc<dyn Synthesizer>,
    transport: Arc<dyn TransportSink>,
    broadcast: Arc<dyn BroadcastSink>,
    summary: Arc<dyn SummarySink>,
    on_speak: Option<OnSpeak>,
    mixer: Mutex<NoiseMixer>,

    started: AtomicBool,
    ended: AtomicBool,
    is_active: AtomicBool,
    is_responding: AtomicBool,
    /// Bumped when a reply turn begins. Each speaking task captures the value
    /// at its own start; a mismatch means a newer turn superseded it and its
    /// remaining sentences must not be spoken.
    turn_seq: AtomicU64,

    handle: Mutex<Option<Box<dyn TranscriberHandle>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    started_at: Mutex<Option<Instant>>,

    system_prompt: String,
    caller_id: Option<String>,
    purpose: Option<String>,
}

/// Coordination layer for one call.
pub struct CallOrchestrator {
    inner: Arc<Inner>,
}

impl CallOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<SessionStore>,
        transcriber: Arc<dyn Transcriber>,
        responder: Arc<dyn Responder>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        let system_prompt = config.resolve_system_prompt();
        Self {
            inner: Arc::new(Inner {
                call_id: config.call_id,
                call_type: config.call_type,
                response_mode: config.response_mode,
                greeting: config.greeting.unwrap_or_else(|| DEFAULT_GREETING.to_string()),
                store,
                transcriber,
                responder,
                synthesizer,
                transport: config.transport,
                broadcast: config.broadcast,
                summary: config.summary,
                on_speak: config.on_speak,
                mixer: Mutex::new(NoiseMixer::new(config.noise)),
                started: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                is_active: AtomicBool::new(false),
                is_responding: AtomicBool::new(false),
                turn_seq: AtomicU64::new(0),
                handle: Mutex::new(None),
                event_task: Mutex::new(None),
                started_at: Mutex::new(None),
                system_prompt,
                caller_id: config.caller_id,
                purpose: config.purpose,
            }),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.inner.call_id
    }

    pub fn state(&self) -> CallState {
        if self.inner.ended.load(Ordering::SeqCst) {
            CallState::Ended
        } else if !self.inner.is_active.load(Ordering::SeqCst) {
            CallState::Idle
        } else if self.inner.is_responding.load(Ordering::SeqCst) {
            CallState::Responding
        } else {
            CallState::Listening
        }
    }

    /// Bring the call live: create the session, open the transcription
    /// stream, start the event loop, and speak the greeting. Only a failure
    /// to open the transcription stream is fatal; session-store trouble
    /// degrades to the in-process cache on its own.
    pub async fn start(&self) -> CallResult<()> {
        if self.inner.ended.load(Ordering::SeqCst) {
            return Err(CallError::Transport("call already ended".into()));
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("call {} already started", self.inner.call_id);
            return Ok(());
        }
        info!("🎭 starting call {}", self.inner.call_id);
        *self.inner.started_at.lock().await = Some(Instant::now());

        let mut metadata = CallMetadata::new(self.inner.call_type);
        if let Some(caller) = &self.inner.caller_id {
            metadata = metadata.with_caller(caller.clone());
        }
        if let Some(purpose) = &self.inner.purpose {
            metadata = metadata.with_purpose(purpose.clone());
        }
        if let Err(e) =
            self.inner
                .store
                .create_session(&self.inner.call_id, &self.inner.system_prompt, metadata)
        {
            warn!("session create failed for {}: {e}", self.inner.call_id);
        }

        if let Err(e) = self.inner.synthesizer.connect().await {
            warn!("synthesizer connect failed, synthesis may degrade: {e}");
        }

        let (encoding, sample_rate) = AudioEncoding::for_call_type(self.inner.call_type);
        let stream = match self.inner.transcriber.start_stream(encoding, sample_rate).await {
            Ok(stream) => stream,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.inner.handle.lock().await = Some(stream.handle);
        self.inner.is_active.store(true, Ordering::SeqCst);

        let loop_inner = self.inner.clone();
        let task = tokio::spawn(run_event_loop(loop_inner, stream.events));
        *self.inner.event_task.lock().await = Some(task);

        // The greeting is recorded before any caller speech can be, so it is
        // always the first assistant message. Only the synthesis round trip
        // is deferred.
        if let Err(e) = self
            .inner
            .store
            .add_message(&self.inner.call_id, Role::Assistant, &self.inner.greeting)
        {
            warn!("failed to record greeting: {e}");
        }
        self.inner
            .broadcast
            .transcript(TranscriptEvent::ai(self.inner.greeting.clone()));

        // Claim the first turn before spawning so a caller transcript racing
        // in cannot end up superseded by the greeting.
        let turn = self.inner.turn_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.is_responding.store(true, Ordering::SeqCst);
        let greet_inner = self.inner.clone();
        tokio::spawn(async move {
            let greeting = greet_inner.greeting.clone();
            if let Some(cb) = &greet_inner.on_speak {
                cb(&greeting);
            }
            speak_sentence(&greet_inner, &greeting).await;
            if greet_inner.turn_seq.load(Ordering::SeqCst) == turn {
                greet_inner.is_responding.store(false, Ordering::SeqCst);
            }
        });

        info!("✅ call {} live ({encoding:?} @ {sample_rate} Hz)", self.inner.call_id);
        Ok(())
    }

    /// Forward caller audio into the transcription stream. Audio arriving
    /// before start or after stop is dropped.
    pub async fn process_audio(&self, audio: &[u8]) {
        if !self.inner.is_active.load(Ordering::SeqCst) {
            return;
        }
        let guard = self.inner.handle.lock().await;
        if let Some(handle) = guard.as_ref() {
            if let Err(e) = handle.send_audio(audio) {
                warn!("audio forward failed for {}: {e}", self.inner.call_id);
            }
        }
    }

    /// Adjust ambient noise mid-call. `None` leaves that axis unchanged.
    pub async fn update_noise(&self, kind: Option<NoiseKind>, level: Option<i32>) {
        self.inner.mixer.lock().await.update_config(kind, level);
    }

    pub async fn noise_config(&self) -> NoiseProfile {
        self.inner.mixer.lock().await.get_config()
    }

    /// Tear the call down. Idempotent; the first call closes the transcriber
    /// stream, ends the session, and emits the call summary.
    pub async fn stop(&self) {
        if self.inner.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("🛑 stopping call {}", self.inner.call_id);
        self.inner.is_active.store(false, Ordering::SeqCst);
        self.inner.is_responding.store(false, Ordering::SeqCst);

        if let Some(handle) = self.inner.handle.lock().await.take() {
            handle.close();
        }
        self.inner.synthesizer.close().await;
        if let Some(task) = self.inner.event_task.lock().await.take() {
            task.abort();
        }

        let context = self.inner.store.end_session(&self.inner.call_id);
        let duration_ms = self
            .inner
            .started_at
            .lock()
            .await
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        self.inner.summary.save_summary(CallSummary {
            call_id: self.inner.call_id.clone(),
            message_count: context.as_ref().map(|c| c.messages.len()).unwrap_or(0),
            duration_ms,
            last_message: context
                .as_ref()
                .and_then(|c| c.last_message())
                .map(|m| m.content.clone()),
        });
        info!("✅ call {} ended", self.inner.call_id);
    }
}

async fn run_event_loop(
    inner: Arc<Inner>,
    mut events: mpsc::UnboundedReceiver<TranscriberEvent>,
) {
    while let Some(event) = events.recv().await {
        if !inner.is_active.load(Ordering::SeqCst) {
            break;
        }
        match event {
            TranscriberEvent::Interim { text, confidence } => {
                debug!("interim ({confidence:.2}): {text}");
                inner.broadcast.interim(&text, confidence as f64);
            }
            TranscriberEvent::SpeechStart => handle_speech_start(&inner),
            TranscriberEvent::Final { text, confidence } => {
                if text.trim().is_empty() {
                    continue;
                }
                // Spawned so the loop keeps seeing SpeechStart during the turn.
                let turn_inner = inner.clone();
                tokio::spawn(async move {
                    handle_final(turn_inner, text, confidence).await;
                });
            }
            TranscriberEvent::Error(e) => {
                warn!("transcriber error on {}: {e}", inner.call_id);
            }
            TranscriberEvent::Closed => {
                info!("transcriber stream closed for {}", inner.call_id);
                break;
            }
        }
    }
}

/// Barge-in: the caller started talking while a reply was in flight. The
/// swap guarantees exactly one interruption signal per reply no matter how
/// many speech-start events arrive.
fn handle_speech_start(inner: &Inner) {
    if inner.is_responding.swap(false, Ordering::SeqCst) {
        info!("barge-in on {}, interrupting reply", inner.call_id);
        inner.transport.interrupted();
    }
}

/// One conversation turn: record the utterance, generate a reply, and feed
/// completed sentences to the speaking queue as they arrive.
async fn handle_final(inner: Arc<Inner>, text: String, confidence: f32) {
    let text = text.trim().to_string();
    info!("final ({confidence:.2}) on {}: {text}", inner.call_id);
    inner
        .broadcast
        .transcript(TranscriptEvent::human(text.clone(), Some(confidence as f64)));
    if let Err(e) = inner.store.add_message(&inner.call_id, Role::User, &text) {
        warn!("failed to record utterance: {e}");
    }

    let context = match inner.store.get_context(&inner.call_id) {
        Some(ctx) => ctx,
        None => {
            let mut ctx = ConversationContext::new(
                &inner.call_id,
                DEFAULT_SYSTEM_PROMPT,
                CallMetadata::new(inner.call_type),
            );
            ctx.push_message(Role::User, text.clone());
            ctx
        }
    };

    // Starting a new turn supersedes any previous one; its speaking task
    // sees the bumped sequence and drops whatever it had left.
    let turn = inner.turn_seq.fetch_add(1, Ordering::SeqCst) + 1;
    inner.is_responding.store(true, Ordering::SeqCst);

    let (sentence_tx, sentence_rx) = mpsc::unbounded_channel::<String>();
    let speaker = tokio::spawn(speak_queue(inner.clone(), turn, sentence_rx));

    let reply = match inner.response_mode {
        ResponseMode::Streaming => {
            let mut segmenter = SentenceSegmenter::new();
            let result = {
                let seg = &mut segmenter;
                let tx = &sentence_tx;
                let mut on_chunk = |chunk: &str| {
                    if let Some(sentence) = seg.push(chunk) {
                        let _ = tx.send(sentence);
                    }
                };
                inner
                    .responder
                    .generate_streaming(&context, &text, &mut on_chunk)
                    .await
            };
            // Tail without terminal punctuation still gets spoken.
            if result.is_ok() {
                if let Some(tail) = segmenter.flush() {
                    let _ = sentence_tx.send(tail);
                }
            }
            result
        }
        ResponseMode::Blocking => inner.responder.generate(&context, &text).await,
    };

    let reply_text = match reply {
        Ok(full) => {
            if inner.response_mode == ResponseMode::Blocking {
                let _ = sentence_tx.send(full.trim().to_string());
            }
            full.trim().to_string()
        }
        Err(e) => {
            warn!("reply generation failed on {}: {e}", inner.call_id);
            let _ = sentence_tx.send(FALLBACK_UTTERANCE.to_string());
            FALLBACK_UTTERANCE.to_string()
        }
    };
    drop(sentence_tx);
    if let Err(e) = speaker.await {
        warn!("speaker task failed on {}: {e}", inner.call_id);
    }

    // Clear the responding flag only if no newer turn has taken over since.
    if inner.turn_seq.load(Ordering::SeqCst) == turn {
        inner.is_responding.store(false, Ordering::SeqCst);
    }
    if inner.is_active.load(Ordering::SeqCst) && !reply_text.is_empty() {
        inner.broadcast.transcript(TranscriptEvent::ai(reply_text.clone()));
        if let Err(e) = inner
            .store
            .add_message(&inner.call_id, Role::Assistant, &reply_text)
        {
            warn!("failed to record reply: {e}");
        }
    }
}

/// Drain queued sentences in order. Sentences found after an interruption,
/// a newer turn, or stop are dropped; interruption granularity is the
/// sentence, a sentence whose synthesis already started plays out.
async fn speak_queue(inner: Arc<Inner>, turn: u64, mut rx: mpsc::UnboundedReceiver<String>) {
    let mut spoke_fallback = false;
    while let Some(sentence) = rx.recv().await {
        if !inner.is_active.load(Ordering::SeqCst)
            || !inner.is_responding.load(Ordering::SeqCst)
            || inner.turn_seq.load(Ordering::SeqCst) != turn
        {
            debug!("dropping queued sentence after interruption: {sentence}");
            continue;
        }
        if let Some(cb) = &inner.on_speak {
            cb(&sentence);
        }
        if !speak_sentence(&inner, &sentence).await && !spoke_fallback {
            spoke_fallback = true;
            speak_sentence(&inner, FALLBACK_UTTERANCE).await;
        }
    }
}

/// Synthesize one sentence and deliver mixed audio to the transport.
/// Returns false when synthesis could not be started or errored mid-stream.
async fn speak_sentence(inner: &Inner, sentence: &str) -> bool {
    let mut stream = match inner.synthesizer.synthesize(sentence).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("synthesis failed on {}: {e}", inner.call_id);
            return false;
        }
    };
    while let Some(event) = stream.recv().await {
        match event {
            SynthesisEvent::Audio(bytes) => {
                let mixed = inner.mixer.lock().await.mix_audio(&bytes);
                inner.transport.deliver_audio(mixed);
            }
            SynthesisEvent::Error(e) => {
                warn!("synthesis stream error on {}: {e}", inner.call_id);
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesizer::PlaceholderSynthesizer;
    use crate::transcriber::ScriptedTranscriber;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use voxline_core::{CoreResult, ScriptedResponder, SessionStore, SledBackend};

    #[derive(Default)]
    struct RecordingTransport {
        audio_chunks: AtomicUsize,
        interruptions: AtomicUsize,
    }

    impl TransportSink for RecordingTransport {
        fn deliver_audio(&self, _audio: Vec<u8>) {
            self.audio_chunks.fetch_add(1, Ordering::SeqCst);
        }
        fn interrupted(&self) {
            self.interruptions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingBroadcast {
        events: StdMutex<Vec<TranscriptEvent>>,
    }

    impl BroadcastSink for RecordingBroadcast {
        fn transcript(&self, event: TranscriptEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[derive(Default)]
    struct RecordingSummary {
        summaries: StdMutex<Vec<CallSummary>>,
    }

    impl SummarySink for RecordingSummary {
        fn save_summary(&self, summary: CallSummary) {
            self.summaries.lock().unwrap().push(summary);
        }
    }

    /// Responder that streams one sentence, then blocks until released. Keeps
    /// the reply in flight long enough for barge-in tests to be deterministic.
    struct GatedResponder {
        release: Arc<Semaphore>,
    }

    #[async_trait]
    impl Responder for GatedResponder {
        async fn generate(
            &self,
            _context: &ConversationContext,
            _utterance: &str,
        ) -> CoreResult<String> {
            let _permit = self.release.acquire().await;
            Ok("One moment please.".to_string())
        }

        async fn generate_streaming(
            &self,
            _context: &ConversationContext,
            _utterance: &str,
            on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> CoreResult<String> {
            on_chunk("One moment please.");
            let _permit = self.release.acquire().await;
            Ok("One moment please.".to_string())
        }
    }

    /// Responder whose first reply streams one sentence, stalls until
    /// released, then streams a trailing sentence. Later replies stream
    /// immediately, so a second turn can overtake the stalled first one.
    struct StalledFirstReplyResponder {
        release: Arc<Semaphore>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Responder for StalledFirstReplyResponder {
        async fn generate(
            &self,
            _context: &ConversationContext,
            _utterance: &str,
        ) -> CoreResult<String> {
            Ok("Fresh reply.".to_string())
        }

        async fn generate_streaming(
            &self,
            _context: &ConversationContext,
            _utterance: &str,
            on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> CoreResult<String> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                on_chunk("First half of the old reply.");
                let _permit = self.release.acquire().await;
                on_chunk(" Tail of the old reply.");
                Ok("First half of the old reply. Tail of the old reply.".to_string())
            } else {
                on_chunk("Fresh reply.");
                Ok("Fresh reply.".to_string())
            }
        }
    }

    /// Synthesizer that sleeps before yielding audio, keeping the greeting
    /// round trip in flight while the caller starts talking.
    struct SlowSynthesizer;

    #[async_trait]
    impl Synthesizer for SlowSynthesizer {
        async fn synthesize(&self, _text: &str) -> CallResult<crate::synthesizer::SynthesisStream> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(SynthesisEvent::Audio(vec![0u8; 320]));
            Ok(rx)
        }
    }

    fn store() -> Arc<SessionStore> {
        Arc::new(SessionStore::new(Box::new(SledBackend::temporary().unwrap())))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    struct TestCall {
        orchestrator: CallOrchestrator,
        transcriber: Arc<ScriptedTranscriber>,
        transport: Arc<RecordingTransport>,
        broadcast: Arc<RecordingBroadcast>,
        summary: Arc<RecordingSummary>,
        store: Arc<SessionStore>,
    }

    fn build_call(responder: Arc<dyn Responder>) -> TestCall {
        let transcriber = Arc::new(ScriptedTranscriber::new());
        let transport = Arc::new(RecordingTransport::default());
        let broadcast = Arc::new(RecordingBroadcast::default());
        let summary = Arc::new(RecordingSummary::default());
        let store = store();
        let config = OrchestratorConfig::new("call-1", CallType::Browser)
            .with_transport(transport.clone())
            .with_broadcast(broadcast.clone())
            .with_summary(summary.clone());
        let orchestrator = CallOrchestrator::new(
            config,
            store.clone(),
            transcriber.clone(),
            responder,
            Arc::new(PlaceholderSynthesizer::new()),
        );
        TestCall {
            orchestrator,
            transcriber,
            transport,
            broadcast,
            summary,
            store,
        }
    }

    #[tokio::test]
    async fn greeting_is_spoken_and_recorded() {
        let call = build_call(Arc::new(ScriptedResponder::new(vec!["Hi."])));
        call.orchestrator.start().await.unwrap();

        wait_until(|| call.transport.audio_chunks.load(Ordering::SeqCst) >= 1).await;
        wait_until(|| !call.store.get_history("call-1").is_empty()).await;

        let history = call.store.get_history("call-1");
        assert_eq!(history[0].role, Role::Assistant);
        assert_eq!(history[0].content, DEFAULT_GREETING);

        let events = call.broadcast.events.lock().unwrap();
        assert_eq!(events[0].speaker, crate::sinks::Speaker::Ai);
    }

    #[tokio::test]
    async fn final_transcript_drives_a_full_turn() {
        let call = build_call(Arc::new(ScriptedResponder::new(vec![
            "Sure, ",
            "I can help with that.",
        ])));
        call.orchestrator.start().await.unwrap();
        wait_until(|| !call.store.get_history("call-1").is_empty()).await;

        assert!(call.transcriber.emit(TranscriberEvent::Final {
            text: "Can you help me?".into(),
            confidence: 0.95,
        }));

        // Greeting + user + reply.
        wait_until(|| call.store.get_history("call-1").len() == 3).await;
        let history = call.store.get_history("call-1");
        assert_eq!(history[1].role, Role::User);
        assert_eq!(history[1].content, "Can you help me?");
        assert_eq!(history[2].role, Role::Assistant);
        assert_eq!(history[2].content, "Sure, I can help with that.");

        let events = call.broadcast.events.lock().unwrap();
        let human: Vec<_> = events
            .iter()
            .filter(|e| e.speaker == crate::sinks::Speaker::Human)
            .collect();
        assert_eq!(human.len(), 1);
        assert_eq!(human[0].confidence, Some(0.95f32 as f64));
    }

    #[tokio::test]
    async fn speech_start_interrupts_exactly_once() {
        let release = Arc::new(Semaphore::new(0));
        let call = build_call(Arc::new(GatedResponder {
            release: release.clone(),
        }));
        call.orchestrator.start().await.unwrap();
        // Let the greeting finish so Responding below can only mean the turn.
        wait_until(|| call.orchestrator.state() == CallState::Listening).await;

        call.transcriber.emit(TranscriberEvent::Final {
            text: "Hello there.".into(),
            confidence: 0.9,
        });
        wait_until(|| call.orchestrator.state() == CallState::Responding).await;

        call.transcriber.emit(TranscriberEvent::SpeechStart);
        wait_until(|| call.transport.interruptions.load(Ordering::SeqCst) == 1).await;

        // A second burst of speech while already interrupted is a no-op.
        call.transcriber.emit(TranscriberEvent::SpeechStart);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(call.transport.interruptions.load(Ordering::SeqCst), 1);

        release.add_permits(1);
        wait_until(|| call.orchestrator.state() == CallState::Listening).await;
    }

    #[tokio::test]
    async fn interrupted_reply_never_bleeds_into_the_next_turn() {
        let release = Arc::new(Semaphore::new(0));
        let spoken: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));

        let transcriber = Arc::new(ScriptedTranscriber::new());
        let transport = Arc::new(RecordingTransport::default());
        let store = store();
        let hook_spoken = spoken.clone();
        let config = OrchestratorConfig::new("call-1", CallType::Browser)
            .with_transport(transport.clone())
            .with_on_speak(Arc::new(move |sentence: &str| {
                hook_spoken.lock().unwrap().push(sentence.to_string());
            }));
        let orchestrator = CallOrchestrator::new(
            config,
            store.clone(),
            transcriber.clone(),
            Arc::new(StalledFirstReplyResponder {
                release: release.clone(),
                calls: AtomicUsize::new(0),
            }),
            Arc::new(PlaceholderSynthesizer::new()),
        );
        orchestrator.start().await.unwrap();
        wait_until(|| orchestrator.state() == CallState::Listening).await;

        transcriber.emit(TranscriberEvent::Final {
            text: "Tell me a story.".into(),
            confidence: 0.9,
        });
        wait_until(|| {
            spoken
                .lock()
                .unwrap()
                .iter()
                .any(|s| s.contains("First half"))
        })
        .await;

        // Barge in while the first reply is stalled mid-stream, then start
        // a second turn that completes immediately.
        transcriber.emit(TranscriberEvent::SpeechStart);
        wait_until(|| transport.interruptions.load(Ordering::SeqCst) == 1).await;
        transcriber.emit(TranscriberEvent::Final {
            text: "Actually, never mind.".into(),
            confidence: 0.9,
        });
        wait_until(|| spoken.lock().unwrap().iter().any(|s| s == "Fresh reply.")).await;

        // Release the stalled reply. Its remaining sentence belongs to a
        // superseded turn and must not be spoken into the new one.
        release.add_permits(1);
        wait_until(|| store.get_history("call-1").len() == 5).await;
        assert!(spoken
            .lock()
            .unwrap()
            .iter()
            .all(|s| !s.contains("Tail of the old reply")));
        // The old turn finishing last must not flip the call back to
        // Listening-with-responding-cleared if a newer turn owns the flag.
        wait_until(|| orchestrator.state() == CallState::Listening).await;
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn greeting_is_first_even_when_the_caller_speaks_immediately() {
        let transcriber = Arc::new(ScriptedTranscriber::new());
        let store = store();
        let orchestrator = CallOrchestrator::new(
            OrchestratorConfig::new("call-1", CallType::Browser),
            store.clone(),
            transcriber.clone(),
            Arc::new(ScriptedResponder::new(vec!["Happy to help."])),
            Arc::new(SlowSynthesizer),
        );
        orchestrator.start().await.unwrap();

        // The caller talks before the greeting audio has been synthesized.
        transcriber.emit(TranscriberEvent::Final {
            text: "Hello?".into(),
            confidence: 0.9,
        });

        wait_until(|| store.get_history("call-1").len() >= 3).await;
        let history = store.get_history("call-1");
        assert_eq!(history[0].role, Role::Assistant);
        assert_eq!(history[0].content, DEFAULT_GREETING);
        assert_eq!(history[1].role, Role::User);
        assert_eq!(history[1].content, "Hello?");
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn blocking_mode_records_one_assistant_message() {
        let transcriber = Arc::new(ScriptedTranscriber::new());
        let store = store();
        let config = OrchestratorConfig::new("call-b", CallType::Browser)
            .with_response_mode(ResponseMode::Blocking);
        let orchestrator = CallOrchestrator::new(
            config,
            store.clone(),
            transcriber.clone(),
            Arc::new(ScriptedResponder::new(vec!["First. ", "Second."])),
            Arc::new(PlaceholderSynthesizer::new()),
        );
        orchestrator.start().await.unwrap();
        wait_until(|| !store.get_history("call-b").is_empty()).await;

        transcriber.emit(TranscriberEvent::Final {
            text: "Go ahead.".into(),
            confidence: 0.9,
        });
        wait_until(|| store.get_history("call-b").len() == 3).await;
        let history = store.get_history("call-b");
        assert_eq!(history[2].role, Role::Assistant);
        assert_eq!(history[2].content, "First. Second.");
    }

    #[tokio::test]
    async fn interim_events_reach_the_broadcast_sink() {
        #[derive(Default)]
        struct InterimBroadcast {
            interims: StdMutex<Vec<String>>,
        }
        impl BroadcastSink for InterimBroadcast {
            fn transcript(&self, _event: TranscriptEvent) {}
            fn interim(&self, text: &str, _confidence: f64) {
                self.interims.lock().unwrap().push(text.to_string());
            }
        }

        let transcriber = Arc::new(ScriptedTranscriber::new());
        let sink = Arc::new(InterimBroadcast::default());
        let config = OrchestratorConfig::new("call-i", CallType::Browser)
            .with_broadcast(sink.clone());
        let orchestrator = CallOrchestrator::new(
            config,
            store(),
            transcriber.clone(),
            Arc::new(ScriptedResponder::new(vec!["Hi."])),
            Arc::new(PlaceholderSynthesizer::new()),
        );
        orchestrator.start().await.unwrap();

        transcriber.emit(TranscriberEvent::Interim {
            text: "hel".into(),
            confidence: 0.4,
        });
        wait_until(|| !sink.interims.lock().unwrap().is_empty()).await;
        assert_eq!(sink.interims.lock().unwrap()[0], "hel");
        // Interims drive no turn; the call stays out of Responding.
        wait_until(|| orchestrator.state() == CallState::Listening).await;
    }

    #[tokio::test]
    async fn responder_failure_speaks_fallback() {
        let call = build_call(Arc::new(ScriptedResponder::failing()));
        call.orchestrator.start().await.unwrap();
        wait_until(|| !call.store.get_history("call-1").is_empty()).await;
        let after_greeting = call.transport.audio_chunks.load(Ordering::SeqCst);

        call.transcriber.emit(TranscriberEvent::Final {
            text: "Anyone there?".into(),
            confidence: 0.8,
        });
        wait_until(|| call.store.get_history("call-1").len() == 3).await;

        let history = call.store.get_history("call-1");
        assert_eq!(history[2].content, FALLBACK_UTTERANCE);
        assert!(call.transport.audio_chunks.load(Ordering::SeqCst) > after_greeting);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_saves_one_summary() {
        let call = build_call(Arc::new(ScriptedResponder::new(vec!["Bye."])));
        call.orchestrator.start().await.unwrap();
        wait_until(|| !call.store.get_history("call-1").is_empty()).await;

        call.orchestrator.stop().await;
        call.orchestrator.stop().await;

        assert_eq!(call.orchestrator.state(), CallState::Ended);
        let summaries = call.summary.summaries.lock().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].call_id, "call-1");
        assert_eq!(summaries[0].message_count, 1);
        assert_eq!(summaries[0].last_message.as_deref(), Some(DEFAULT_GREETING));
        drop(summaries);

        assert!(call.orchestrator.start().await.is_err());
        assert!(call.store.get_context("call-1").is_none());
    }

    #[tokio::test]
    async fn transcriber_failure_aborts_start() {
        let transcriber = Arc::new(ScriptedTranscriber::failing());
        let config = OrchestratorConfig::new("call-x", CallType::Phone);
        let orchestrator = CallOrchestrator::new(
            config,
            store(),
            transcriber,
            Arc::new(ScriptedResponder::new(vec!["Hi."])),
            Arc::new(PlaceholderSynthesizer::new()),
        );
        assert!(orchestrator.start().await.is_err());
        assert_eq!(orchestrator.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn audio_before_start_is_dropped() {
        let call = build_call(Arc::new(ScriptedResponder::new(vec!["Hi."])));
        call.orchestrator.process_audio(&[0u8; 160]).await;
        assert_eq!(call.transcriber.audio_bytes_received(), 0);

        call.orchestrator.start().await.unwrap();
        call.orchestrator.process_audio(&[0u8; 160]).await;
        assert_eq!(call.transcriber.audio_bytes_received(), 160);
    }

    #[tokio::test]
    async fn purpose_shapes_the_system_prompt() {
        let config = OrchestratorConfig::new("call-p", CallType::Phone)
            .with_purpose("booking a table");
        let store = store();
        let orchestrator = CallOrchestrator::new(
            config,
            store.clone(),
            Arc::new(ScriptedTranscriber::new()),
            Arc::new(ScriptedResponder::new(vec!["Hi."])),
            Arc::new(PlaceholderSynthesizer::new()),
        );
        orchestrator.start().await.unwrap();
        wait_until(|| store.get_context("call-p").is_some()).await;
        let ctx = store.get_context("call-p").unwrap();
        assert!(ctx.system_prompt.contains("booking a table"));
    }
}
