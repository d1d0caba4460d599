//! **Responder** - turn a conversation context plus a new utterance into
//! reply text, either all at once or token-streamed through a callback.
//!
//! `ChatBridge` is the production adapter for OpenAI-compatible chat APIs.
//! Replies are spoken aloud, so generation is tuned short (150 tokens).

use crate::context::{ConversationContext, Role};
use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Only the most recent conversation messages are sent to the model; the
/// 20-message store cap is a separate concern.
pub const RESPONDER_HISTORY_WINDOW: usize = 10;

const DEFAULT_LLM_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_MODEL: &str = "gpt-4-turbo-preview";

/// Reply-generation capability consumed by the orchestrator.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Generate a full reply in one shot.
    async fn generate(&self, context: &ConversationContext, utterance: &str)
        -> CoreResult<String>;

    /// Generate a reply, delivering incremental chunks through `on_chunk` as
    /// they arrive. Returns the full accumulated text.
    async fn generate_streaming(
        &self,
        context: &ConversationContext,
        utterance: &str,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> CoreResult<String>;
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageBody,
}

#[derive(Deserialize)]
struct ChatMessageBody {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Extract the text delta from one SSE `data:` payload, if any.
fn stream_delta(data: &str) -> Option<String> {
    let chunk: StreamChunk = serde_json::from_str(data).ok()?;
    chunk.choices.into_iter().next()?.delta.content
}

/// Production responder: OpenAI-compatible chat completions over HTTP.
/// Uses `VOXLINE_LLM_API_URL`, `VOXLINE_LLM_API_KEY` (or `OPENAI_API_KEY`),
/// and `VOXLINE_LLM_MODEL`.
#[derive(Debug, Clone)]
pub struct ChatBridge {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// Chat model id.
    pub model: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl ChatBridge {
    /// Build from environment: VOXLINE_LLM_API_URL, VOXLINE_LLM_API_KEY (or
    /// OPENAI_API_KEY), VOXLINE_LLM_MODEL.
    pub fn from_env() -> CoreResult<Self> {
        let base_url = std::env::var("VOXLINE_LLM_API_URL")
            .unwrap_or_else(|_| DEFAULT_LLM_API_URL.to_string());
        let api_key = std::env::var("VOXLINE_LLM_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                CoreError::Config("responder requires VOXLINE_LLM_API_KEY or OPENAI_API_KEY".into())
            })?;
        let model =
            std::env::var("VOXLINE_LLM_MODEL").unwrap_or_else(|_| DEFAULT_LLM_MODEL.to_string());
        Self::new(base_url, api_key, model)
    }

    /// Create with explicit config (e.g. for tests or non-env wiring).
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CoreError::Generation(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            // Keep replies concise for natural spoken conversation.
            max_tokens: 150,
            temperature: 0.7,
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, context: &ConversationContext, utterance: &str, stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: build_messages(context, utterance),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream,
        }
    }
}

/// System prompt plus the last `RESPONDER_HISTORY_WINDOW` conversation
/// messages plus the new utterance.
fn build_messages(context: &ConversationContext, utterance: &str) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage {
        role: Role::System.as_str(),
        content: context.system_prompt.clone(),
    }];
    let skip = context.messages.len().saturating_sub(RESPONDER_HISTORY_WINDOW);
    for m in context.messages.iter().skip(skip) {
        messages.push(ChatMessage {
            role: m.role.as_str(),
            content: m.content.clone(),
        });
    }
    messages.push(ChatMessage {
        role: Role::User.as_str(),
        content: utterance.to_string(),
    });
    messages
}

#[async_trait]
impl Responder for ChatBridge {
    async fn generate(
        &self,
        context: &ConversationContext,
        utterance: &str,
    ) -> CoreResult<String> {
        debug!("generating reply for {}", context.call_id);
        let res = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&self.request_body(context, utterance, false))
            .send()
            .await
            .map_err(|e| CoreError::Generation(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(CoreError::Generation(format!("chat API error {status}: {body}")));
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| CoreError::Generation(e.to_string()))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if text.is_empty() {
            return Err(CoreError::Generation("empty response from chat API".into()));
        }
        info!("reply generated for {} ({} chars)", context.call_id, text.len());
        Ok(text)
    }

    async fn generate_streaming(
        &self,
        context: &ConversationContext,
        utterance: &str,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> CoreResult<String> {
        let res = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&self.request_body(context, utterance, true))
            .send()
            .await
            .map_err(|e| CoreError::Generation(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(CoreError::Generation(format!("chat API error {status}: {body}")));
        }

        let mut stream = res.bytes_stream();
        let mut line_buf = String::new();
        let mut full = String::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| CoreError::Generation(e.to_string()))?;
            line_buf.push_str(&String::from_utf8_lossy(&bytes));
            // SSE frames can split anywhere; only consume complete lines.
            while let Some(pos) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=pos).collect();
                let line = line.trim();
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    continue;
                }
                if let Some(delta) = stream_delta(data) {
                    if !delta.is_empty() {
                        full.push_str(&delta);
                        on_chunk(&delta);
                    }
                }
            }
        }
        Ok(full)
    }
}

/// Scripted responder for tests and demos: replays fixed chunks.
#[derive(Debug, Default, Clone)]
pub struct ScriptedResponder {
    chunks: Vec<String>,
    fail: bool,
}

impl ScriptedResponder {
    pub fn new(chunks: Vec<&str>) -> Self {
        Self {
            chunks: chunks.into_iter().map(String::from).collect(),
            fail: false,
        }
    }

    /// Responder that fails every request, for fallback-path tests.
    pub fn failing() -> Self {
        Self {
            chunks: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl Responder for ScriptedResponder {
    async fn generate(
        &self,
        _context: &ConversationContext,
        _utterance: &str,
    ) -> CoreResult<String> {
        if self.fail {
            return Err(CoreError::Generation("scripted failure".into()));
        }
        Ok(self.chunks.concat())
    }

    async fn generate_streaming(
        &self,
        _context: &ConversationContext,
        _utterance: &str,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> CoreResult<String> {
        if self.fail {
            return Err(CoreError::Generation("scripted failure".into()));
        }
        for chunk in &self.chunks {
            on_chunk(chunk);
        }
        Ok(self.chunks.concat())
    }
}
