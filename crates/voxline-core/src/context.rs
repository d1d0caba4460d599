//! Per-call conversation state: messages, metadata, and the prompts the
//! assistant falls back to when nothing else is configured.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum messages kept per conversation; oldest entries are evicted FIFO.
pub const MAX_MESSAGES: usize = 20;

/// Spoken when `start()` is called without an explicit greeting.
pub const DEFAULT_GREETING: &str = "Hello! I'm an AI assistant. How can I help you today?";

/// Spoken when a single turn fails (responder or synthesizer error). The call
/// itself continues.
pub const FALLBACK_UTTERANCE: &str =
    "I apologize, I'm having trouble processing that. Could you please repeat?";

/// System prompt used when a context has to be synthesized on the fly.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn now(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// How the caller reached us. Decides the transcription encoding; never
/// inferred from id prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Telephony leg: mulaw at 8 kHz.
    #[default]
    Phone,
    /// Browser capture: linear16 PCM at 16 kHz.
    Browser,
}

/// Extensible metadata bag attached to a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMetadata {
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default)]
    pub call_type: CallType,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CallMetadata {
    pub fn new(call_type: CallType) -> Self {
        Self {
            start_time: Utc::now(),
            caller_id: None,
            purpose: None,
            call_type,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }

    /// Merge free-form keys into the bag, overwriting on collision.
    pub fn merge(&mut self, patch: serde_json::Map<String, serde_json::Value>) {
        for (k, v) in patch {
            self.extra.insert(k, v);
        }
    }
}

impl Default for CallMetadata {
    fn default() -> Self {
        Self::new(CallType::default())
    }
}

/// Conversation state for one active call. The live copy is exclusively owned
/// by the call's orchestrator; the session store holds the serialized source
/// of truth across process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub call_id: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub metadata: CallMetadata,
}

impl ConversationContext {
    pub fn new(
        call_id: impl Into<String>,
        system_prompt: impl Into<String>,
        metadata: CallMetadata,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            system_prompt: system_prompt.into(),
            messages: Vec::new(),
            metadata,
        }
    }

    /// Append a timestamped message, evicting the oldest past `MAX_MESSAGES`.
    pub fn push_message(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(Message::now(role, content));
        if self.messages.len() > MAX_MESSAGES {
            let overflow = self.messages.len() - MAX_MESSAGES;
            self.messages.drain(..overflow);
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Default system prompt for a voice call. Responses are spoken aloud, so the
/// model is steered toward short conversational sentences.
pub fn create_system_prompt(purpose: &str) -> String {
    format!(
        "You are a helpful AI assistant speaking with a customer over the phone.\n\
         \n\
         Guidelines:\n\
         - Be concise and natural in your responses\n\
         - Speak in short sentences (1-2 sentences at a time)\n\
         - Use a friendly, professional tone\n\
         - Ask clarifying questions when needed\n\
         - If you don't know something, admit it honestly\n\
         - Listen carefully and respond appropriately\n\
         - Avoid long explanations unless specifically asked\n\
         \n\
         Purpose: {purpose}\n\
         \n\
         Remember: You are having a voice conversation, so keep responses brief and conversational."
    )
}
