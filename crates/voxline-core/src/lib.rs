//! voxline-core: conversation state, session store, and responder bridge.
//!
//! Holds everything the real-time pipeline needs that is not clocked by audio:
//! the per-call `ConversationContext` (bounded message history), the
//! `SessionStore` (durable KV with TTL, fronted by an in-process fallback
//! cache that takes over for the rest of the process lifetime once the store
//! fails), and the `Responder` capability (OpenAI-compatible chat bridge with
//! blocking and token-streamed modes).

mod context;
mod error;
mod responder;
mod store;

pub use context::{
    create_system_prompt, CallMetadata, CallType, ConversationContext, Message, Role,
    DEFAULT_GREETING, DEFAULT_SYSTEM_PROMPT, FALLBACK_UTTERANCE, MAX_MESSAGES,
};
pub use error::{CoreError, CoreResult};
pub use responder::{ChatBridge, Responder, ScriptedResponder, RESPONDER_HISTORY_WINDOW};
pub use store::{SessionBackend, SessionStore, SledBackend, DEFAULT_SESSION_TTL_SECS};
