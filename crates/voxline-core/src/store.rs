//! Session store: durable KV with TTL behind a narrow `SessionBackend`
//! contract, fronted by an in-process fallback cache.
//!
//! The cache is written on every save so the latest state survives a store
//! outage. The first backend failure flips a fallback-mode flag for the
//! remaining process lifetime; after that every read and write goes to the
//! cache only, so a dead store costs one failed round trip total, not one per
//! call. A store outage is invisible to callers; only cross-process
//! durability is lost.

use crate::context::{
    CallMetadata, ConversationContext, Role, DEFAULT_SYSTEM_PROMPT,
};
use crate::error::{CoreError, CoreResult};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Sessions expire after an hour of inactivity unless refreshed by a save.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;

const SESSION_KEY_PREFIX: &str = "conversation:";

/// Backing store contract: string KV with TTL. The backing system owns
/// expiry; `keys` takes a `prefix*` glob.
pub trait SessionBackend: Send + Sync {
    fn get(&self, key: &str) -> CoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> CoreResult<()>;
    fn del(&self, key: &str) -> CoreResult<()>;
    fn keys(&self, pattern: &str) -> CoreResult<Vec<String>>;
}

/// Envelope persisted per key so sled can enforce TTL on read.
#[derive(Serialize, Deserialize)]
struct TtlEnvelope {
    expires_at_ms: i64,
    value: String,
}

impl TtlEnvelope {
    fn expired(&self) -> bool {
        Utc::now().timestamp_millis() >= self.expires_at_ms
    }
}

/// Sled-backed `SessionBackend`. Values are wrapped in a TTL envelope;
/// expired entries read as absent and are purged on sight.
#[derive(Debug)]
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    /// Open or create the on-disk store. A path that cannot be opened, held
    /// by another process or not a sled directory, means no durable store at
    /// all rather than a failed operation against a live one.
    pub fn open_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let db = sled::open(&path).map_err(|e| {
            CoreError::StoreUnavailable(format!(
                "cannot open session store at {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self { db })
    }

    /// In-memory sled instance for tests and demos.
    pub fn temporary() -> CoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl SessionBackend for SledBackend {
    fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let Some(raw) = self.db.get(key.as_bytes())? else {
            return Ok(None);
        };
        let envelope: TtlEnvelope = serde_json::from_slice(&raw)?;
        if envelope.expired() {
            self.db.remove(key.as_bytes())?;
            return Ok(None);
        }
        Ok(Some(envelope.value))
    }

    fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> CoreResult<()> {
        let envelope = TtlEnvelope {
            expires_at_ms: Utc::now().timestamp_millis() + (ttl_seconds as i64) * 1000,
            value: value.to_string(),
        };
        self.db
            .insert(key.as_bytes(), serde_json::to_vec(&envelope)?)?;
        Ok(())
    }

    fn del(&self, key: &str) -> CoreResult<()> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    fn keys(&self, pattern: &str) -> CoreResult<Vec<String>> {
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, raw) = item?;
            let key = String::from_utf8_lossy(&key).to_string();
            match serde_json::from_slice::<TtlEnvelope>(&raw) {
                Ok(envelope) if envelope.expired() => {
                    self.db.remove(key.as_bytes())?;
                }
                Ok(_) => out.push(key),
                Err(_) => out.push(key),
            }
        }
        Ok(out)
    }
}

/// Durable session state with degrade-to-cache behavior.
pub struct SessionStore {
    backend: Box<dyn SessionBackend>,
    cache: DashMap<String, ConversationContext>,
    fallback_mode: AtomicBool,
    ttl_seconds: u64,
}

impl SessionStore {
    pub fn new(backend: Box<dyn SessionBackend>) -> Self {
        Self::with_ttl(backend, DEFAULT_SESSION_TTL_SECS)
    }

    pub fn with_ttl(backend: Box<dyn SessionBackend>, ttl_seconds: u64) -> Self {
        Self {
            backend,
            cache: DashMap::new(),
            fallback_mode: AtomicBool::new(false),
            ttl_seconds,
        }
    }

    fn session_key(call_id: &str) -> String {
        format!("{SESSION_KEY_PREFIX}{call_id}")
    }

    /// True once the store has failed and the cache has taken over.
    pub fn fallback_mode(&self) -> bool {
        self.fallback_mode.load(Ordering::SeqCst)
    }

    fn enter_fallback(&self, reason: &str) {
        if !self.fallback_mode.swap(true, Ordering::SeqCst) {
            warn!("session store unavailable, using in-process cache for the rest of this process: {reason}");
        }
    }

    /// Initialize and persist a new context. Fails only on catastrophic
    /// serialization errors.
    pub fn create_session(
        &self,
        call_id: &str,
        system_prompt: &str,
        metadata: CallMetadata,
    ) -> CoreResult<ConversationContext> {
        let context = ConversationContext::new(call_id, system_prompt, metadata);
        self.save_context(call_id, &context)?;
        info!("created conversation session {call_id}");
        Ok(context)
    }

    /// Read a context: backend first, cache on miss or failure. The first
    /// backend failure trips fallback mode permanently.
    pub fn get_context(&self, call_id: &str) -> Option<ConversationContext> {
        if self.fallback_mode() {
            return self.cache.get(call_id).map(|c| c.clone());
        }

        match self.backend.get(&Self::session_key(call_id)) {
            Ok(Some(raw)) => match serde_json::from_str::<ConversationContext>(&raw) {
                Ok(context) => {
                    self.cache.insert(call_id.to_string(), context.clone());
                    Some(context)
                }
                Err(e) => {
                    self.enter_fallback(&format!("corrupt context for {call_id}: {e}"));
                    self.cache.get(call_id).map(|c| c.clone())
                }
            },
            Ok(None) => self.cache.get(call_id).map(|c| c.clone()),
            Err(e) => {
                self.enter_fallback(&e.to_string());
                self.cache.get(call_id).map(|c| c.clone())
            }
        }
    }

    /// Persist a context. The cache is written first so the latest state is
    /// never lost even when the store write fails.
    pub fn save_context(&self, call_id: &str, context: &ConversationContext) -> CoreResult<()> {
        self.cache.insert(call_id.to_string(), context.clone());

        if self.fallback_mode() {
            return Ok(());
        }

        let raw = serde_json::to_string(context)?;
        if let Err(e) = self
            .backend
            .set(&Self::session_key(call_id), &raw, self.ttl_seconds)
        {
            self.enter_fallback(&e.to_string());
        }
        Ok(())
    }

    /// Append a message. Missing contexts are synthesized on the fly with a
    /// default system prompt; this is documented recovery behavior, not an
    /// error path.
    pub fn add_message(&self, call_id: &str, role: Role, content: &str) -> CoreResult<()> {
        let mut context = match self.get_context(call_id) {
            Some(ctx) => ctx,
            None => {
                warn!("no conversation context for {call_id}, synthesizing a minimal one");
                ConversationContext::new(call_id, DEFAULT_SYSTEM_PROMPT, CallMetadata::default())
            }
        };
        context.push_message(role, content);
        self.save_context(call_id, &context)
    }

    /// Ordered message history, empty when the session is unknown.
    pub fn get_history(&self, call_id: &str) -> Vec<crate::context::Message> {
        self.get_context(call_id)
            .map(|c| c.messages)
            .unwrap_or_default()
    }

    /// Merge free-form keys into the session's metadata bag.
    pub fn update_metadata(
        &self,
        call_id: &str,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> CoreResult<()> {
        let Some(mut context) = self.get_context(call_id) else {
            warn!("no conversation context for {call_id}, metadata update dropped");
            return Ok(());
        };
        context.metadata.merge(patch);
        self.save_context(call_id, &context)
    }

    /// Remove the session from both cache and store, returning the final
    /// context for downstream summarization.
    pub fn end_session(&self, call_id: &str) -> Option<ConversationContext> {
        let context = self.get_context(call_id);
        self.cache.remove(call_id);

        if !self.fallback_mode() {
            if let Err(e) = self.backend.del(&Self::session_key(call_id)) {
                self.enter_fallback(&e.to_string());
            }
        }

        if context.is_some() {
            info!("ended conversation session {call_id}");
        }
        context
    }

    /// Number of live sessions. Counted from the store when healthy, the
    /// cache otherwise.
    pub fn get_active_sessions_count(&self) -> usize {
        if self.fallback_mode() {
            return self.cache.len();
        }
        match self.backend.keys(&format!("{SESSION_KEY_PREFIX}*")) {
            Ok(keys) => keys.len(),
            Err(e) => {
                self.enter_fallback(&e.to_string());
                self.cache.len()
            }
        }
    }

    /// Advisory sweep. Correctness relies on backend TTL; this just walks the
    /// key space so TTL-aware backends can purge expired entries early.
    pub fn cleanup(&self) {
        if self.fallback_mode() {
            debug!("cleanup skipped: store in fallback mode");
            return;
        }
        match self.backend.keys(&format!("{SESSION_KEY_PREFIX}*")) {
            Ok(keys) => debug!("session cleanup complete, {} live sessions", keys.len()),
            Err(e) => self.enter_fallback(&e.to_string()),
        }
    }
}
