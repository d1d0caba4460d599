//! Active-call registry. One [`CallOrchestrator`] per call id; lookups are
//! lock-free reads on a [`DashMap`].

use crate::orchestrator::CallOrchestrator;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Process-wide map of live calls.
#[derive(Default)]
pub struct CallRegistry {
    calls: DashMap<String, Arc<CallOrchestrator>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call. Replaces (and returns) any previous orchestrator
    /// registered under the same id.
    pub fn insert(&self, call_id: impl Into<String>, call: Arc<CallOrchestrator>) -> Option<Arc<CallOrchestrator>> {
        let call_id = call_id.into();
        info!(call_id = %call_id, "call registered");
        self.calls.insert(call_id, call)
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<CallOrchestrator>> {
        self.calls.get(call_id).map(|e| e.value().clone())
    }

    /// Remove a call from the registry. Does not stop it.
    pub fn remove(&self, call_id: &str) -> Option<Arc<CallOrchestrator>> {
        let removed = self.calls.remove(call_id).map(|(_, v)| v);
        if removed.is_some() {
            info!(call_id = %call_id, "call unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Ids of all live calls, in no particular order.
    pub fn call_ids(&self) -> Vec<String> {
        self.calls.iter().map(|e| e.key().clone()).collect()
    }

    /// Stop every registered call and clear the registry.
    pub async fn stop_all(&self) {
        let ids = self.call_ids();
        for id in ids {
            if let Some(call) = self.remove(&id) {
                call.stop().await;
            }
        }
    }
}
