//! `test-support`-gated reference adapter: an in-process, in-memory
//! `SessionManager`/`SessionHandle` pair. Exists so this crate's own
//! integration tests (and any downstream crate wiring up the router for the
//! first time) can drive a real `axum::Router` without standing up a
//! database. Not part of the public API surface used in production — no
//! persistence, no cross-process visibility.

use crate::adapter::{
    DataAvailable, SessionCounters, SessionHandle, SessionManager, TerminationReason,
};
use crate::error::AdapterError;
use crate::message::Message;
use async_trait::async_trait;
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};

struct SessionState {
    sid: String,
    outbound: Mutex<Vec<Message>>,
    inbound: Mutex<Vec<Message>>,
    next_msg_id: AtomicU64,
    terminate_tx: broadcast::Sender<()>,
    data_tx: mpsc::UnboundedSender<DataAvailable>,
    // `SessionHandle::data_notifier` hands out ownership of the receiving
    // half but the trait method takes `&self`; std Mutex is enough since
    // the only operation is a synchronous `take()`.
    data_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<DataAvailable>>>,
}

#[derive(Clone)]
pub struct MemoryHandle(Arc<SessionState>);

#[async_trait]
impl SessionHandle for MemoryHandle {
    fn sid(&self) -> &str {
        &self.0.sid
    }

    fn terminate_notifier(&self) -> broadcast::Receiver<()> {
        self.0.terminate_tx.subscribe()
    }

    fn data_notifier(&self) -> mpsc::UnboundedReceiver<DataAvailable> {
        self.0
            .data_rx
            .lock()
            .unwrap()
            .take()
            .expect("data_notifier taken more than once for the same session handle")
    }

    async fn back_channel_peek(&self) -> Result<Vec<Message>, AdapterError> {
        Ok(self.0.outbound.lock().await.clone())
    }

    async fn back_channel_add(&self, body: Box<RawValue>) -> Result<Message, AdapterError> {
        let id = self.0.next_msg_id.fetch_add(1, Ordering::SeqCst);
        let msg = Message::new(id, body);
        let byte_delta = msg.body.get().len() as i64;
        self.0.outbound.lock().await.push(msg.clone());
        let _ = self.0.data_tx.send(DataAvailable { byte_delta });
        Ok(msg)
    }

    async fn back_channel_ack_through(&self, id: u64) -> Result<(), AdapterError> {
        self.0.outbound.lock().await.retain(|m| m.id > id);
        Ok(())
    }

    async fn forward_channel(&self, batch: Vec<Message>) -> Result<(), AdapterError> {
        self.0.inbound.lock().await.extend(batch);
        Ok(())
    }
}

/// In-memory `SessionManager`. Sessions live exactly as long as this value
/// does; there is no rehydration story beyond the process — `lookup_session`
/// only ever serves a session the registry already knows about (the normal
/// case is the router finding the session's `EngineHandle` in the registry
/// directly and never calling `lookup_session` at all; see C3).
pub struct MemoryManager {
    host_prefix: String,
    sessions: Mutex<HashMap<String, Arc<SessionState>>>,
    next_sid: AtomicU64,
    deny_auth: bool,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            host_prefix: String::new(),
            sessions: Mutex::new(HashMap::new()),
            next_sid: AtomicU64::new(0),
            deny_auth: false,
        }
    }

    pub fn with_host_prefix(host_prefix: impl Into<String>) -> Self {
        Self {
            host_prefix: host_prefix.into(),
            ..Self::new()
        }
    }

    /// Test helper: makes `authenticate` reject every SID, for exercising
    /// the router's `SessionManager::authenticate` gate (spec.md §1/§4.6).
    pub fn denying_all_auth() -> Self {
        Self {
            deny_auth: true,
            ..Self::new()
        }
    }

    /// Test helper: the application messages a session's forward channel
    /// has delivered so far, in delivery order.
    pub async fn inbound_messages(&self, sid: &str) -> Vec<Message> {
        match self.sessions.lock().await.get(sid) {
            Some(state) => state.inbound.lock().await.clone(),
            None => Vec::new(),
        }
    }

    /// Test helper: simulate the application deciding to end a session.
    pub async fn terminate_from_server(&self, sid: &str) {
        if let Some(state) = self.sessions.lock().await.get(sid) {
            let _ = state.terminate_tx.send(());
        }
    }
}

#[async_trait]
impl SessionManager for MemoryManager {
    type Handle = MemoryHandle;

    async fn authenticate(&self, _sid: &str) -> bool {
        !self.deny_auth
    }

    async fn new_session(&self) -> Result<Self::Handle, AdapterError> {
        let id = self.next_sid.fetch_add(1, Ordering::SeqCst);
        let sid = format!("mem-session-{id}");
        let (terminate_tx, _) = broadcast::channel(4);
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SessionState {
            sid: sid.clone(),
            outbound: Mutex::new(Vec::new()),
            inbound: Mutex::new(Vec::new()),
            next_msg_id: AtomicU64::new(0),
            terminate_tx,
            data_tx,
            data_rx: std::sync::Mutex::new(Some(data_rx)),
        });
        self.sessions.lock().await.insert(sid, state.clone());
        Ok(MemoryHandle(state))
    }

    async fn lookup_session(
        &self,
        sid: &str,
    ) -> Result<Option<(Self::Handle, SessionCounters)>, AdapterError> {
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .get(sid)
            .map(|state| (MemoryHandle(state.clone()), SessionCounters::default())))
    }

    async fn terminate_session(
        &self,
        sid: &str,
        _reason: TerminationReason,
    ) -> Result<(), AdapterError> {
        self.sessions.lock().await.remove(sid);
        Ok(())
    }

    fn host_prefix(&self) -> String {
        self.host_prefix.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_session_then_lookup_returns_same_sid() {
        let manager = MemoryManager::new();
        let handle = manager.new_session().await.unwrap();
        let sid = handle.sid().to_string();
        let looked_up = manager.lookup_session(&sid).await.unwrap();
        assert!(looked_up.is_some());
    }

    #[tokio::test]
    async fn lookup_unknown_sid_returns_none() {
        let manager = MemoryManager::new();
        assert!(manager.lookup_session("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn back_channel_add_is_visible_via_peek_and_raises_data_notifier() {
        let manager = MemoryManager::new();
        let handle = manager.new_session().await.unwrap();
        let mut data_rx = handle.data_notifier();

        let body = RawValue::from_string(r#""hi""#.to_string()).unwrap();
        handle.back_channel_add(body).await.unwrap();

        let delta = data_rx.recv().await.unwrap();
        assert_eq!(delta.byte_delta, 4);
        assert_eq!(handle.back_channel_peek().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn forward_channel_messages_are_recorded_for_inspection() {
        let manager = MemoryManager::new();
        let handle = manager.new_session().await.unwrap();
        let sid = handle.sid().to_string();
        let body = RawValue::from_string(r#"{"x":"a"}"#.to_string()).unwrap();
        handle.forward_channel(vec![Message::new(0, body)]).await.unwrap();
        assert_eq!(manager.inbound_messages(&sid).await.len(), 1);
    }

    #[tokio::test]
    async fn terminate_from_server_fires_the_terminate_notifier() {
        let manager = MemoryManager::new();
        let handle = manager.new_session().await.unwrap();
        let mut terminate_rx = handle.terminate_notifier();
        manager.terminate_from_server(handle.sid()).await;
        assert!(terminate_rx.recv().await.is_ok());
    }
}
