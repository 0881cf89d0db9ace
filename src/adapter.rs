//! C6: the storage adapter contract the engine is parameterised over.
//!
//! Grounded in the reference implementation's `Session`/`SessionManager`
//! interfaces (`examples/original_source/wc.go`), generalised to the
//! engine's actual needs (§4.6). `async-trait` is used because these
//! methods need `async fn` in a trait with default bodies (the
//! `error`/`debug` observability hooks); the engine and router are generic
//! over `M: SessionManager` (the reference implementation's `sm` global
//! becomes one concrete, injected value per process), matching the
//! teacher's own preference for generic async glue over trait objects
//! (`services/receiver/src/session.rs`'s `run_session_loop<S>`).

use crate::error::AdapterError;
use crate::message::Message;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

/// Why a session ended, passed to `SessionManager::terminate_session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    ClientTerminate,
    ServerTerminate,
}

/// A notification that new outbound bytes are available for a session's
/// back channel. Carries the byte-length delta so the engine can maintain
/// `back_outstanding_bytes` without re-peeking the whole queue on every
/// notification.
#[derive(Debug, Clone, Copy)]
pub struct DataAvailable {
    pub byte_delta: i64,
}

/// State recovered when looking up an existing session (the engine seeds
/// its counters from this on first contact with a session it didn't just
/// create itself, e.g. after a process restart with a persistent adapter).
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCounters {
    pub back_acked_id: i64,
    pub forward_high: i64,
}

/// Process-wide collaborator: creates sessions, looks them up, and
/// authenticates/observes requests. One instance is shared across every
/// session's engine task.
#[async_trait]
pub trait SessionManager: Send + Sync {
    type Handle: SessionHandle;

    /// Authorizes an inbound request against a session. Adapters that don't
    /// need authorization can return `true` unconditionally.
    async fn authenticate(&self, sid: &str) -> bool {
        let _ = sid;
        true
    }

    async fn new_session(&self) -> Result<Self::Handle, AdapterError>;

    /// `Ok(None)` signals an unknown SID (distinct from a transport error),
    /// matching the reference implementation's `ErrUnknownSID` special case.
    async fn lookup_session(
        &self,
        sid: &str,
    ) -> Result<Option<(Self::Handle, SessionCounters)>, AdapterError>;

    async fn terminate_session(
        &self,
        sid: &str,
        reason: TerminationReason,
    ) -> Result<(), AdapterError>;

    /// The prefix the client should use on IE < 10 to circumvent same-host
    /// connection limits; `""` disables it (spec.md §9, `test.go`'s
    /// `SetHostPrefixReply`).
    fn host_prefix(&self) -> String {
        String::new()
    }

    /// Observability sink for request-scoped failures. Default forwards to
    /// `tracing`, matching this crate's ambient logging story
    /// (SPEC_FULL.md §10.1) — adapters that don't care about custom
    /// observability can omit this entirely.
    fn error(&self, sid: Option<&str>, err: &AdapterError) {
        tracing::error!(sid = sid.unwrap_or(""), error = %err, "webchannel adapter error");
    }

    fn debug(&self, msg: &str) {
        tracing::debug!("{msg}");
    }
}

/// Per-session collaborator returned by `new_session`/`lookup_session`.
#[async_trait]
pub trait SessionHandle: Send + Sync + 'static {
    fn sid(&self) -> &str;

    /// Server-terminate notifications for this session (E5).
    fn terminate_notifier(&self) -> broadcast::Receiver<()>;

    /// Byte-count deltas raised whenever new outbound messages become
    /// available (E5). The engine wraps this in a coalescing task
    /// (SPEC_FULL.md §5) so a fast producer never blocks on a busy engine.
    fn data_notifier(&self) -> mpsc::UnboundedReceiver<DataAvailable>;

    async fn back_channel_peek(&self) -> Result<Vec<Message>, AdapterError>;

    /// Appends a message (control or application) with an adapter-assigned
    /// id and raises a `data_notifier` event for it.
    async fn back_channel_add(&self, body: Box<serde_json::value::RawValue>)
        -> Result<Message, AdapterError>;

    async fn back_channel_ack_through(&self, id: u64) -> Result<(), AdapterError>;

    fn back_channel_open(&self) {}
    fn back_channel_close(&self) {}

    /// Delivers an ordered, already-deduplicated batch of inbound messages.
    /// Must be durable on success (§4.6).
    async fn forward_channel(&self, batch: Vec<Message>) -> Result<(), AdapterError>;
}
