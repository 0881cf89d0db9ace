//! C5: the per-session actor — the core of this crate. A single task per
//! session reacts to five event sources (spec.md §4.5) by `tokio::select!`,
//! mirroring `services/server/src/ws_forwarder.rs`'s `handle_forwarder_socket`
//! loop: inbound HTTP requests, the noop timer, the long-poll timer, the
//! transport close notification, and adapter-raised notifications (new
//! outbound data, server terminate).

use crate::adapter::{DataAvailable, SessionCounters, SessionHandle, SessionManager, TerminationReason};
use crate::error::WcError;
use crate::framer::{Framer, PaddingMode};
use crate::message::{self, Message};
use bytes::Bytes;
use serde_json::value::RawValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

const NOOP_TIMEOUT: Duration = Duration::from_secs(30);
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(240);

/// A parsed forward-channel batch. The router is responsible for the
/// `reqN_*` parsing and id assignment (`ofs+i`); the engine only needs to
/// know what to discard (§4.5 forward branch: "Drop any message whose id ≤
/// forwardHigh").
pub struct ForwardBatch {
    pub aid: Option<u64>,
    pub messages: Vec<(u64, Box<RawValue>)>,
}

pub struct ForwardReply {
    pub has_back_channel: bool,
    pub back_acked_id: i64,
    pub back_outstanding_bytes: i64,
}

pub struct BackChannelParams {
    pub aid: Option<u64>,
    pub mode: PaddingMode,
    pub domain: Option<String>,
    /// `CI=1` — buffered-proxy single-shot mode (§4.5 "Buffered-proxy
    /// single-shot mode").
    pub buffered_proxy: bool,
}

/// One chunk of framed bytes (or a fatal write error) pushed to the
/// streaming HTTP response body.
pub type BodyChunk = Result<Bytes, std::io::Error>;

enum EngineRequest {
    Forward {
        batch: ForwardBatch,
        reply: oneshot::Sender<Result<ForwardReply, WcError>>,
    },
    BackChannel {
        params: BackChannelParams,
        body_tx: mpsc::Sender<BodyChunk>,
        /// Fires once the slot this request installs is torn down, by
        /// whichever of E2/E3/E4/E5 tears it down first (spec.md §3
        /// "Back-Channel Slot" — "The completion signal MUST be fired on
        /// every exit path"). Not awaited by the axum binding (the
        /// streaming body's own lifetime already models "the handler is
        /// parked"); useful to adapter-free engine tests and any non-HTTP
        /// caller that wants a synchronous-feeling hook.
        installed: oneshot::Sender<Result<(), WcError>>,
        done: oneshot::Sender<()>,
    },
    Terminate {
        reply: oneshot::Sender<Result<(), WcError>>,
    },
}

/// Handle to a running session engine task. Cheaply cloneable; every clone
/// can submit requests concurrently (the engine task serialises them).
#[derive(Clone)]
pub struct EngineHandle {
    inbound_tx: mpsc::Sender<EngineRequest>,
}

#[derive(Debug, thiserror::Error)]
#[error("session engine task is no longer running")]
struct EngineGone;

fn engine_gone() -> WcError {
    WcError::Lookup(crate::error::AdapterError::new(EngineGone))
}

impl EngineHandle {
    pub async fn forward(&self, batch: ForwardBatch) -> Result<ForwardReply, WcError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .inbound_tx
            .send(EngineRequest::Forward { batch, reply: reply_tx })
            .await
            .is_err()
        {
            return Err(engine_gone());
        }
        reply_rx.await.unwrap_or(Err(engine_gone()))
    }

    /// Installs `body_tx` as the new back channel. Returns once the engine
    /// has installed (or rejected) the slot, plus a receiver that fires
    /// when the slot is later torn down.
    pub async fn back_channel(
        &self,
        params: BackChannelParams,
        body_tx: mpsc::Sender<BodyChunk>,
    ) -> (Result<(), WcError>, oneshot::Receiver<()>) {
        let (installed_tx, installed_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .inbound_tx
            .send(EngineRequest::BackChannel {
                params,
                body_tx,
                installed: installed_tx,
                done: done_tx,
            })
            .await
            .is_err()
        {
            return (Err(engine_gone()), done_rx);
        }
        let result = installed_rx.await.unwrap_or(Err(engine_gone()));
        (result, done_rx)
    }

    pub async fn terminate(&self) -> Result<(), WcError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .inbound_tx
            .send(EngineRequest::Terminate { reply: reply_tx })
            .await
            .is_err()
        {
            return Err(engine_gone());
        }
        reply_rx.await.unwrap_or(Err(engine_gone()))
    }
}

/// Accumulates `DataAvailable` deltas while the engine is busy and delivers
/// a single coalesced delta per engine turn (spec.md §5: "a small task that
/// accumulates counts while the engine is busy and delivers a single
/// aggregated delta"), so a fast-producing adapter never blocks on a busy
/// engine task. The bounded channel's capacity (1) plus `reserve()` is what
/// makes delivery wait for the engine to actually be ready rather than
/// buffering an unbounded backlog.
fn spawn_data_coalescer(
    mut raw_rx: mpsc::UnboundedReceiver<DataAvailable>,
) -> mpsc::Receiver<DataAvailable> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut pending: Option<DataAvailable> = None;
        loop {
            tokio::select! {
                biased;

                maybe = raw_rx.recv() => {
                    match maybe {
                        Some(delta) => {
                            pending = Some(match pending.take() {
                                Some(mut acc) => {
                                    acc.byte_delta += delta.byte_delta;
                                    acc
                                }
                                None => delta,
                            });
                        }
                        None => break,
                    }
                }

                permit = tx.reserve(), if pending.is_some() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(delta) = pending.take() {
                                permit.send(delta);
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    });
    rx
}

struct BackChannelSlot {
    framer: Framer<Vec<u8>>,
    body_tx: mpsc::Sender<BodyChunk>,
    buffered_proxy: bool,
    noop_deadline: Instant,
    long_deadline: Instant,
    done: oneshot::Sender<()>,
}

/// The actor itself, generic over the storage adapter's `SessionManager`.
/// Spawned once per session by the router, on session creation or lookup;
/// torn down when the session ends.
pub struct SessionEngine<M: SessionManager> {
    manager: Arc<M>,
    handle: M::Handle,
    registry_remove: Option<Box<dyn FnOnce() + Send>>,
    inbound_rx: mpsc::Receiver<EngineRequest>,
    forward_high: i64,
    back_acked_id: i64,
    back_outstanding_bytes: i64,
    bc: Option<BackChannelSlot>,
}

impl<M: SessionManager> SessionEngine<M> {
    /// Spawns the engine task and returns a handle to it. `counters` seeds
    /// the dedup/ACK frontier — `SessionCounters::default()` for a
    /// brand-new session, or whatever `lookup_session` returned when
    /// reattaching to one that already existed. `on_terminate` is called
    /// exactly once, from inside the engine task, when the session ends for
    /// any reason — the router uses it to remove the session from the
    /// registry without the engine needing to know about the registry
    /// directly.
    pub fn spawn(
        manager: Arc<M>,
        handle: M::Handle,
        counters: SessionCounters,
        on_terminate: impl FnOnce() + Send + 'static,
    ) -> EngineHandle {
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let engine = SessionEngine {
            manager,
            handle,
            registry_remove: Some(Box::new(on_terminate)),
            inbound_rx,
            forward_high: counters.forward_high,
            back_acked_id: counters.back_acked_id,
            back_outstanding_bytes: 0,
            bc: None,
        };
        tokio::spawn(engine.run());
        EngineHandle { inbound_tx }
    }

    async fn run(mut self) {
        let mut terminate_rx = self.handle.terminate_notifier();
        let mut data_rx = spawn_data_coalescer(self.handle.data_notifier());
        loop {
            let noop_deadline = self.bc.as_ref().map(|bc| bc.noop_deadline);
            let long_deadline = self.bc.as_ref().map(|bc| bc.long_deadline);
            let noop_armed = noop_deadline.is_some()
                && !self.bc.as_ref().map(|bc| bc.buffered_proxy).unwrap_or(true);

            tokio::select! {
                req = self.inbound_rx.recv() => {
                    match req {
                        Some(req) => self.handle_request(req).await,
                        None => break,
                    }
                }

                _ = terminate_rx.recv() => {
                    self.on_server_terminate().await;
                    break;
                }

                Some(delta) = data_rx.recv() => {
                    self.on_data_available(delta).await;
                }

                _ = async { self.bc.as_mut().unwrap().body_tx.closed().await }, if self.bc.is_some() => {
                    self.close_back_channel(false).await;
                }

                _ = tokio::time::sleep_until(noop_deadline.unwrap_or_else(Instant::now)), if noop_armed => {
                    self.on_noop_timer().await;
                }

                _ = tokio::time::sleep_until(long_deadline.unwrap_or_else(Instant::now)), if long_deadline.is_some() => {
                    self.close_back_channel(true).await;
                }
            }
        }
    }

    async fn handle_request(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Forward { batch, reply } => {
                let result = self.on_forward(batch).await;
                let _ = reply.send(result);
            }
            EngineRequest::BackChannel {
                params,
                body_tx,
                installed,
                done,
            } => {
                let result = self.on_back_channel(params, body_tx, done).await;
                let _ = installed.send(result);
            }
            EngineRequest::Terminate { reply } => {
                let result = self.on_terminate().await;
                let _ = reply.send(result);
            }
        }
    }

    /// E1 forward branch (spec.md §4.5).
    async fn on_forward(&mut self, batch: ForwardBatch) -> Result<ForwardReply, WcError> {
        let mut deliverable: Vec<Message> = Vec::new();
        let mut max_id = self.forward_high;
        for (id, body) in batch.messages {
            if id as i64 <= self.forward_high {
                continue; // already delivered; drop (idempotence invariant)
            }
            max_id = max_id.max(id as i64);
            deliverable.push(Message::new(id, body));
        }
        if !deliverable.is_empty() {
            self.handle
                .forward_channel(deliverable)
                .await
                .map_err(WcError::Forward)?;
            self.forward_high = max_id;
        }

        if let Some(aid) = batch.aid {
            self.ack_from_forward(aid).await?;
        }

        Ok(ForwardReply {
            has_back_channel: self.bc.is_some(),
            back_acked_id: self.back_acked_id,
            back_outstanding_bytes: self.back_outstanding_bytes,
        })
    }

    /// E1′ back-channel ACK subroutine, forward-channel variant: leaves
    /// `back_acked_id` untouched (the current back channel, if any, is
    /// still the source of truth for its own ACK frontier) and only drains
    /// outstanding-byte accounting for newly-acked messages.
    async fn ack_from_forward(&mut self, aid: u64) -> Result<(), WcError> {
        let queued = self.handle.back_channel_peek().await.map_err(WcError::Peek)?;
        let acked_bytes: usize = queued
            .iter()
            .filter(|m| m.id <= aid)
            .map(|m| m.body.get().len())
            .sum();
        if acked_bytes > 0 {
            self.handle
                .back_channel_ack_through(aid)
                .await
                .map_err(WcError::Ack)?;
            self.back_outstanding_bytes = (self.back_outstanding_bytes - acked_bytes as i64).max(0);
        }
        Ok(())
    }

    /// E1 back-channel branch.
    async fn on_back_channel(
        &mut self,
        params: BackChannelParams,
        body_tx: mpsc::Sender<BodyChunk>,
        done: oneshot::Sender<()>,
    ) -> Result<(), WcError> {
        if let Some(aid) = params.aid {
            self.ack_from_back_channel(aid).await?;
        }

        if let Some(old) = self.bc.take() {
            let err: Box<dyn std::error::Error + Send + Sync> = "Duplicate backchannel.".into();
            self.manager
                .error(Some(self.handle.sid()), &crate::error::AdapterError(err));
            let _ = old.done.send(());
            self.handle.back_channel_close();
        }

        let now = Instant::now();
        let framer = Framer::new(params.mode, params.domain, Vec::new());
        self.bc = Some(BackChannelSlot {
            framer,
            body_tx,
            buffered_proxy: params.buffered_proxy,
            noop_deadline: now + NOOP_TIMEOUT,
            long_deadline: now + LONG_POLL_TIMEOUT,
            done,
        });
        self.handle.back_channel_open();
        self.flush().await;
        Ok(())
    }

    /// E1′, back-channel variant: trusts the client's AID unconditionally
    /// (DESIGN.md Open Question 2), recomputing outstanding bytes from
    /// whatever the adapter reports remains unacked.
    async fn ack_from_back_channel(&mut self, aid: u64) -> Result<(), WcError> {
        let queued = self.handle.back_channel_peek().await.map_err(WcError::Peek)?;
        let (acked, remaining): (Vec<_>, Vec<_>) = queued.into_iter().partition(|m| m.id <= aid);
        if !acked.is_empty() {
            self.handle
                .back_channel_ack_through(aid)
                .await
                .map_err(WcError::Ack)?;
        }
        self.back_acked_id = aid as i64;
        self.back_outstanding_bytes = remaining.iter().map(|m| m.body.get().len() as i64).sum();
        Ok(())
    }

    async fn on_terminate(&mut self) -> Result<(), WcError> {
        self.manager
            .terminate_session(self.handle.sid(), TerminationReason::ClientTerminate)
            .await
            .map_err(WcError::Terminate)?;
        if let Some(bc) = self.bc.take() {
            let _ = bc.done.send(());
            self.handle.back_channel_close();
        }
        self.finish();
        Ok(())
    }

    /// E5, server-terminate branch: the adapter itself decided the session
    /// is over, so there is nothing further to tell it — only local
    /// teardown (a final `["stop"]` frame if a back channel is attached,
    /// then registry cleanup).
    async fn on_server_terminate(&mut self) {
        if let Some(mut bc) = self.bc.take() {
            // the server-terminate stop frame always carries id 0, bypassing
            // the normal id frontier (examples/original_source/session.go:102-103)
            let _ = bc.framer.write_once_messages(&[message::stop(0u64)]);
            let _ = bc.framer.end();
            self.push_pending(&mut bc).await;
            self.handle.back_channel_close();
            let _ = bc.done.send(());
        }
        self.finish();
    }

    /// E2: noop timer fire.
    async fn on_noop_timer(&mut self) {
        let has_queue = self
            .handle
            .back_channel_peek()
            .await
            .map(|q| !q.is_empty())
            .unwrap_or(true);
        if !has_queue {
            let _ = self.handle.back_channel_add(message::noop_body()).await;
        }
        if let Some(bc) = &mut self.bc {
            bc.noop_deadline = Instant::now() + NOOP_TIMEOUT;
        }
        self.flush().await;
    }

    /// E3 (long-poll) and the transport-close path of E4 share the same
    /// teardown; `graceful` selects whether `end()` is called (E3 only —
    /// the transport is still alive to receive it).
    async fn close_back_channel(&mut self, graceful: bool) {
        if let Some(mut bc) = self.bc.take() {
            if graceful {
                let _ = bc.framer.end();
                self.push_pending(&mut bc).await;
            }
            self.handle.back_channel_close();
            let _ = bc.done.send(());
        }
    }

    /// E5, data-available branch.
    async fn on_data_available(&mut self, delta: DataAvailable) {
        self.back_outstanding_bytes += delta.byte_delta;
        if self.bc.is_some() {
            self.flush().await;
        }
    }

    /// Flush semantics (spec.md §4.5): peek the outbound queue, skip
    /// anything already acked, chunk the rest. In buffered-proxy (`CI=1`)
    /// mode, the chunk write also ends and tears the slot down — this is
    /// the mechanism that lets intermediate proxies that withhold bytes
    /// until the response ends still observe data.
    async fn flush(&mut self) {
        if self.bc.is_none() {
            return;
        }
        let queued = match self.handle.back_channel_peek().await {
            Ok(q) => q,
            Err(_) => return,
        };
        let surviving: Vec<Message> = queued
            .into_iter()
            .filter(|m| m.id as i64 > self.back_acked_id)
            .collect();
        if surviving.is_empty() {
            return;
        }
        let highest = surviving.iter().map(|m| m.id).max().unwrap_or(0);

        let buffered_proxy = {
            let bc = self.bc.as_mut().unwrap();
            if bc.framer.chunk_messages(&surviving).is_err() {
                self.close_back_channel(false).await;
                return;
            }
            bc.buffered_proxy
        };
        self.back_acked_id = highest as i64;
        self.push_pending_bytes().await;

        if buffered_proxy {
            if let Some(mut bc) = self.bc.take() {
                let _ = bc.framer.end();
                self.push_pending(&mut bc).await;
                self.handle.back_channel_close();
                let _ = bc.done.send(());
            }
        }
    }

    /// Drains the framer's in-memory buffer and sends it down the
    /// streaming body channel. The framer itself only ever writes into a
    /// plain `Vec<u8>` (kept synchronous, so `Framer`'s generic write path
    /// never needs to be async); this is the one seam where buffered bytes
    /// cross into the async transport.
    async fn push_pending_bytes(&mut self) {
        let Some(bc) = &mut self.bc else { return };
        let drained = std::mem::take(bc.framer.sink_mut());
        if drained.is_empty() {
            return;
        }
        if bc.body_tx.send(Ok(Bytes::from(drained))).await.is_err() {
            self.close_back_channel(false).await;
        }
    }

    async fn push_pending(&mut self, bc: &mut BackChannelSlot) {
        let drained = std::mem::take(bc.framer.sink_mut());
        if drained.is_empty() {
            return;
        }
        let _ = bc.body_tx.send(Ok(Bytes::from(drained))).await;
    }

    fn finish(&mut self) {
        if let Some(remove) = self.registry_remove.take() {
            remove();
        }
        self.inbound_rx.close();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::EngineHandle;
    use tokio::sync::mpsc;

    /// An `EngineHandle` whose backing task is not running — sufficient for
    /// registry tests that only exercise map bookkeeping, never dispatch.
    pub(crate) fn noop_engine_handle() -> EngineHandle {
        let (inbound_tx, _inbound_rx) = mpsc::channel(1);
        EngineHandle { inbound_tx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tokio::sync::{broadcast, Mutex as AsyncMutex};

    /// Minimal in-process `SessionManager`/`SessionHandle` pair, local to
    /// these tests, backed by a plain `Vec<Message>` queue — just enough
    /// surface to drive the engine's event handlers directly without going
    /// through HTTP or a real storage adapter.
    struct TestHandle {
        sid: String,
        queue: Arc<AsyncMutex<Vec<Message>>>,
        forwarded: Arc<AsyncMutex<Vec<Message>>>,
        next_id: Arc<AtomicI64>,
        terminate_tx: broadcast::Sender<()>,
    }

    #[async_trait]
    impl SessionHandle for TestHandle {
        fn sid(&self) -> &str {
            &self.sid
        }

        fn terminate_notifier(&self) -> broadcast::Receiver<()> {
            self.terminate_tx.subscribe()
        }

        fn data_notifier(&self) -> mpsc::UnboundedReceiver<DataAvailable> {
            let (_tx, rx) = mpsc::unbounded_channel();
            rx
        }

        async fn back_channel_peek(&self) -> Result<Vec<Message>, AdapterError> {
            Ok(self.queue.lock().await.clone())
        }

        async fn back_channel_add(&self, body: Box<RawValue>) -> Result<Message, AdapterError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u64;
            let msg = Message::new(id, body);
            self.queue.lock().await.push(msg.clone());
            Ok(msg)
        }

        async fn back_channel_ack_through(&self, id: u64) -> Result<(), AdapterError> {
            self.queue.lock().await.retain(|m| m.id > id);
            Ok(())
        }

        async fn forward_channel(&self, batch: Vec<Message>) -> Result<(), AdapterError> {
            self.forwarded.lock().await.extend(batch);
            Ok(())
        }
    }

    struct TestManager;

    #[async_trait]
    impl SessionManager for TestManager {
        type Handle = TestHandle;

        async fn new_session(&self) -> Result<Self::Handle, AdapterError> {
            unreachable!("not used in these tests")
        }

        async fn lookup_session(
            &self,
            _sid: &str,
        ) -> Result<Option<(Self::Handle, SessionCounters)>, AdapterError> {
            unreachable!("not used in these tests")
        }

        async fn terminate_session(
            &self,
            _sid: &str,
            _reason: TerminationReason,
        ) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    fn test_engine() -> (
        SessionEngine<TestManager>,
        Arc<AsyncMutex<Vec<Message>>>,
        Arc<AsyncMutex<Vec<Message>>>,
    ) {
        let queue = Arc::new(AsyncMutex::new(Vec::new()));
        let forwarded = Arc::new(AsyncMutex::new(Vec::new()));
        let (terminate_tx, _) = broadcast::channel(1);
        let handle = TestHandle {
            sid: "sid1".to_string(),
            queue: queue.clone(),
            forwarded: forwarded.clone(),
            next_id: Arc::new(AtomicI64::new(0)),
            terminate_tx,
        };
        let (_inbound_tx, inbound_rx) = mpsc::channel(8);
        let engine = SessionEngine {
            manager: Arc::new(TestManager),
            handle,
            registry_remove: None,
            inbound_rx,
            forward_high: -1,
            back_acked_id: -1,
            back_outstanding_bytes: 0,
            bc: None,
        };
        (engine, queue, forwarded)
    }

    fn raw(body: &str) -> Box<RawValue> {
        RawValue::from_string(body.to_string()).unwrap()
    }

    #[tokio::test]
    async fn forward_delivers_new_messages_and_advances_high_water_mark() {
        let (mut engine, _queue, forwarded) = test_engine();
        let reply = engine
            .on_forward(ForwardBatch {
                aid: None,
                messages: vec![(0, raw("\"a\"")), (1, raw("\"b\""))],
            })
            .await
            .unwrap();
        assert_eq!(engine.forward_high, 1);
        assert_eq!(forwarded.lock().await.len(), 2);
        assert!(!reply.has_back_channel);
    }

    #[tokio::test]
    async fn forward_drops_messages_at_or_below_high_water_mark() {
        let (mut engine, _queue, forwarded) = test_engine();
        engine
            .on_forward(ForwardBatch {
                aid: None,
                messages: vec![(0, raw("\"a\"")), (1, raw("\"b\""))],
            })
            .await
            .unwrap();
        engine
            .on_forward(ForwardBatch {
                aid: None,
                messages: vec![(1, raw("\"b-dup\"")), (2, raw("\"c\""))],
            })
            .await
            .unwrap();
        assert_eq!(engine.forward_high, 2);
        // only "a", "b", "c" should ever have reached the adapter
        assert_eq!(forwarded.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn back_channel_install_flushes_queued_messages_immediately() {
        let (mut engine, queue, _forwarded) = test_engine();
        queue.lock().await.push(Message::new(0, raw("\"hello\"")));

        let (body_tx, mut body_rx) = mpsc::channel(4);
        let (done_tx, _done_rx) = oneshot::channel();
        engine
            .on_back_channel(
                BackChannelParams {
                    aid: None,
                    mode: PaddingMode::Length,
                    domain: None,
                    buffered_proxy: false,
                },
                body_tx,
                done_tx,
            )
            .await
            .unwrap();

        let chunk = body_rx.recv().await.unwrap().unwrap();
        assert_eq!(std::str::from_utf8(&chunk).unwrap(), "9\n[[0,\"hello\"]]");
        assert_eq!(engine.back_acked_id, 0);
    }

    #[tokio::test]
    async fn buffered_proxy_mode_closes_the_slot_after_one_flush() {
        let (mut engine, queue, _forwarded) = test_engine();
        queue.lock().await.push(Message::new(0, raw("\"hi\"")));

        let (body_tx, mut body_rx) = mpsc::channel(4);
        let (done_tx, done_rx) = oneshot::channel();
        engine
            .on_back_channel(
                BackChannelParams {
                    aid: None,
                    mode: PaddingMode::Raw,
                    domain: None,
                    buffered_proxy: true,
                },
                body_tx,
                done_tx,
            )
            .await
            .unwrap();

        assert!(body_rx.recv().await.is_some());
        assert!(engine.bc.is_none());
        assert!(done_rx.await.is_ok());
    }

    #[tokio::test]
    async fn ack_through_aid_trims_outstanding_bytes() {
        let (mut engine, queue, _forwarded) = test_engine();
        queue.lock().await.push(Message::new(0, raw("\"a\"")));
        queue.lock().await.push(Message::new(1, raw("\"b\"")));

        engine.ack_from_back_channel(0).await.unwrap();
        assert_eq!(engine.back_acked_id, 0);
        assert_eq!(queue.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn noop_timer_enqueues_only_when_queue_is_empty() {
        let (mut engine, queue, _forwarded) = test_engine();
        engine.on_noop_timer().await;
        assert_eq!(queue.lock().await.len(), 1);
        assert_eq!(queue.lock().await[0].body.get(), r#"["noop"]"#);

        queue.lock().await.clear();
        queue.lock().await.push(Message::new(0, raw("\"x\"")));
        engine.on_noop_timer().await;
        // still just the one application message; no noop appended
        assert_eq!(queue.lock().await.len(), 1);
    }
}
