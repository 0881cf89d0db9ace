//! C4: axum wiring for the HTTP surface described in spec.md §6. Generic
//! over `M: SessionManager` — one concrete adapter is chosen by the
//! embedding application and injected once via `build_router`.

use crate::adapter::{SessionCounters, SessionManager};
use crate::compressor::GzipCompressor;
use crate::engine::{BackChannelParams, BodyChunk, EngineHandle, ForwardBatch, SessionEngine};
use crate::error::WcError;
use crate::framer::{Framer, PaddingMode};
use crate::message;
use crate::registry::SessionRegistry;
use crate::request::{self, RequestKind};
use axum::body::Body;
use axum::extract::{Form, Query, State};
use axum::http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, VARY};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;

pub struct AppState<M: SessionManager + 'static> {
    manager: Arc<M>,
    registry: Arc<SessionRegistry>,
}

impl<M: SessionManager + 'static> Clone for AppState<M> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            registry: self.registry.clone(),
        }
    }
}

/// Builds the two-route `/channel/bind` + `/channel/test` surface over a
/// fresh, empty session registry, mounted at the conventional paths. Call
/// once per process per adapter. Every request passes through a
/// `tower_http` `TraceLayer`, so request-scoped spans show up for free
/// alongside the engine's own `tracing` calls.
pub fn build_router<M: SessionManager + 'static>(manager: Arc<M>) -> Router {
    build_router_at(manager, "/channel/bind", "/channel/test")
}

/// Same as `build_router`, but mounted at caller-chosen paths — the one
/// piece of this crate's surface the engine's fixed timeouts don't cover
/// (spec.md §9 "the HTTP path prefix the router is mounted under").
pub fn build_router_at<M: SessionManager + 'static>(manager: Arc<M>, bind_path: &str, test_path: &str) -> Router {
    let state = AppState {
        manager,
        registry: Arc::new(SessionRegistry::new()),
    };
    Router::new()
        .route(bind_path, post(bind_post::<M>).get(bind_get::<M>))
        .route(test_path, get(test_probe::<M>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn bind_post<M: SessionManager + 'static>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
    Form(fields): Form<HashMap<String, String>>,
) -> Response {
    dispatch_bind(state, headers, fields).await
}

async fn bind_get<M: SessionManager + 'static>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
    Query(fields): Query<HashMap<String, String>>,
) -> Response {
    dispatch_bind(state, headers, fields).await
}

async fn dispatch_bind<M: SessionManager + 'static>(
    state: AppState<M>,
    headers: HeaderMap,
    fields: HashMap<String, String>,
) -> Response {
    let result = match request::classify(&fields) {
        RequestKind::NewSession => new_session(&state).await,
        RequestKind::Forward => forward(&state, &headers, &fields).await,
        RequestKind::BackChannel => back_channel(&state, &headers, &fields).await,
        RequestKind::Terminate => terminate(&state, &headers, &fields).await,
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

fn accept_encoding(headers: &HeaderMap) -> Option<&str> {
    headers.get(ACCEPT_ENCODING).and_then(|v| v.to_str().ok())
}

/// Gates every request that names an existing session behind the adapter's
/// authorization hook (spec.md §1 "authorises requests", §4.6
/// `Authenticated(sid, request)`). A brand-new session has no SID yet to
/// authorize against, so `new_session` below never calls this.
async fn authorize<M: SessionManager + 'static>(state: &AppState<M>, sid: &str) -> Result<(), WcError> {
    if state.manager.authenticate(sid).await {
        Ok(())
    } else {
        Err(WcError::Unauthorized)
    }
}

/// Looks the session up in the registry first (the common case — a live
/// engine task is already running); falls back to asking the adapter to
/// rehydrate it (spec.md §4.3) only when the registry has no entry,
/// spawning a fresh engine task seeded from the adapter's reported counters.
async fn lookup_or_rehydrate<M: SessionManager + 'static>(
    state: &AppState<M>,
    sid: &str,
) -> Result<EngineHandle, WcError> {
    if let Some(handle) = state.registry.get(sid).await {
        return Ok(handle);
    }
    match state.manager.lookup_session(sid).await.map_err(WcError::Lookup)? {
        None => Err(WcError::UnknownSid),
        Some((adapter_handle, counters)) => {
            Ok(spawn_and_register(state, sid.to_string(), adapter_handle, counters).await)
        }
    }
}

/// Spawns the engine task and registers it before returning, so a second
/// concurrent request for the same SID is guaranteed to see it in the
/// registry rather than racing another `lookup_session`/spawn of its own.
async fn spawn_and_register<M: SessionManager + 'static>(
    state: &AppState<M>,
    sid: String,
    adapter_handle: M::Handle,
    counters: SessionCounters,
) -> EngineHandle {
    let registry = state.registry.clone();
    let remove_sid = sid.clone();
    let engine_handle = SessionEngine::spawn(state.manager.clone(), adapter_handle, counters, move || {
        tokio::spawn(async move {
            registry.remove(&remove_sid).await;
        });
    });
    state.registry.insert(sid, engine_handle.clone()).await;
    engine_handle
}

/// *New-session forward POST* (spec.md §4.5 E1).
async fn new_session<M: SessionManager + 'static>(state: &AppState<M>) -> Result<Response, WcError> {
    let adapter_handle = state.manager.new_session().await.map_err(WcError::Create)?;
    let sid = adapter_handle.sid().to_string();
    let host_prefix = state.manager.host_prefix();

    let greeting = message::session_created_body(&sid, &host_prefix);
    adapter_handle
        .back_channel_add(greeting)
        .await
        .map_err(WcError::Create)?;
    let queued = adapter_handle.back_channel_peek().await.map_err(WcError::Create)?;

    // No concurrent back channel exists yet for a session that doesn't
    // exist until this call returns, so the greeting is rendered directly
    // rather than round-tripping through the engine task.
    let mut framer = Framer::new(PaddingMode::Length, None, Vec::new());
    framer
        .write_once_messages(&queued)
        .expect("a Vec<u8> sink never fails");

    let registry = state.registry.clone();
    let remove_sid = sid.clone();
    let engine_handle = SessionEngine::spawn(
        state.manager.clone(),
        adapter_handle,
        SessionCounters::default(),
        move || {
            tokio::spawn(async move {
                registry.remove(&remove_sid).await;
            });
        },
    );
    state.registry.insert(sid, engine_handle).await;

    Ok(compress_response(None, PaddingMode::Length, framer.into_sink()))
}

/// *Forward POST* (spec.md §4.5 E1).
async fn forward<M: SessionManager + 'static>(
    state: &AppState<M>,
    headers: &HeaderMap,
    fields: &HashMap<String, String>,
) -> Result<Response, WcError> {
    let sid = request::sid(fields).ok_or(WcError::UnknownSid)?;
    authorize(state, &sid).await?;
    let engine_handle = lookup_or_rehydrate(state, &sid).await?;

    let messages = request::parse_forward_batch(fields)?;
    let aid = request::aid(fields)?;
    let reply = engine_handle.forward(ForwardBatch { aid, messages }).await?;

    let payload = serde_json::to_string(&(
        reply.has_back_channel,
        reply.back_acked_id,
        reply.back_outstanding_bytes,
    ))
    .expect("a 3-tuple of primitives always serializes");

    let mut framer = Framer::new(PaddingMode::Length, None, Vec::new());
    framer.write_once(&payload).expect("a Vec<u8> sink never fails");

    Ok(compress_response(
        accept_encoding(headers),
        PaddingMode::Length,
        framer.into_sink(),
    ))
}

/// *Client terminate* (spec.md §4.5 E1).
async fn terminate<M: SessionManager + 'static>(
    state: &AppState<M>,
    headers: &HeaderMap,
    fields: &HashMap<String, String>,
) -> Result<Response, WcError> {
    let sid = request::sid(fields).ok_or(WcError::UnknownSid)?;
    authorize(state, &sid).await?;
    let engine_handle = lookup_or_rehydrate(state, &sid).await?;
    engine_handle.terminate().await?;

    Ok(compress_response(
        accept_encoding(headers),
        PaddingMode::Raw,
        b"Terminated".to_vec(),
    ))
}

/// *Back-channel GET* (spec.md §4.5 E1). Installs the streaming body's
/// sender half as the session's new back channel and returns a response
/// whose body drains from the engine for as long as the engine keeps the
/// slot open — this is what "parks inside the handler" means for an axum
/// binding: the handler itself returns immediately, and the transport stays
/// open only because the streaming `Body` hasn't finished yet.
async fn back_channel<M: SessionManager + 'static>(
    state: &AppState<M>,
    headers: &HeaderMap,
    fields: &HashMap<String, String>,
) -> Result<Response, WcError> {
    let sid = request::sid(fields).ok_or(WcError::UnknownSid)?;
    authorize(state, &sid).await?;
    let engine_handle = lookup_or_rehydrate(state, &sid).await?;

    let aid = request::aid(fields)?;
    let mode = request::padding_mode(fields);
    let domain = request::domain(fields);
    let buffered_proxy = request::ci(fields);

    let (inner_tx, inner_rx) = mpsc::channel::<BodyChunk>(4);
    let (installed, _done_rx) = engine_handle
        .back_channel(
            BackChannelParams {
                aid,
                mode,
                domain,
                buffered_proxy,
            },
            inner_tx,
        )
        .await;
    installed?;

    // HTTP headers (including Content-Encoding) must be committed before
    // the first byte of a long-poll response is sent, so — unlike the
    // one-shot responses below — compression here is decided purely from
    // the request's Accept-Encoding, not from sniffing/size thresholds
    // (DESIGN.md "streaming compression").
    let compress = accept_encoding(headers).is_some_and(|v| v.contains("gzip"));
    let mut response_headers = Framer::<Vec<u8>>::response_headers(mode);
    if compress {
        response_headers.insert(CONTENT_ENCODING, "gzip".parse().unwrap());
        response_headers.insert(VARY, "accept-encoding".parse().unwrap());
    }

    let body = Body::from_stream(ReceiverStream::new(relay_compressed(inner_rx, compress)));
    Ok((response_headers, body).into_response())
}

/// Relays framed bytes from the engine to the HTTP body, gzip-encoding them
/// incrementally when `compress` is set. Returns the receiving half that
/// becomes the streaming response body.
fn relay_compressed(
    mut inner_rx: mpsc::Receiver<BodyChunk>,
    compress: bool,
) -> mpsc::Receiver<BodyChunk> {
    let (outer_tx, outer_rx) = mpsc::channel::<BodyChunk>(4);
    tokio::spawn(async move {
        let mut encoder = compress.then(|| GzEncoder::new(Vec::new(), Compression::default()));
        while let Some(chunk) = inner_rx.recv().await {
            match chunk {
                Ok(bytes) => {
                    let out = match &mut encoder {
                        Some(enc) => {
                            if enc.write_all(&bytes).is_err() || enc.flush().is_err() {
                                break;
                            }
                            std::mem::take(enc.get_mut())
                        }
                        None => bytes.to_vec(),
                    };
                    if !out.is_empty() && outer_tx.send(Ok(Bytes::from(out))).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = outer_tx.send(Err(e)).await;
                    break;
                }
            }
        }
        if let Some(enc) = encoder {
            if let Ok(tail) = enc.finish() {
                if !tail.is_empty() {
                    let _ = outer_tx.send(Ok(Bytes::from(tail))).await;
                }
            }
        }
    });
    outer_rx
}

/// `GET /channel/test` — the network-capability probe (spec.md §6). Stateless
/// (no SID), so it bypasses the engine entirely.
async fn test_probe<M: SessionManager + 'static>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
    Query(fields): Query<HashMap<String, String>>,
) -> Response {
    if fields.get("MODE").map(String::as_str) == Some("init") {
        let host_prefix = state.manager.host_prefix();
        let payload = serde_json::to_string(&[host_prefix]).expect("always serializes");
        let mut framer = Framer::new(PaddingMode::Length, None, Vec::new());
        framer.write_once(&payload).expect("a Vec<u8> sink never fails");
        return compress_response(accept_encoding(&headers), PaddingMode::Length, framer.into_sink());
    }

    let (tx, rx) = mpsc::channel::<BodyChunk>(2);
    tokio::spawn(async move {
        let mut framer = Framer::new(PaddingMode::Raw, None, Vec::new());
        let _ = framer.chunk("11111");
        let first = std::mem::take(framer.sink_mut());
        if tx.send(Ok(Bytes::from(first))).await.is_err() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            _ = tx.closed() => return,
        }
        let _ = framer.chunk("2");
        let _ = framer.end();
        let rest = std::mem::take(framer.sink_mut());
        let _ = tx.send(Ok(Bytes::from(rest))).await;
    });
    let body = Body::from_stream(ReceiverStream::new(rx));
    (Framer::<Vec<u8>>::response_headers(PaddingMode::Raw), body).into_response()
}

/// Compresses a complete, already-framed one-shot response body (spec.md
/// §4.2): the entire body is available up front, so the full sniff/
/// threshold decision in `GzipCompressor` applies, unlike the eager
/// decision used for the streaming back channel.
fn compress_response(accept_encoding: Option<&str>, mode: PaddingMode, body: Vec<u8>) -> Response {
    let content_type = match mode {
        PaddingMode::Script => "text/html; charset=utf-8",
        PaddingMode::Length | PaddingMode::Raw => "text/plain; charset=utf-8",
    };
    let mut compressor = GzipCompressor::new(Vec::new(), accept_encoding);
    compressor.set_content_type(content_type);
    compressor.write(&body).expect("a Vec<u8> sink never fails");
    compressor.flush().expect("a Vec<u8> sink never fails");
    let compressing = compressor.is_compressing();
    let compressed = compressor.close().expect("a Vec<u8> sink never fails");

    let mut headers = Framer::<Vec<u8>>::response_headers(mode);
    if compressing {
        headers.insert(CONTENT_ENCODING, "gzip".parse().unwrap());
        headers.insert(VARY, "accept-encoding".parse().unwrap());
    }
    (headers, compressed).into_response()
}
