// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! RPC client over one connection.
//!
//! Two long-running tasks per connected client: a *sender* draining an
//! outbound channel into the session (so calls, heartbeats and
//! subscription requests from any number of tasks interleave as whole
//! frames), and a *receiver* routing inbound frames: method responses to
//! the caller parked on that sequence id, publishes to the registered
//! topic handler, everything else consumed.
//!
//! A call's failure ladder, in the order it is checked: session closed →
//! [`RpcCode::Closed`]; reply deadline elapsed → [`RpcCode::Timeout`];
//! empty response body → [`RpcCode::NoMethod`]; undecodable result →
//! [`RpcCode::NoMatch`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use miette::{IntoDiagnostic, miette};

use crate::net::TcpStream;
use crate::runtime::{Runtime, TimerHandle};
use crate::sync::{Channel, CoMutex, PopTimeoutError};

use super::protocol::{MsgType, Protocol};
use super::serializer::{Decode, Encode, Serializer};
use super::session::RpcSession;
use super::{RpcCode, RpcResult};

/// Keep-alive period towards the server; stays under its 40 s window.
const HEART_PERIOD_MS: u64 = 30_000;

/// Callback invoked with the payload of a published message, positioned
/// just past the topic.
pub type SubscribeHandler = Arc<dyn Fn(&mut Serializer) + Send + Sync>;

struct ClientInner {
    rt: Arc<Runtime>,
    auto_heartbeat: bool,
    timeout_ms: AtomicU64,
    session: OnceLock<Arc<RpcSession>>,
    sequence: AtomicU32,
    pending: CoMutex<HashMap<u32, Channel<Protocol>>>,
    outbound: Channel<Protocol>,
    subscriptions: CoMutex<HashMap<String, SubscribeHandler>>,
    closed: AtomicBool,
    heart_timer: Mutex<Option<TimerHandle>>,
}

impl std::fmt::Debug for ClientInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    #[must_use]
    pub fn new(rt: &Arc<Runtime>) -> Self {
        Self::with_heartbeat(rt, true)
    }

    /// `auto_heartbeat` keeps the server's kill-timer refreshed even when
    /// the application goes quiet between calls.
    #[must_use]
    pub fn with_heartbeat(rt: &Arc<Runtime>, auto_heartbeat: bool) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                rt: rt.clone(),
                auto_heartbeat,
                timeout_ms: AtomicU64::new(rt.settings().rpc.call_timeout_ms),
                session: OnceLock::new(),
                sequence: AtomicU32::new(0),
                pending: CoMutex::new(HashMap::new()),
                outbound: Channel::new(64),
                subscriptions: CoMutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                heart_timer: Mutex::new(None),
            }),
        }
    }

    /// Per-call reply deadline in milliseconds.
    pub fn set_timeout(&self, timeout_ms: u64) {
        self.inner.timeout_ms.store(timeout_ms, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
            || self
                .inner
                .session
                .get()
                .is_none_or(|session| !session.is_connected())
    }

    /// The server's address, once connected.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.session.get()?.peer_addr().ok()
    }

    /// Connect and start the sender/receiver tasks (and the heartbeat, when
    /// enabled).
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connect fails or the client was already
    /// connected.
    pub async fn connect(&self, addr: SocketAddr) -> miette::Result<()> {
        let stream = TcpStream::connect(&self.inner.rt, addr)
            .await
            .into_diagnostic()?;
        let session = RpcSession::new(stream);
        self.inner
            .session
            .set(session.clone())
            .map_err(|_| miette!("client already connected"))?;

        // Sender: outbound channel -> session.
        {
            let inner = self.inner.clone();
            let session = session.clone();
            self.inner.rt.spawn(async move {
                while let Some(frame) = inner.outbound.pop().await {
                    if let Err(error) = session.send_protocol(&frame).await {
                        tracing::debug!(%error, "client send failed");
                        break;
                    }
                }
                ClientInner::close_session(&inner).await;
            });
        }

        // Receiver: session -> pending callers / publish handlers.
        {
            let inner = self.inner.clone();
            let session = session.clone();
            self.inner.rt.spawn(async move {
                loop {
                    match session.recv_protocol().await {
                        Ok(Some(frame)) => inner.dispatch(frame).await,
                        _ => break,
                    }
                }
                ClientInner::close_session(&inner).await;
            });
        }

        if self.inner.auto_heartbeat {
            let weak = Arc::downgrade(&self.inner);
            let heart = self.inner.rt.add_timer(
                HEART_PERIOD_MS,
                move || {
                    if let Some(inner) = weak.upgrade() {
                        let rt = inner.rt.clone();
                        rt.spawn(async move {
                            inner.outbound.push(Protocol::heartbeat()).await;
                        });
                    }
                },
                true,
            );
            *self.inner.heart_timer.lock().expect("heart timer lock") = Some(heart);
        }
        Ok(())
    }

    /// Close the connection; every parked caller resolves with
    /// [`RpcCode::Closed`].
    pub async fn close(&self) {
        if let Some(session) = self.inner.session.get() {
            session.close();
        }
        ClientInner::close_session(&self.inner).await;
    }

    /// Invoke `name` with `args` (an [`Encode`] tuple) and wait for the
    /// typed result.
    pub async fn call<R, A>(&self, name: &str, args: A) -> RpcResult<R>
    where
        R: Decode,
        A: Encode,
    {
        if self.is_closed() {
            return RpcResult::error(RpcCode::Closed, "socket closed");
        }

        let reply: Channel<Protocol> = Channel::new(1);
        let id = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        self.inner.pending.lock().await.insert(id, reply.clone());

        let mut s = Serializer::new();
        s.write(name).write(&args);
        s.reset();
        let request = Protocol::new(MsgType::RpcMethodRequest, s.to_bytes(), id);

        if !self.inner.outbound.push(request).await {
            self.inner.pending.lock().await.remove(&id);
            return RpcResult::error(RpcCode::Closed, "socket closed");
        }

        let timeout = self.inner.timeout_ms.load(Ordering::Acquire);
        let outcome = reply.pop_timeout(timeout).await;
        self.inner.pending.lock().await.remove(&id);

        match outcome {
            Err(PopTimeoutError::Timeout) => RpcResult::error(RpcCode::Timeout, "call timeout"),
            Err(PopTimeoutError::Closed) => RpcResult::error(RpcCode::Closed, "socket closed"),
            Ok(response) => {
                if response.content().is_empty() {
                    return RpcResult::error(RpcCode::NoMethod, "method not found");
                }
                let mut s = Serializer::from_bytes(response.content());
                match s.read::<RpcResult<R>>() {
                    Ok(result) => result,
                    Err(_) => RpcResult::error(RpcCode::NoMatch, "return value not match"),
                }
            }
        }
    }

    /// Fire-and-forget variant: spawns the call and hands the result to
    /// `callback`.
    pub fn call_with<R, A, F>(&self, name: &str, args: A, callback: F)
    where
        R: Decode + Send + 'static,
        A: Encode + Send + 'static,
        F: FnOnce(RpcResult<R>) + Send + 'static,
    {
        let client = self.clone();
        let name = name.to_string();
        self.inner.rt.spawn(async move {
            callback(client.call::<R, A>(&name, args).await);
        });
    }

    /// Asynchronous variant: the returned channel receives exactly one
    /// result.
    pub fn async_call<R, A>(&self, name: &str, args: A) -> Channel<RpcResult<R>>
    where
        R: Decode + Send + 'static,
        A: Encode + Send + 'static,
    {
        let chan: Channel<RpcResult<R>> = Channel::new(1);
        let out = chan.clone();
        let client = self.clone();
        let name = name.to_string();
        self.inner.rt.spawn(async move {
            let result = client.call::<R, A>(&name, args).await;
            out.push(result).await;
        });
        chan
    }

    /// Route published messages for `topic` to `handler`. Subscribing to
    /// the same topic twice is an error.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> miette::Result<()>
    where
        F: Fn(&mut Serializer) + Send + Sync + 'static,
    {
        {
            let mut subscriptions = self.inner.subscriptions.lock().await;
            if subscriptions.contains_key(topic) {
                return Err(miette!("duplicated subscribe: {topic}"));
            }
            subscriptions.insert(topic.to_string(), Arc::new(handler));
        }
        let mut s = Serializer::new();
        s.write(topic);
        s.reset();
        let frame = Protocol::new(MsgType::RpcSubscribeRequest, s.to_bytes(), 0);
        if self.inner.outbound.push(frame).await {
            Ok(())
        } else {
            Err(miette!("socket closed"))
        }
    }
}

impl ClientInner {
    async fn dispatch(&self, frame: Protocol) {
        match frame.msg_type() {
            MsgType::RpcMethodResponse => {
                let reply = self
                    .pending
                    .lock()
                    .await
                    .get(&frame.sequence_id())
                    .cloned();
                match reply {
                    Some(chan) => {
                        chan.push(frame).await;
                    }
                    None => {
                        tracing::debug!(seq = frame.sequence_id(), "late response dropped");
                    }
                }
            }
            MsgType::RpcPublishRequest => {
                let mut s = Serializer::from_bytes(frame.content());
                let Ok(topic) = s.read::<String>() else {
                    tracing::warn!("publish frame without a topic");
                    return;
                };
                let handler = self.subscriptions.lock().await.get(&topic).cloned();
                if let Some(handler) = handler {
                    handler(&mut s);
                } else {
                    tracing::debug!(topic = %topic, "publish for unknown topic");
                }
                self.outbound
                    .push(Protocol::new(
                        MsgType::RpcPublishResponse,
                        Vec::new(),
                        frame.sequence_id(),
                    ))
                    .await;
            }
            MsgType::RpcSubscribeResponse | MsgType::HeartbeatPacket => {
                tracing::trace!(msg_type = %frame.msg_type(), "consumed");
            }
            other => {
                tracing::debug!(msg_type = %other, "unexpected frame on client");
            }
        }
    }

    /// Idempotent teardown: wakes parked callers with a closed channel and
    /// stops the heartbeat.
    async fn close_session(inner: &Arc<Self>) {
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("client session closing");
        if let Some(heart) = inner.heart_timer.lock().expect("heart timer lock").take() {
            heart.cancel();
        }
        inner.outbound.close().await;
        let channels: Vec<Channel<Protocol>> = {
            let mut pending = inner.pending.lock().await;
            pending.drain().map(|(_, chan)| chan).collect()
        };
        for chan in channels {
            chan.close().await;
        }
        if let Some(session) = inner.session.get() {
            session.close();
        }
    }
}
