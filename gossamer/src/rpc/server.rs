// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! RPC server: typed method registry, per-connection protocol loop,
//! heartbeat liveness, publish/subscribe, and optional self-registration
//! with a service registry.
//!
//! A handler is any `Fn(Args) -> R` where `Args` is a [`Decode`] tuple and
//! `R` is [`Encode`]:
//!
//! ```no_run
//! # use gossamer::{Runtime, Settings, rpc::RpcServer};
//! # let rt = Runtime::new(Settings::default()).unwrap();
//! let server = RpcServer::bind(&rt, "127.0.0.1:0".parse().unwrap()).unwrap();
//! server.register("add", |(a, b): (i32, i32)| a + b);
//! server.register("echo", |(s,): (String,)| s);
//! ```
//!
//! The dispatch proxy converts the three failure classes into in-band
//! results: undecodable arguments become [`RpcCode::NoMatch`], an unknown
//! method an empty response body (the client maps it to
//! [`RpcCode::NoMethod`]), and a panicking handler [`RpcCode::Fail`];
//! handler faults never unwind into the connection loop.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use miette::IntoDiagnostic;

use crate::net::{TcpServer, TcpStream};
use crate::runtime::{Runtime, TimerHandle};
use crate::sync::{Channel, CoMutex};

use super::protocol::{MsgType, Protocol};
use super::serializer::{Decode, Encode, Serializer};
use super::session::RpcSession;
use super::{RpcCode, RpcResult, SubscriberMap, prune_dead_subscribers, publish_to_subscribers};

/// Registry heartbeat period; must stay under the registry's alive time.
const REGISTRY_HEART_PERIOD_MS: u64 = 30_000;

/// How often dead subscriptions are pruned.
const PRUNE_PERIOD_MS: u64 = 5_000;

type MethodHandler = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

pub(crate) fn encode_result<R: Encode>(result: &RpcResult<R>) -> Vec<u8> {
    let mut s = Serializer::new();
    s.write(result);
    s.reset();
    s.to_bytes()
}

struct ServerInner {
    rt: Arc<Runtime>,
    tcp: Arc<TcpServer>,
    handlers: RwLock<HashMap<String, MethodHandler>>,
    subscribers: SubscriberMap,
    alive_time_ms: u64,
    registry: Mutex<Option<Arc<RpcSession>>>,
    heart_timer: Mutex<Option<TimerHandle>>,
    /// Live client connections, closed on stop.
    connections: CoMutex<Vec<Weak<RpcSession>>>,
    stop_clean: AtomicBool,
    clean_chan: Channel<bool>,
}

impl std::fmt::Debug for ServerInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("name", &self.tcp.name())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    /// Bind the serving socket. Methods are registered afterwards and the
    /// server goes live on [`RpcServer::start`].
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub fn bind(rt: &Arc<Runtime>, addr: SocketAddr) -> miette::Result<Self> {
        let tcp = Arc::new(TcpServer::bind(rt, addr)?);
        tcp.set_name("RpcServer");
        Ok(Self {
            inner: Arc::new(ServerInner {
                rt: rt.clone(),
                tcp,
                handlers: RwLock::new(HashMap::new()),
                subscribers: CoMutex::new(HashMap::new()),
                alive_time_ms: rt.settings().rpc.heartbeat_timeout_ms,
                registry: Mutex::new(None),
                heart_timer: Mutex::new(None),
                connections: CoMutex::new(Vec::new()),
                stop_clean: AtomicBool::new(false),
                clean_chan: Channel::new(1),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.tcp.local_addr()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.inner.tcp.set_name(name);
    }

    /// Register `name` with a typed handler. The argument tuple and return
    /// value go through the [`Serializer`]; see the module docs for the
    /// error mapping.
    pub fn register<A, R, F>(&self, name: &str, f: F)
    where
        A: Decode + 'static,
        R: Encode + 'static,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        let proxy = move |body: &[u8]| -> Vec<u8> {
            let mut s = Serializer::from_bytes(body);
            let args: A = match s.read() {
                Ok(args) => args,
                Err(_) => {
                    return encode_result(&RpcResult::<R>::error(
                        RpcCode::NoMatch,
                        "params not match",
                    ));
                }
            };
            match catch_unwind(AssertUnwindSafe(|| f(args))) {
                Ok(value) => encode_result(&RpcResult::success(value)),
                Err(_) => encode_result(&RpcResult::<R>::error(RpcCode::Fail, "method failed")),
            }
        };
        self.inner
            .handlers
            .write()
            .expect("handler table lock")
            .insert(name.to_string(), Box::new(proxy));
        tracing::debug!(method = name, "method registered");
    }

    /// Connect the long-lived registry session and announce this server as
    /// a provider (our public port rides in the payload, since the
    /// session's source port is ephemeral).
    ///
    /// # Errors
    ///
    /// Returns an error if the registry is unreachable or the announcement
    /// cannot be written.
    pub async fn bind_registry(&self, addr: SocketAddr) -> miette::Result<()> {
        let stream = TcpStream::connect(&self.inner.rt, addr)
            .await
            .into_diagnostic()?;
        let session = RpcSession::new(stream);
        let port = self.local_addr().into_diagnostic()?.port();

        let mut s = Serializer::new();
        s.write(&u32::from(port));
        s.reset();
        session
            .send_protocol(&Protocol::new(MsgType::RpcProvider, s.to_bytes(), 0))
            .await
            .into_diagnostic()?;
        tracing::info!(registry = %addr, port, "announced as provider");

        *self.inner.registry.lock().expect("registry slot lock") = Some(session.clone());

        // Drain registry traffic: register acks and heartbeat echoes.
        self.inner.rt.spawn(async move {
            loop {
                match session.recv_protocol().await {
                    Ok(Some(frame)) => match frame.msg_type() {
                        MsgType::RpcServiceRegisterResponse => {
                            let mut s = Serializer::from_bytes(frame.content());
                            match s.read::<RpcResult<String>>() {
                                Ok(ack) if ack.is_ok() => tracing::info!(
                                    service = ack.value().map(String::as_str).unwrap_or(""),
                                    "service registered"
                                ),
                                _ => tracing::warn!("registry rejected a registration"),
                            }
                        }
                        MsgType::HeartbeatPacket => {
                            tracing::trace!("registry heartbeat echo");
                        }
                        other => tracing::debug!(msg_type = %other, "registry frame ignored"),
                    },
                    _ => {
                        tracing::warn!("registry session lost");
                        break;
                    }
                }
            }
        });

        // Keep the registry session alive under its 40 s kill-timer.
        let weak = Arc::downgrade(&self.inner);
        let heart = self.inner.rt.add_timer(
            REGISTRY_HEART_PERIOD_MS,
            move || {
                if let Some(inner) = weak.upgrade() {
                    let session = inner.registry.lock().expect("registry slot lock").clone();
                    if let Some(session) = session {
                        inner.rt.spawn(async move {
                            if session.send_protocol(&Protocol::heartbeat()).await.is_err() {
                                tracing::warn!("registry heartbeat failed");
                            }
                        });
                    }
                }
            },
            true,
        );
        *self.inner.heart_timer.lock().expect("heart timer lock") = Some(heart);
        Ok(())
    }

    /// Go live: register every method with the registry (when bound),
    /// start the subscription pruner, then accept connections.
    pub async fn start(&self) {
        let names: Vec<String> = {
            let handlers = self.inner.handlers.read().expect("handler table lock");
            handlers.keys().cloned().collect()
        };
        for name in names {
            self.register_service(&name).await;
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner.rt.spawn(async move {
            loop {
                // Sleep in slices so stop is observed promptly.
                for _ in 0..(PRUNE_PERIOD_MS / 500) {
                    crate::runtime::sleep_ms(500).await;
                    let Some(inner) = weak.upgrade() else { return };
                    if inner.stop_clean.load(Ordering::Acquire) {
                        inner.clean_chan.push(true).await;
                        return;
                    }
                }
                let Some(inner) = weak.upgrade() else { return };
                prune_dead_subscribers(&inner.subscribers).await;
            }
        });

        let inner = self.inner.clone();
        self.inner
            .tcp
            .start(move |stream| Self::handle_client(inner.clone(), stream));
    }

    async fn register_service(&self, name: &str) {
        let session = self
            .inner
            .registry
            .lock()
            .expect("registry slot lock")
            .clone();
        let Some(session) = session else { return };
        let frame = Protocol::new(MsgType::RpcServiceRegister, name.as_bytes().to_vec(), 0);
        if let Err(error) = session.send_protocol(&frame).await {
            tracing::error!(service = name, %error, "service registration failed");
        }
    }

    async fn handle_client(inner: Arc<ServerInner>, stream: TcpStream) {
        let session = RpcSession::new(stream.clone());
        {
            let mut connections = inner.connections.lock().await;
            connections.retain(|weak| weak.upgrade().is_some_and(|s| s.is_connected()));
            connections.push(Arc::downgrade(&session));
        }
        // Closes the connection when no frame arrives within the alive
        // window; every inbound frame refreshes it.
        let kill_timer = {
            let stream = stream.clone();
            inner.rt.add_timer(
                inner.alive_time_ms,
                move || {
                    tracing::debug!("connection heartbeat expired");
                    stream.shutdown();
                },
                false,
            )
        };

        loop {
            let frame = match session.recv_protocol().await {
                Ok(Some(frame)) => frame,
                _ => break,
            };
            kill_timer.refresh();

            match frame.msg_type() {
                MsgType::HeartbeatPacket => {
                    if session.send_protocol(&Protocol::heartbeat()).await.is_err() {
                        break;
                    }
                }
                MsgType::RpcMethodRequest => {
                    let body = inner.dispatch_call(frame.content());
                    let response =
                        Protocol::new(MsgType::RpcMethodResponse, body, frame.sequence_id());
                    if session.send_protocol(&response).await.is_err() {
                        break;
                    }
                }
                MsgType::RpcSubscribeRequest => {
                    let response = inner.handle_subscribe(&frame, &session).await;
                    if session.send_protocol(&response).await.is_err() {
                        break;
                    }
                }
                MsgType::RpcPublishResponse => {}
                other => {
                    tracing::warn!(msg_type = %other, "unexpected frame on server connection");
                }
            }
        }
        kill_timer.cancel();
        session.close();
    }

    /// Push `(topic, value)` to every live subscriber of `topic`.
    pub async fn publish<T: Encode>(&self, topic: &str, value: T) {
        {
            let subscribers = self.inner.subscribers.lock().await;
            if subscribers.is_empty() {
                return;
            }
        }
        let mut s = Serializer::new();
        s.write(topic).write(&value);
        s.reset();
        let frame = Protocol::new(MsgType::RpcPublishRequest, s.to_bytes(), 0);
        publish_to_subscribers(&self.inner.subscribers, topic, &frame).await;
    }

    /// Stop accepting, close live connections, stop the pruner (with
    /// handshake), drop the registry session.
    pub async fn stop(&self) {
        self.inner.tcp.stop();
        let live: Vec<Arc<RpcSession>> = {
            let mut connections = self.inner.connections.lock().await;
            connections.drain(..).filter_map(|weak| weak.upgrade()).collect()
        };
        for session in live {
            session.close();
        }
        self.inner.stop_clean.store(true, Ordering::Release);
        let _unused = self.inner.clean_chan.pop_timeout(PRUNE_PERIOD_MS + 1000).await;
        if let Some(heart) = self.inner.heart_timer.lock().expect("heart timer lock").take() {
            heart.cancel();
        }
        let registry = self.inner.registry.lock().expect("registry slot lock").take();
        if let Some(session) = registry {
            session.close();
        }
    }
}

impl ServerInner {
    /// name + args in, serialized [`RpcResult`] out. Empty response body
    /// means "no such method".
    fn dispatch_call(&self, body: &[u8]) -> Vec<u8> {
        let mut s = Serializer::from_bytes(body);
        let name: String = match s.read() {
            Ok(name) => name,
            Err(error) => {
                tracing::warn!(%error, "undecodable method request");
                return Vec::new();
            }
        };
        let args = s.to_bytes();
        let handlers = self.handlers.read().expect("handler table lock");
        match handlers.get(&name) {
            Some(handler) => handler(&args),
            None => {
                tracing::warn!(method = %name, "unknown method");
                Vec::new()
            }
        }
    }

    async fn handle_subscribe(&self, frame: &Protocol, session: &Arc<RpcSession>) -> Protocol {
        let mut s = Serializer::from_bytes(frame.content());
        let body = match s.read::<String>() {
            Ok(topic) => {
                self.subscribers
                    .lock()
                    .await
                    .entry(topic.clone())
                    .or_default()
                    .push(Arc::downgrade(session));
                tracing::debug!(topic = %topic, "subscriber added");
                encode_result(&RpcResult::success(()))
            }
            Err(_) => encode_result(&RpcResult::<()>::error(RpcCode::NoMatch, "bad topic")),
        };
        Protocol::new(MsgType::RpcSubscribeResponse, body, frame.sequence_id())
    }
}
