// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Connection pool with service discovery, load balancing and failover.
//!
//! The pool holds one registry session and, per service name, at most one
//! active [`RpcClient`]. A call prefers the active client; a closed client
//! is evicted together with its cached address and the call falls through
//! to discovery → strategy selection → fresh connect. Discovery is
//! single-flight per service: concurrent callers for the same name await
//! the one in-flight request instead of stampeding the registry.
//!
//! The pool also subscribes to the reserved liveness topic of every
//! service it discovers, so registry up/down broadcasts keep the address
//! cache warm without another round-trip.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use miette::{IntoDiagnostic, miette};

use crate::net::TcpStream;
use crate::runtime::{Runtime, TimerHandle};
use crate::sync::{Channel, CoMutex, PopTimeoutError};

use super::client::{RpcClient, SubscribeHandler};
use super::protocol::{MsgType, Protocol};
use super::route::{RouteStrategy, Strategy, make_strategy};
use super::serializer::{Decode, Encode, Serializer};
use super::session::RpcSession;
use super::{RpcCode, RpcResult, SERVICE_SUBSCRIBE_PREFIX};

const HEART_PERIOD_MS: u64 = 30_000;

struct PoolInner {
    rt: Arc<Runtime>,
    timeout_ms: AtomicU64,
    strategy: Box<dyn RouteStrategy<String>>,
    registry: OnceLock<Arc<RpcSession>>,
    outbound: Channel<Protocol>,
    /// service -> discovered provider addresses.
    cache: CoMutex<HashMap<String, Vec<String>>>,
    /// service -> the client currently carrying its calls.
    active: CoMutex<HashMap<String, RpcClient>>,
    /// service -> reply channel of the in-flight discovery.
    discoveries: CoMutex<HashMap<String, Channel<Protocol>>>,
    subscriptions: CoMutex<HashMap<String, SubscribeHandler>>,
    closed: AtomicBool,
    heart_timer: Mutex<Option<TimerHandle>>,
}

impl std::fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClientPool")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct RpcClientPool {
    inner: Arc<PoolInner>,
}

impl RpcClientPool {
    #[must_use]
    pub fn new(rt: &Arc<Runtime>) -> Self {
        Self::with_strategy(rt, Strategy::Random)
    }

    #[must_use]
    pub fn with_strategy(rt: &Arc<Runtime>, strategy: Strategy) -> Self {
        Self::with_route(rt, make_strategy(strategy, String::new()))
    }

    /// Full control over provider selection (seeded randomness in tests,
    /// hash keys for session affinity).
    #[must_use]
    pub fn with_route(rt: &Arc<Runtime>, strategy: Box<dyn RouteStrategy<String>>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                rt: rt.clone(),
                timeout_ms: AtomicU64::new(rt.settings().rpc.call_timeout_ms),
                strategy,
                registry: OnceLock::new(),
                outbound: Channel::new(64),
                cache: CoMutex::new(HashMap::new()),
                active: CoMutex::new(HashMap::new()),
                discoveries: CoMutex::new(HashMap::new()),
                subscriptions: CoMutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                heart_timer: Mutex::new(None),
            }),
        }
    }

    pub fn set_timeout(&self, timeout_ms: u64) {
        self.inner.timeout_ms.store(timeout_ms, Ordering::Release);
    }

    /// Connect the registry session and start its sender/receiver tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry is unreachable or the pool was
    /// already connected.
    pub async fn connect(&self, registry_addr: SocketAddr) -> miette::Result<()> {
        let stream = TcpStream::connect(&self.inner.rt, registry_addr)
            .await
            .into_diagnostic()?;
        let session = RpcSession::new(stream);
        self.inner
            .registry
            .set(session.clone())
            .map_err(|_| miette!("pool already connected"))?;

        {
            let inner = self.inner.clone();
            let session = session.clone();
            self.inner.rt.spawn(async move {
                while let Some(frame) = inner.outbound.pop().await {
                    if let Err(error) = session.send_protocol(&frame).await {
                        tracing::debug!(%error, "pool send failed");
                        break;
                    }
                }
                PoolInner::close_registry(&inner).await;
            });
        }
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
                PoolInner::close_registry(&inner).await;
            });
        }

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
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Call `name` on some provider, discovering and connecting as needed.
    pub async fn call<R, A>(&self, name: &str, args: A) -> RpcResult<R>
    where
        R: Decode,
        A: Encode + Clone,
    {
        // 1. Prefer the active client; evict it (and its cached address)
        //    when the connection turns out dead.
        let active = self.inner.active.lock().await.get(name).cloned();
        if let Some(client) = active {
            let result = client.call::<R, A>(name, args.clone()).await;
            if result.code() != RpcCode::Closed {
                return result;
            }
            tracing::info!(service = name, "active client closed; evicting");
            self.inner.active.lock().await.remove(name);
            if let Some(addr) = client.remote_addr() {
                let addr = addr.to_string();
                let mut cache = self.inner.cache.lock().await;
                if let Some(addrs) = cache.get_mut(name) {
                    addrs.retain(|a| *a != addr);
                }
            }
        }

        // 2. Addresses from the cache, or a discovery round-trip.
        let mut addrs = self.inner.cache.lock().await.get(name).cloned().unwrap_or_default();
        if addrs.is_empty() {
            let registry_up = self
                .inner
                .registry
                .get()
                .is_some_and(|s| s.is_connected());
            if !registry_up {
                return RpcResult::error(RpcCode::Closed, "registry closed");
            }
            addrs = self.inner.discover(name).await;
            if addrs.is_empty() {
                return RpcResult::error(RpcCode::NoMethod, format!("no method: {name}"));
            }
        }

        // 3. Strategy picks a provider; 4. fresh client becomes active.
        let selected = self.inner.strategy.select(&addrs).clone();
        if let Ok(addr) = selected.parse::<SocketAddr>() {
            let client = RpcClient::new(&self.inner.rt);
            if client.connect(addr).await.is_ok() {
                self.inner
                    .active
                    .lock()
                    .await
                    .insert(name.to_string(), client.clone());
                return client.call::<R, A>(name, args).await;
            }
            tracing::warn!(service = name, provider = %selected, "provider connect failed");
        } else {
            tracing::warn!(service = name, provider = %selected, "unparsable provider address");
        }

        RpcResult::error(RpcCode::Fail, "call fail")
    }

    /// Spawned variant delivering the result to `callback`.
    pub fn call_with<R, A, F>(&self, name: &str, args: A, callback: F)
    where
        R: Decode + Send + 'static,
        A: Encode + Clone + Send + 'static,
        F: FnOnce(RpcResult<R>) + Send + 'static,
    {
        let pool = self.clone();
        let name = name.to_string();
        self.inner.rt.spawn(async move {
            callback(pool.call::<R, A>(&name, args).await);
        });
    }

    /// Asynchronous variant: the returned channel receives exactly one
    /// result.
    pub fn async_call<R, A>(&self, name: &str, args: A) -> Channel<RpcResult<R>>
    where
        R: Decode + Send + 'static,
        A: Encode + Clone + Send + 'static,
    {
        let chan: Channel<RpcResult<R>> = Channel::new(1);
        let out = chan.clone();
        let pool = self.clone();
        let name = name.to_string();
        self.inner.rt.spawn(async move {
            out.push(pool.call::<R, A>(&name, args).await).await;
        });
        chan
    }

    /// Subscribe to `topic` on the registry session.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate subscription or a closed registry
    /// session.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> miette::Result<()>
    where
        F: Fn(&mut Serializer) + Send + Sync + 'static,
    {
        self.inner.subscribe_with(topic, Arc::new(handler)).await
    }

    /// Tear down the registry session and every active client.
    pub async fn close(&self) {
        PoolInner::close_registry(&self.inner).await;
        let clients: Vec<RpcClient> = {
            let mut active = self.inner.active.lock().await;
            active.drain().map(|(_, client)| client).collect()
        };
        for client in clients {
            client.close().await;
        }
    }

    /// Cached provider addresses for `name` (test and ops visibility).
    pub async fn cached_providers(&self, name: &str) -> Vec<String> {
        self.inner.cache.lock().await.get(name).cloned().unwrap_or_default()
    }
}

impl PoolInner {
    /// Single-flight discovery. The leader sends the request, parses the
    /// response into the cache and closes the channel; followers wake on
    /// the close and read the cache.
    async fn discover(self: &Arc<Self>, name: &str) -> Vec<String> {
        let (chan, leader) = {
            let mut discoveries = self.discoveries.lock().await;
            match discoveries.get(name) {
                Some(chan) => (chan.clone(), false),
                None => {
                    let chan: Channel<Protocol> = Channel::new(1);
                    discoveries.insert(name.to_string(), chan.clone());
                    (chan, true)
                }
            }
        };

        if !leader {
            let _unused = chan.pop().await;
            return self.cache.lock().await.get(name).cloned().unwrap_or_default();
        }

        let request = Protocol::new(MsgType::RpcServiceDiscover, name.as_bytes().to_vec(), 0);
        let addrs = if self.outbound.push(request).await {
            let timeout = self.timeout_ms.load(Ordering::Acquire);
            match chan.pop_timeout(timeout).await {
                Ok(response) => Self::parse_discovery(&response),
                Err(PopTimeoutError::Timeout) => {
                    tracing::warn!(service = name, "discovery timed out");
                    Vec::new()
                }
                Err(PopTimeoutError::Closed) => Vec::new(),
            }
        } else {
            Vec::new()
        };

        if !addrs.is_empty() {
            self.cache
                .lock()
                .await
                .insert(name.to_string(), addrs.clone());
            self.watch_service(name).await;
        }

        self.discoveries.lock().await.remove(name);
        chan.close().await;
        addrs
    }

    fn parse_discovery(frame: &Protocol) -> Vec<String> {
        let mut s = Serializer::from_bytes(frame.content());
        let Ok(_service) = s.read::<String>() else {
            return Vec::new();
        };
        let Ok(count) = s.read::<u32>() else {
            return Vec::new();
        };
        let mut addrs = Vec::new();
        for _ in 0..count {
            match s.read::<RpcResult<String>>() {
                Ok(result) if result.is_ok() => {
                    if let Some(addr) = result.into_value() {
                        addrs.push(addr);
                    }
                }
                Ok(result) => {
                    tracing::debug!(code = %result.code(), msg = result.msg(), "discovery miss");
                }
                Err(_) => break,
            }
        }
        addrs
    }

    /// Subscribe to the reserved liveness topic for `name` and mutate the
    /// cache on up/down events.
    async fn watch_service(self: &Arc<Self>, name: &str) {
        let topic = format!("{SERVICE_SUBSCRIBE_PREFIX}{name}");
        if self.subscriptions.lock().await.contains_key(&topic) {
            return;
        }
        let weak: Weak<PoolInner> = Arc::downgrade(self);
        let service = name.to_string();
        let handler: SubscribeHandler = Arc::new(move |s: &mut Serializer| {
            let Ok((up, address)) = s.read::<(bool, String)>() else {
                tracing::warn!("malformed service liveness event");
                return;
            };
            let Some(inner) = weak.upgrade() else { return };
            let service = service.clone();
            let rt = inner.rt.clone();
            rt.spawn(async move {
                inner.apply_liveness(&service, up, &address).await;
            });
        });
        if let Err(error) = self.subscribe_with(&topic, handler).await {
            tracing::warn!(%error, topic = %topic, "service watch failed");
        }
    }

    async fn apply_liveness(&self, service: &str, up: bool, address: &str) {
        tracing::info!(service, address, up, "service liveness event");
        let mut cache = self.cache.lock().await;
        let addrs = cache.entry(service.to_string()).or_default();
        if up {
            if !addrs.iter().any(|a| a == address) {
                addrs.push(address.to_string());
            }
        } else {
            addrs.retain(|a| a != address);
            drop(cache);
            // The active client may be the one that just went away.
            let evict = {
                let active = self.active.lock().await;
                active
                    .get(service)
                    .and_then(RpcClient::remote_addr)
                    .is_some_and(|a| a.to_string() == address)
            };
            if evict {
                self.active.lock().await.remove(service);
            }
        }
    }

    async fn subscribe_with(&self, topic: &str, handler: SubscribeHandler) -> miette::Result<()> {
        {
            let mut subscriptions = self.subscriptions.lock().await;
            if subscriptions.contains_key(topic) {
                return Err(miette!("duplicated subscribe: {topic}"));
            }
            subscriptions.insert(topic.to_string(), handler);
        }
        let mut s = Serializer::new();
        s.write(topic);
        s.reset();
        let frame = Protocol::new(MsgType::RpcSubscribeRequest, s.to_bytes(), 0);
        if self.outbound.push(frame).await {
            Ok(())
        } else {
            Err(miette!("registry session closed"))
        }
    }

    async fn dispatch(&self, frame: Protocol) {
        match frame.msg_type() {
            MsgType::RpcServiceDiscoverResponse => {
                let mut s = Serializer::from_bytes(frame.content());
                let Ok(service) = s.read::<String>() else {
                    tracing::warn!("discovery response without a service name");
                    return;
                };
                let chan = self.discoveries.lock().await.get(&service).cloned();
                match chan {
                    Some(chan) => {
                        chan.push(frame).await;
                    }
                    None => tracing::debug!(service = %service, "unsolicited discovery response"),
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
                tracing::debug!(msg_type = %other, "unexpected frame on pool session");
            }
        }
    }

    async fn close_registry(inner: &Arc<Self>) {
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("pool registry session closing");
        if let Some(heart) = inner.heart_timer.lock().expect("heart timer lock").take() {
            heart.cancel();
        }
        inner.outbound.close().await;
        let channels: Vec<Channel<Protocol>> = {
            let mut discoveries = inner.discoveries.lock().await;
            discoveries.drain().map(|(_, chan)| chan).collect()
        };
        for chan in channels {
            chan.close().await;
        }
        if let Some(session) = inner.registry.get() {
            session.close();
        }
    }
}
