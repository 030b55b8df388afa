// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Service registry: the rendezvous point between providers and the client
//! pool.
//!
//! A provider connects, announces its public port (`RpcProvider`), then
//! registers each service name. The registry keeps a service → address
//! multimap plus a reverse index so a dropped provider connection erases
//! all of its registrations at once. Every registration and every erasure
//! is broadcast on the reserved topic
//! `"[[rpc service subscribe]]" + service` as `(up, address)`, which is how
//! pools keep their discovery caches warm without polling.
//!
//! Liveness mirrors the RPC server: a per-connection kill-timer refreshed
//! by any inbound frame, and a periodic sweep of dead subscriber sessions.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::net::{TcpServer, TcpStream};
use crate::runtime::Runtime;
use crate::sync::{Channel, CoMutex};

use super::protocol::{MsgType, Protocol};
use super::serializer::Serializer;
use super::server::encode_result;
use super::session::RpcSession;
use super::{
    RpcCode, RpcResult, SERVICE_SUBSCRIBE_PREFIX, SubscriberMap, prune_dead_subscribers,
    publish_to_subscribers,
};

const PRUNE_PERIOD_MS: u64 = 5_000;

/// service name -> provider addresses, plus the reverse view for teardown.
#[derive(Debug, Default)]
struct ServiceTable {
    by_service: BTreeMap<String, Vec<String>>,
    by_address: HashMap<String, Vec<String>>,
}

impl ServiceTable {
    fn register(&mut self, service: &str, address: &str) {
        self.by_service
            .entry(service.to_string())
            .or_default()
            .push(address.to_string());
        self.by_address
            .entry(address.to_string())
            .or_default()
            .push(service.to_string());
    }

    /// Remove every registration under `address`, returning the affected
    /// service names (one entry per registration).
    fn unregister_address(&mut self, address: &str) -> Vec<String> {
        let Some(services) = self.by_address.remove(address) else {
            return Vec::new();
        };
        for service in &services {
            if let Some(addrs) = self.by_service.get_mut(service) {
                if let Some(pos) = addrs.iter().position(|a| a == address) {
                    addrs.remove(pos);
                }
                if addrs.is_empty() {
                    self.by_service.remove(service);
                }
            }
        }
        services
    }

    fn providers_of(&self, service: &str) -> Vec<String> {
        self.by_service.get(service).cloned().unwrap_or_default()
    }
}

struct RegistryInner {
    rt: Arc<Runtime>,
    tcp: Arc<TcpServer>,
    services: CoMutex<ServiceTable>,
    subscribers: SubscriberMap,
    alive_time_ms: u64,
    /// Live connections (providers and pools), closed on stop.
    connections: CoMutex<Vec<Weak<RpcSession>>>,
    stop_clean: AtomicBool,
    clean_chan: Channel<bool>,
}

impl std::fmt::Debug for RegistryInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServiceRegistry").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct RpcServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl RpcServiceRegistry {
    /// Bind the registry socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub fn bind(rt: &Arc<Runtime>, addr: SocketAddr) -> miette::Result<Self> {
        let tcp = Arc::new(TcpServer::bind(rt, addr)?);
        tcp.set_name("RpcServiceRegistry");
        Ok(Self {
            inner: Arc::new(RegistryInner {
                rt: rt.clone(),
                tcp,
                services: CoMutex::new(ServiceTable::default()),
                subscribers: CoMutex::new(HashMap::new()),
                alive_time_ms: rt.settings().rpc.heartbeat_timeout_ms,
                connections: CoMutex::new(Vec::new()),
                stop_clean: AtomicBool::new(false),
                clean_chan: Channel::new(1),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.tcp.local_addr()
    }

    /// Start the subscription pruner and the accept loop.
    pub fn start(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.rt.spawn(async move {
            loop {
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
            .start(move |stream| RegistryInner::handle_client(inner.clone(), stream));
    }

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
    }

    /// Current provider list for `service` (test and ops visibility).
    pub async fn providers_of(&self, service: &str) -> Vec<String> {
        self.inner.services.lock().await.providers_of(service)
    }
}

impl RegistryInner {
    async fn handle_client(inner: Arc<Self>, stream: TcpStream) {
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(error) => {
                tracing::warn!(%error, "registry connection without a peer address");
                return;
            }
        };
        let session = RpcSession::new(stream.clone());
        {
            let mut connections = inner.connections.lock().await;
            connections.retain(|weak| weak.upgrade().is_some_and(|s| s.is_connected()));
            connections.push(Arc::downgrade(&session));
        }
        let kill_timer = {
            let stream = stream.clone();
            inner.rt.add_timer(
                inner.alive_time_ms,
                move || {
                    tracing::debug!("registry connection heartbeat expired");
                    stream.shutdown();
                },
                false,
            )
        };

        // Set once the peer announces itself as a provider; used to erase
        // its registrations when the connection dies.
        let mut provider_addr: Option<String> = None;

        loop {
            let frame = match session.recv_protocol().await {
                Ok(Some(frame)) => frame,
                _ => break,
            };
            kill_timer.refresh();

            let response = match frame.msg_type() {
                MsgType::HeartbeatPacket => Protocol::heartbeat(),
                MsgType::RpcProvider => {
                    provider_addr = Self::handle_provider(&frame, peer);
                    continue;
                }
                MsgType::RpcServiceRegister => {
                    match &provider_addr {
                        Some(address) => inner.handle_register(&frame, address).await,
                        None => {
                            tracing::warn!(peer = %peer, "register before provider announcement");
                            continue;
                        }
                    }
                }
                MsgType::RpcServiceDiscover => inner.handle_discover(&frame).await,
                MsgType::RpcSubscribeRequest => inner.handle_subscribe(&frame, &session).await,
                MsgType::RpcPublishResponse => continue,
                other => {
                    tracing::warn!(msg_type = %other, peer = %peer, "unexpected registry frame");
                    continue;
                }
            };

            if session.send_protocol(&response).await.is_err() {
                break;
            }
        }

        kill_timer.cancel();
        session.close();
        if let Some(address) = provider_addr {
            tracing::warn!(provider = %address, "provider connection lost; unregistering");
            inner.unregister_provider(&address).await;
        }
    }

    /// The provider's externally-visible address: its socket's remote IP
    /// with the announced port overriding the ephemeral source port.
    fn handle_provider(frame: &Protocol, peer: SocketAddr) -> Option<String> {
        let mut s = Serializer::from_bytes(frame.content());
        let port: u32 = match s.read() {
            Ok(port) => port,
            Err(error) => {
                tracing::warn!(%error, "undecodable provider announcement");
                return None;
            }
        };
        let address = SocketAddr::new(peer.ip(), port as u16);
        tracing::info!(provider = %address, "provider announced");
        Some(address.to_string())
    }

    async fn handle_register(&self, frame: &Protocol, address: &str) -> Protocol {
        let service = String::from_utf8_lossy(frame.content()).into_owned();
        self.services.lock().await.register(&service, address);
        tracing::info!(service = %service, provider = %address, "service up");

        self.publish_liveness(&service, true, address).await;

        let body = encode_result(&RpcResult::success(service));
        Protocol::new(MsgType::RpcServiceRegisterResponse, body, frame.sequence_id())
    }

    async fn handle_discover(&self, frame: &Protocol) -> Protocol {
        let service = String::from_utf8_lossy(frame.content()).into_owned();
        let providers = self.services.lock().await.providers_of(&service);

        let results: Vec<RpcResult<String>> = if providers.is_empty() {
            vec![RpcResult::error(
                RpcCode::NoMethod,
                format!("discover service: {service}"),
            )]
        } else {
            providers.into_iter().map(RpcResult::success).collect()
        };

        let mut s = Serializer::new();
        s.write(&service).write(&(results.len() as u32));
        for result in &results {
            s.write(result);
        }
        s.reset();
        Protocol::new(
            MsgType::RpcServiceDiscoverResponse,
            s.to_bytes(),
            frame.sequence_id(),
        )
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
                tracing::debug!(topic = %topic, "registry subscriber added");
                encode_result(&RpcResult::success(()))
            }
            Err(_) => encode_result(&RpcResult::<()>::error(RpcCode::NoMatch, "bad topic")),
        };
        Protocol::new(MsgType::RpcSubscribeResponse, body, frame.sequence_id())
    }

    async fn unregister_provider(&self, address: &str) {
        let services = self.services.lock().await.unregister_address(address);
        for service in services {
            tracing::info!(service = %service, provider = %address, "service down");
            self.publish_liveness(&service, false, address).await;
        }
    }

    /// Broadcast `(up, address)` on the reserved per-service topic.
    async fn publish_liveness(&self, service: &str, up: bool, address: &str) {
        let topic = format!("{SERVICE_SUBSCRIBE_PREFIX}{service}");
        {
            let subscribers = self.subscribers.lock().await;
            if !subscribers.contains_key(&topic) {
                return;
            }
        }
        let mut s = Serializer::new();
        s.write(&topic).write(&(up, address.to_string()));
        s.reset();
        let frame = Protocol::new(MsgType::RpcPublishRequest, s.to_bytes(), 0);
        publish_to_subscribers(&self.subscribers, &topic, &frame).await;
    }
}
