// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! End-to-end scenarios over real sockets: echo/add round trips, the
//! client error ladder, call timeout, publish/subscribe, and registry
//! discovery with failover.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use gossamer::config::Settings;
use gossamer::rpc::{
    RoundRobinStrategy, RpcClient, RpcClientPool, RpcCode, RpcServer, RpcServiceRegistry,
};
use gossamer::{Runtime, sleep_ms};

fn runtime(name: &str) -> Arc<Runtime> {
    let _unused = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
    let mut settings = Settings::default();
    settings.scheduler.threads = 4;
    settings.scheduler.name = name.into();
    Runtime::new(settings).unwrap()
}

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn math_server(rt: &Arc<Runtime>) -> RpcServer {
    let server = RpcServer::bind(rt, any_addr()).unwrap();
    server.register("add", |(a, b): (i32, i32)| a + b);
    server.register("echo", |(s,): (String,)| s);
    server
}

#[test]
fn echo_and_add_round_trip() {
    let rt = runtime("e2e_echo");
    let server = math_server(&rt);
    let addr = server.local_addr().unwrap();
    rt.block_on(server.start());

    let client = RpcClient::new(&rt);
    rt.block_on(async {
        client.connect(addr).await.unwrap();

        let echoed = client
            .call::<String, _>("echo", ("hello".to_string(),))
            .await;
        assert_eq!(echoed.code(), RpcCode::Success);
        assert_eq!(echoed.into_value().as_deref(), Some("hello"));

        let sum = client.call::<i32, _>("add", (123, 321)).await;
        assert_eq!(sum.code(), RpcCode::Success);
        assert_eq!(sum.into_value(), Some(444));

        client.close().await;
        server.stop().await;
    });
    rt.stop();
}

#[test]
fn error_ladder_no_method_no_match_fail_closed() {
    let rt = runtime("e2e_errors");
    let server = math_server(&rt);
    server.register("boom", |_: ()| -> i32 { panic!("handler bug") });
    let addr = server.local_addr().unwrap();
    rt.block_on(server.start());

    let client = RpcClient::new(&rt);
    rt.block_on(async {
        client.connect(addr).await.unwrap();

        let missing = client.call::<i32, _>("missing", (1,)).await;
        assert_eq!(missing.code(), RpcCode::NoMethod);

        // The response carries an i32; decoding it as a string fails.
        let mismatched = client.call::<String, _>("add", (123, 321)).await;
        assert_eq!(mismatched.code(), RpcCode::NoMatch);

        let panicked = client.call::<i32, _>("boom", ()).await;
        assert_eq!(panicked.code(), RpcCode::Fail);

        client.close().await;
        let closed = client.call::<i32, _>("add", (1, 2)).await;
        assert_eq!(closed.code(), RpcCode::Closed);

        server.stop().await;
    });
    rt.stop();
}

#[test]
fn slow_handler_hits_the_call_deadline() {
    let rt = runtime("e2e_timeout");
    let server = RpcServer::bind(&rt, any_addr()).unwrap();
    server.register("sleep", |_: ()| {
        std::thread::sleep(Duration::from_millis(1000));
    });
    let addr = server.local_addr().unwrap();
    rt.block_on(server.start());

    let client = RpcClient::new(&rt);
    client.set_timeout(200);
    rt.block_on(async {
        client.connect(addr).await.unwrap();
        let started = std::time::Instant::now();
        let result = client.call::<(), _>("sleep", ()).await;
        assert_eq!(result.code(), RpcCode::Timeout);
        assert!(started.elapsed() < Duration::from_millis(900));
        client.close().await;
        server.stop().await;
    });
    rt.stop();
}

#[test]
fn publish_reaches_the_subscriber() {
    let rt = runtime("e2e_pubsub");
    let server = math_server(&rt);
    let addr = server.local_addr().unwrap();
    rt.block_on(server.start());

    let received: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let client = RpcClient::new(&rt);
    {
        let received = received.clone();
        rt.block_on(async {
            client.connect(addr).await.unwrap();
            client
                .subscribe("iloveyou", move |s| {
                    if let Ok(payload) = s.read::<String>() {
                        received.lock().unwrap().push(payload);
                    }
                })
                .await
                .unwrap();
            // Let the subscription land server-side before publishing.
            sleep_ms(100).await;
            server.publish("iloveyou", "yes".to_string()).await;
            sleep_ms(100).await;
        });
    }
    assert_eq!(*received.lock().unwrap(), vec!["yes".to_string()]);

    rt.block_on(async {
        client.close().await;
        server.stop().await;
    });
    rt.stop();
}

#[test]
fn concurrent_calls_multiplex_one_session() {
    let rt = runtime("e2e_concurrent");
    let server = math_server(&rt);
    let addr = server.local_addr().unwrap();
    rt.block_on(server.start());

    let client = RpcClient::new(&rt);
    rt.block_on(async { client.connect(addr).await.unwrap() });

    let results: gossamer::Channel<(i32, i32)> = gossamer::Channel::new(32);
    for i in 0..20 {
        let client = client.clone();
        let results = results.clone();
        rt.spawn(async move {
            let sum = client.call::<i32, _>("add", (i, 1000)).await;
            results.push((i, sum.into_value().unwrap_or(-1))).await;
        });
    }

    rt.block_on(async {
        let mut seen = vec![false; 20];
        for _ in 0..20 {
            let (i, sum) = results.pop().await.unwrap();
            assert_eq!(sum, i + 1000);
            assert!(!seen[i as usize], "duplicate result for {i}");
            seen[i as usize] = true;
        }
        client.close().await;
        server.stop().await;
    });
    rt.stop();
}

#[test]
fn discovery_balances_and_fails_over() {
    let rt = runtime("e2e_pool");
    let registry = RpcServiceRegistry::bind(&rt, any_addr()).unwrap();
    let registry_addr = registry.local_addr().unwrap();
    registry.start();

    let hits_a = Arc::new(AtomicU32::new(0));
    let hits_b = Arc::new(AtomicU32::new(0));

    let provider_a = RpcServer::bind(&rt, any_addr()).unwrap();
    {
        let hits = hits_a.clone();
        provider_a.register("add", move |(a, b): (i32, i32)| {
            hits.fetch_add(1, Ordering::SeqCst);
            a + b
        });
    }
    let provider_b = RpcServer::bind(&rt, any_addr()).unwrap();
    {
        let hits = hits_b.clone();
        provider_b.register("add", move |(a, b): (i32, i32)| {
            hits.fetch_add(1, Ordering::SeqCst);
            a + b
        });
    }
    let addr_a = provider_a.local_addr().unwrap().to_string();
    let addr_b = provider_b.local_addr().unwrap().to_string();

    rt.block_on(async {
        provider_a.bind_registry(registry_addr).await.unwrap();
        provider_a.start().await;
        provider_b.bind_registry(registry_addr).await.unwrap();
        provider_b.start().await;
        // Registrations are async on the registry side.
        sleep_ms(200).await;
    });
    rt.block_on(async {
        let providers = registry.providers_of("add").await;
        assert_eq!(providers.len(), 2, "both providers registered: {providers:?}");
    });

    let pool = RpcClientPool::with_route(&rt, Box::new(RoundRobinStrategy::new()));
    rt.block_on(async {
        pool.connect(registry_addr).await.unwrap();

        for _ in 0..5 {
            let sum = pool.call::<i32, _>("add", (123, 321)).await;
            assert_eq!(sum.code(), RpcCode::Success, "{}", sum.msg());
            assert_eq!(sum.into_value(), Some(444));
        }
        assert_eq!(hits_a.load(Ordering::SeqCst) + hits_b.load(Ordering::SeqCst), 5);

        // Discovery cached both providers.
        let mut cached = pool.cached_providers("add").await;
        cached.sort();
        let mut expected = vec![addr_a.clone(), addr_b.clone()];
        expected.sort();
        assert_eq!(cached, expected);
    });

    // Kill whichever provider is serving the active connection; the next
    // call must observe RPC_CLOSED, evict it and route to the survivor.
    let (dead, survivor, survivor_hits, dead_addr) = if hits_a.load(Ordering::SeqCst) > 0 {
        (provider_a.clone(), provider_b.clone(), hits_b.clone(), addr_a.clone())
    } else {
        (provider_b.clone(), provider_a.clone(), hits_a.clone(), addr_b.clone())
    };
    rt.block_on(async {
        dead.stop().await;
        sleep_ms(100).await;

        let before = survivor_hits.load(Ordering::SeqCst);
        let sum = pool.call::<i32, _>("add", (1, 2)).await;
        assert_eq!(sum.code(), RpcCode::Success, "{}", sum.msg());
        assert_eq!(sum.into_value(), Some(3));
        assert_eq!(survivor_hits.load(Ordering::SeqCst), before + 1);

        // Dead provider is gone from the cache (eviction plus the
        // registry's down broadcast).
        sleep_ms(200).await;
        let cached = pool.cached_providers("add").await;
        assert!(!cached.contains(&dead_addr), "stale cache: {cached:?}");

        pool.close().await;
        survivor.stop().await;
        registry.stop().await;
    });
    rt.stop();
}

#[test]
fn late_provider_shows_up_via_liveness_broadcast() {
    let rt = runtime("e2e_liveness");
    let registry = RpcServiceRegistry::bind(&rt, any_addr()).unwrap();
    let registry_addr = registry.local_addr().unwrap();
    registry.start();

    let early = math_server(&rt);
    rt.block_on(async {
        early.bind_registry(registry_addr).await.unwrap();
        early.start().await;
        sleep_ms(100).await;
    });

    let pool = RpcClientPool::new(&rt);
    rt.block_on(async {
        pool.connect(registry_addr).await.unwrap();
        let sum = pool.call::<i32, _>("add", (2, 2)).await;
        assert_eq!(sum.into_value(), Some(4));
        assert_eq!(pool.cached_providers("add").await.len(), 1);
    });

    // A provider that arrives after discovery is announced on the
    // reserved topic and lands in the cache without a new round trip.
    let late = math_server(&rt);
    let late_addr = late.local_addr().unwrap().to_string();
    rt.block_on(async {
        late.bind_registry(registry_addr).await.unwrap();
        late.start().await;
        sleep_ms(300).await;

        let cached = pool.cached_providers("add").await;
        assert!(cached.contains(&late_addr), "missing late provider: {cached:?}");

        pool.close().await;
        early.stop().await;
        late.stop().await;
        registry.stop().await;
    });
    rt.stop();
}
