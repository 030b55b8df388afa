// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! # gossamer
//!
//! A cooperative M:N task runtime and an RPC framework built on it.
//!
//! The runtime multiplexes user-space tasks over a fixed worker thread
//! pool, integrated with a readiness reactor (mio: epoll/kqueue), a
//! deadline-ordered timer set, and task-parking synchronization primitives
//! ([`CoMutex`], [`CoCondVar`], [`Channel`]). Within a worker, scheduling
//! is cooperative: a task runs until it suspends at an await point; there
//! is no preemption.
//!
//! On top of that sit the RPC pieces: a 12-byte-header binary protocol
//! ([`rpc::Protocol`]), a typed value codec ([`rpc::Serializer`]), a
//! method-dispatching server ([`rpc::RpcServer`]), a service registry with
//! publish/subscribe ([`rpc::RpcServiceRegistry`]), and a discovering,
//! load-balanced client pool ([`rpc::RpcClientPool`]). Every socket
//! operation in the RPC layer is a task suspension point; nothing blocks a
//! worker thread.
//!
//! ## A complete round trip
//!
//! ```no_run
//! use gossamer::{Runtime, Settings, rpc};
//!
//! let rt = Runtime::new(Settings::default()).unwrap();
//!
//! let server = rpc::RpcServer::bind(&rt, "127.0.0.1:9000".parse().unwrap()).unwrap();
//! server.register("add", |(a, b): (i32, i32)| a + b);
//! rt.block_on(server.start());
//!
//! let client = rpc::RpcClient::new(&rt);
//! let sum = rt.block_on(async {
//!     client.connect("127.0.0.1:9000".parse().unwrap()).await.unwrap();
//!     client.call::<i32, _>("add", (123, 321)).await
//! });
//! assert_eq!(sum.into_value(), Some(444));
//! ```

pub mod buffer;
pub mod config;
pub mod net;
pub mod rpc;
pub mod runtime;
pub mod sync;

pub use buffer::{ByteArray, ByteArrayError};
pub use config::Settings;
pub use runtime::{
    Runtime, TaskState, TimerHandle, current_task_id, sleep, sleep_ms, yield_now,
};
pub use sync::{Channel, CoCondVar, CoMutex, CoMutexGuard, PopTimeoutError};
