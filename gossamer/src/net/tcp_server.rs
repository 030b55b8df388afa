// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Accept-loop server scaffold.
//!
//! Binds a listener, then runs one accept task that hands every connection
//! to the supplied handler as its own task. Accepted sockets get the
//! configured receive timeout before the handler ever sees them.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use miette::IntoDiagnostic;

use super::tcp::{TcpListener, TcpStream};
use crate::runtime::Runtime;

#[derive(Debug)]
pub struct TcpServer {
    rt: Arc<Runtime>,
    listener: TcpListener,
    name: std::sync::Mutex<String>,
    recv_timeout_ms: u64,
    stopped: AtomicBool,
}

impl TcpServer {
    /// Bind `addr` and prepare to serve. The receive timeout for accepted
    /// connections comes from the runtime's settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub fn bind(rt: &Arc<Runtime>, addr: SocketAddr) -> miette::Result<Self> {
        let listener = TcpListener::bind(rt, addr).into_diagnostic()?;
        Ok(Self {
            rt: rt.clone(),
            listener,
            name: std::sync::Mutex::new("gossamer/0.1.0".into()),
            recv_timeout_ms: rt.settings().tcp.recv_timeout_ms,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.lock().expect("server name lock").clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().expect("server name lock") = name.into();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn runtime(&self) -> &Arc<Runtime> {
        &self.rt
    }

    /// Spawn the accept loop. Each accepted connection becomes one handler
    /// task.
    pub fn start<H, F>(self: &Arc<Self>, handler: H)
    where
        H: Fn(TcpStream) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let server = self.clone();
        let handler = Arc::new(handler);
        self.rt.spawn(async move {
            tracing::info!(name = %server.name(), "accept loop up");
            loop {
                match server.listener.accept().await {
                    Ok(stream) => {
                        stream.set_recv_timeout(server.recv_timeout_ms);
                        let handler = handler.clone();
                        server.rt.spawn(async move { handler(stream).await });
                    }
                    Err(error) => {
                        if !server.is_stopped() {
                            tracing::error!(%error, "accept failed");
                        }
                        break;
                    }
                }
            }
            tracing::info!(name = %server.name(), "accept loop down");
        });
    }

    /// Stop accepting and wake a parked accept. Existing connections are
    /// left to their handlers.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(name = %self.name(), "server stopping");
        self.listener.close();
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}
