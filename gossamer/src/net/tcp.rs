// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Task-suspending TCP stream and listener.
//!
//! [`TcpStream`] handles are cheap clones of one shared socket, so a
//! kill-timer can shut a connection down while a reader task is parked on
//! it: shutdown cancels the armed events, the parked read retries, sees
//! EOF (or the closed flag) and unwinds normally.
//!
//! Receive and send timeouts are per-stream fields; a timed-out wait
//! surfaces as [`std::io::ErrorKind::TimedOut`] from the read or write
//! that was parked.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use crate::buffer::ByteArray;
use crate::config::NO_TIMEOUT;
use crate::runtime::reactor::EventKind;
use crate::runtime::{Runtime, TimerHandle};

/// Park the current task until `kind` fires on `fd`, the wait times out,
/// or someone cancels the armed event. Ok(()) means "retry your syscall".
pub(crate) fn readiness(
    rt: &Arc<Runtime>,
    fd: RawFd,
    kind: EventKind,
    timeout_ms: u64,
) -> Readiness {
    Readiness {
        rt: rt.clone(),
        fd,
        kind,
        timeout_ms,
        state: Arc::new(ReadinessState {
            timed_out: AtomicBool::new(false),
        }),
        registered: false,
        timer: None,
    }
}

#[derive(Debug)]
struct ReadinessState {
    timed_out: AtomicBool,
}

#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub(crate) struct Readiness {
    rt: Arc<Runtime>,
    fd: RawFd,
    kind: EventKind,
    timeout_ms: u64,
    state: Arc<ReadinessState>,
    registered: bool,
    timer: Option<TimerHandle>,
}

impl Future for Readiness {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.registered {
            if let Some(timer) = this.timer.take() {
                timer.cancel();
            }
            this.registered = false;
            if this.state.timed_out.load(Ordering::Acquire) {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "i/o wait timed out",
                )));
            }
            return Poll::Ready(Ok(()));
        }

        this.rt
            .reactor()
            .add_event(this.fd, this.kind, cx.waker().clone())?;
        this.registered = true;

        if this.timeout_ms != NO_TIMEOUT {
            let weak = Arc::downgrade(&this.state);
            let token: std::sync::Weak<dyn std::any::Any + Send + Sync> = weak.clone();
            let rt = this.rt.clone();
            let fd = this.fd;
            let kind = this.kind;
            this.timer = Some(this.rt.add_condition_timer(
                this.timeout_ms,
                Arc::new(move || {
                    // The wait may have completed; a dead state means there
                    // is nothing left to cancel.
                    let Some(state) = weak.upgrade() else { return };
                    state.timed_out.store(true, Ordering::Release);
                    // Fires the parked waker as if the event had occurred.
                    rt.reactor().cancel_event(fd, kind);
                }),
                token,
                false,
            ));
        }
        Poll::Pending
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        if self.registered {
            self.rt.reactor().del_event(self.fd, self.kind);
        }
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

#[derive(Debug)]
struct StreamShared {
    io: mio::net::TcpStream,
    fd: RawFd,
    rt: Arc<Runtime>,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
    closed: AtomicBool,
}

/// A connected TCP stream driven by the runtime's reactor.
#[derive(Debug, Clone)]
pub struct TcpStream {
    shared: Arc<StreamShared>,
}

impl TcpStream {
    pub(crate) fn from_mio(rt: Arc<Runtime>, io: mio::net::TcpStream) -> Self {
        let fd = io.as_raw_fd();
        Self {
            shared: Arc::new(StreamShared {
                io,
                fd,
                rt,
                recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
                send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connect to `addr`, suspending until the handshake settles.
    pub async fn connect(rt: &Arc<Runtime>, addr: SocketAddr) -> io::Result<Self> {
        let io = mio::net::TcpStream::connect(addr)?;
        let stream = Self::from_mio(rt.clone(), io);
        readiness(rt, stream.shared.fd, EventKind::Write, NO_TIMEOUT).await?;
        if let Some(error) = stream.shared.io.take_error()? {
            return Err(error);
        }
        // A refused connection reports through peer_addr on some platforms.
        stream.shared.io.peer_addr()?;
        tracing::debug!(peer = %addr, "connected");
        Ok(stream)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.shared.io.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.io.local_addr()
    }

    /// Sets the receive deadline applied to parked reads.
    pub fn set_recv_timeout(&self, timeout_ms: u64) {
        self.shared.recv_timeout_ms.store(timeout_ms, Ordering::Release);
    }

    pub fn set_send_timeout(&self, timeout_ms: u64) {
        self.shared.send_timeout_ms.store(timeout_ms, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Half-close both directions and wake any parked reader/writer. Parked
    /// operations observe EOF / a closed flag on retry.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _unused = self.shared.io.shutdown(std::net::Shutdown::Both);
        self.shared.rt.reactor().cancel_all(self.shared.fd);
        tracing::debug!(fd = self.shared.fd, "stream shut down");
    }

    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.shared.recv_timeout_ms.load(Ordering::Acquire);
        loop {
            if self.is_closed() {
                return Ok(0);
            }
            match (&self.shared.io).read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    readiness(&self.shared.rt, self.shared.fd, EventKind::Read, timeout).await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let timeout = self.shared.send_timeout_ms.load(Ordering::Acquire);
        loop {
            if self.is_closed() {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed"));
            }
            match (&self.shared.io).write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    readiness(&self.shared.rt, self.shared.fd, EventKind::Write, timeout).await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Read exactly `len` bytes into `buffer` at its cursor, using the
    /// segment spans directly (no intermediate copy). Returns false on EOF
    /// before `len` bytes arrived.
    pub async fn read_exact_buf(&self, buffer: &mut ByteArray, len: usize) -> io::Result<bool> {
        let timeout = self.shared.recv_timeout_ms.load(Ordering::Acquire);
        let mut remaining = len;
        while remaining > 0 {
            if self.is_closed() {
                return Ok(false);
            }
            let attempt = {
                let mut bufs = buffer.write_buffers(remaining);
                (&self.shared.io).read_vectored(&mut bufs)
            };
            match attempt {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    buffer
                        .set_position(buffer.position() + n)
                        .expect("reserved capacity");
                    remaining -= n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    readiness(&self.shared.rt, self.shared.fd, EventKind::Read, timeout).await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Write all readable bytes of `buffer` (cursor to size), vectored over
    /// the segment spans.
    pub async fn write_all_buf(&self, buffer: &mut ByteArray) -> io::Result<()> {
        let timeout = self.shared.send_timeout_ms.load(Ordering::Acquire);
        while buffer.read_size() > 0 {
            if self.is_closed() {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed"));
            }
            let attempt = {
                let bufs = buffer.read_buffers(usize::MAX);
                (&self.shared.io).write_vectored(&bufs)
            };
            match attempt {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "socket wrote zero"));
                }
                Ok(n) => {
                    buffer
                        .set_position(buffer.position() + n)
                        .expect("written range stays in bounds");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    readiness(&self.shared.rt, self.shared.fd, EventKind::Write, timeout).await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// A listening socket whose `accept` suspends the task.
#[derive(Debug)]
pub struct TcpListener {
    io: mio::net::TcpListener,
    fd: RawFd,
    rt: Arc<Runtime>,
    closed: AtomicBool,
}

impl TcpListener {
    pub fn bind(rt: &Arc<Runtime>, addr: SocketAddr) -> io::Result<Self> {
        let io = mio::net::TcpListener::bind(addr)?;
        let fd = io.as_raw_fd();
        tracing::info!(addr = %io.local_addr()?, "listening");
        Ok(Self {
            io,
            fd,
            rt: rt.clone(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }

    /// Stop accepting: wakes a parked accept, which then returns an error.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.rt.reactor().cancel_all(self.fd);
    }

    pub async fn accept(&self) -> io::Result<TcpStream> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed"));
            }
            match self.io.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "accepted");
                    return Ok(TcpStream::from_mio(self.rt.clone(), stream));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    readiness(&self.rt, self.fd, EventKind::Read, NO_TIMEOUT).await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}
