// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Readiness-event demultiplexer (epoll on Linux, kqueue on macOS via
//! [`mio`]) wired into the scheduler as its idle parker.
//!
//! One idle worker at a time becomes the *driver*: it try-locks the poll
//! handle and blocks in [`mio::Poll::poll`] for at most
//! `min(next_timer, 3000 ms)`; every other idle worker sleeps on the queue
//! condvar. [`Reactor::notify`] interrupts the blocked driver through a
//! [`mio::Waker`]; the self-wakeup channel resets itself on delivery, so
//! there is nothing to drain and no trigger-mode mismatch to worry about.
//!
//! Per-fd state lives in a table indexed by the descriptor number, one
//! short-lived mutex per entry so contention stays local to that fd. For
//! each armed direction exactly one parked continuation is registered.
//! Firing a direction disarms it; the remaining interest (if any) is
//! re-registered, otherwise the fd is removed from the poll set.
//!
//! The pending-event counter gates runtime shutdown: workers may not exit
//! while any direction is armed anywhere.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use super::scheduler::{IdleParker, Runnable, SchedulerCore};
use super::timer::TimerWheel;

/// Cap on a single blocking wait, so stop requests and counter churn are
/// observed even with no timers and no traffic.
const MAX_WAIT_MS: u64 = 3000;

/// Readiness notifications harvested per poll round.
const MAX_EVENTS: usize = 256;

const WAKE_TOKEN: Token = Token(usize::MAX);

pub(crate) const READ: u8 = 0b01;
pub(crate) const WRITE: u8 = 0b10;

/// One armed direction on one fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventKind {
    Read,
    Write,
}

impl EventKind {
    pub(crate) fn mask(self) -> u8 {
        match self {
            EventKind::Read => READ,
            EventKind::Write => WRITE,
        }
    }
}

// In the poll model every parked continuation is a waker: a task parked on
// I/O re-enters the runqueue through its own wake, and a plain callback
// that wants I/O is itself spawned as a task first. The original
// task-or-callback split lives at the scheduler level (`Runnable`).
#[derive(Debug, Default)]
struct FdInner {
    armed: u8,
    read: Option<std::task::Waker>,
    write: Option<std::task::Waker>,
}

impl FdInner {
    fn slot_mut(&mut self, kind: EventKind) -> &mut Option<std::task::Waker> {
        match kind {
            EventKind::Read => &mut self.read,
            EventKind::Write => &mut self.write,
        }
    }
}

#[derive(Debug)]
struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

struct PollParts {
    poll: Poll,
    events: Events,
}

pub(crate) struct Reactor {
    parts: Mutex<PollParts>,
    registry: mio::Registry,
    waker: mio::Waker,
    contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
    pending: AtomicUsize,
    timers: Arc<TimerWheel>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Reactor {
    pub(crate) fn new(timers: Arc<TimerWheel>) -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Arc::new(Self {
            parts: Mutex::new(PollParts {
                poll,
                events: Events::with_capacity(MAX_EVENTS),
            }),
            registry,
            waker,
            contexts: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
            timers,
        }))
    }

    pub(crate) fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn context(&self, fd: RawFd) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let table = self.contexts.read().expect("fd table lock");
            if let Some(Some(ctx)) = table.get(idx) {
                return ctx.clone();
            }
        }
        let mut table = self.contexts.write().expect("fd table lock");
        if table.len() <= idx {
            let grown = (idx + idx / 2).max(64);
            table.resize_with(grown, || None);
        }
        table[idx]
            .get_or_insert_with(|| {
                Arc::new(FdContext {
                    fd,
                    inner: Mutex::new(FdInner::default()),
                })
            })
            .clone()
    }

    fn existing_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let table = self.contexts.read().expect("fd table lock");
        table.get(fd as usize).and_then(Clone::clone)
    }

    fn interest_of(mask: u8) -> Interest {
        match (mask & READ != 0, mask & WRITE != 0) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => unreachable!("empty interest"),
        }
    }

    /// Arm `kind` on `fd` with the parked continuation's waker. Arming an
    /// already-armed direction is a caller bug and is rejected.
    pub(crate) fn add_event(
        &self,
        fd: RawFd,
        kind: EventKind,
        waker: std::task::Waker,
    ) -> io::Result<()> {
        let ctx = self.context(fd);
        let mut inner = ctx.inner.lock().expect("fd slot lock");
        if inner.armed & kind.mask() != 0 {
            tracing::error!(fd, ?kind, armed = inner.armed, "direction already armed");
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "event already armed for this direction",
            ));
        }
        let new_mask = inner.armed | kind.mask();
        let interest = Self::interest_of(new_mask);
        if inner.armed == 0 {
            self.registry
                .register(&mut SourceFd(&ctx.fd), Token(fd as usize), interest)?;
        } else {
            self.registry
                .reregister(&mut SourceFd(&ctx.fd), Token(fd as usize), interest)?;
        }
        inner.armed = new_mask;
        *inner.slot_mut(kind) = Some(waker);
        self.pending.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(fd, ?kind, "event armed");
        Ok(())
    }

    /// Disarm without firing. Returns false if the direction was not armed.
    pub(crate) fn del_event(&self, fd: RawFd, kind: EventKind) -> bool {
        self.remove_event(fd, kind).is_some()
    }

    /// Disarm and fire the continuation exactly once, as if the event had
    /// occurred; the resumed code observes cancellation by retrying its
    /// syscall.
    pub(crate) fn cancel_event(&self, fd: RawFd, kind: EventKind) -> bool {
        match self.remove_event(fd, kind) {
            Some(waker) => {
                waker.wake();
                true
            }
            None => false,
        }
    }

    /// [`Self::cancel_event`] for both directions.
    pub(crate) fn cancel_all(&self, fd: RawFd) {
        self.cancel_event(fd, EventKind::Read);
        self.cancel_event(fd, EventKind::Write);
    }

    fn remove_event(&self, fd: RawFd, kind: EventKind) -> Option<std::task::Waker> {
        let ctx = self.existing_context(fd)?;
        let mut inner = ctx.inner.lock().expect("fd slot lock");
        if inner.armed & kind.mask() == 0 {
            return None;
        }
        let residual = inner.armed & !kind.mask();
        let updated = if residual != 0 {
            self.registry.reregister(
                &mut SourceFd(&ctx.fd),
                Token(fd as usize),
                Self::interest_of(residual),
            )
        } else {
            self.registry.deregister(&mut SourceFd(&ctx.fd))
        };
        if let Err(error) = updated {
            // The fd may already be closed; the slot is torn down anyway.
            tracing::debug!(fd, %error, "poll re-registration failed during disarm");
        }
        inner.armed = residual;
        let waker = inner.slot_mut(kind).take();
        drop(inner);
        self.dec_pending();
        waker
    }

    fn dec_pending(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        // A negative count means the arm/fire pairing is broken somewhere;
        // that is a bug, not a runtime condition.
        assert!(prev > 0, "pending event count underflow");
    }

    /// Wake the driver blocked in `poll`, but only when some worker is
    /// actually idle; a busy pool will visit the reactor soon anyway.
    pub(crate) fn notify(&self, core: &SchedulerCore) {
        if core.idle_count() > 0 {
            if let Err(error) = self.waker.wake() {
                tracing::error!(%error, "reactor wakeup failed");
            }
        }
    }

    /// One driver round: block for readiness or timer deadline, then move
    /// every fired continuation onto the runqueue.
    fn drive(&self, parts: &mut PollParts, core: &SchedulerCore) {
        let wait_ms = self
            .timers
            .next_timer_ms()
            .map_or(MAX_WAIT_MS, |ms| ms.min(MAX_WAIT_MS));

        let PollParts { poll, events } = parts;
        loop {
            match poll.poll(events, Some(Duration::from_millis(wait_ms))) {
                Ok(()) => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    tracing::error!(%error, "poll failed");
                    break;
                }
            }
        }

        let expired = self.timers.harvest_expired();
        if !expired.is_empty() {
            tracing::trace!(count = expired.len(), "timers expired");
            core.push_batch(
                expired
                    .into_iter()
                    .map(|f| Runnable::Call { f, affinity: None }),
            );
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                // mio's waker resets itself on delivery.
                continue;
            }
            let fd = event.token().0 as RawFd;
            let mut fired = 0u8;
            if event.is_readable() || event.is_read_closed() {
                fired |= READ;
            }
            if event.is_writable() || event.is_write_closed() {
                fired |= WRITE;
            }
            if event.is_error() {
                // Error/hangup wakes both directions so parked tasks can
                // observe the failure from their syscall.
                fired |= READ | WRITE;
            }
            self.trigger(fd, fired);
        }
    }

    fn trigger(&self, fd: RawFd, fired_mask: u8) {
        let Some(ctx) = self.existing_context(fd) else {
            return;
        };
        let mut inner = ctx.inner.lock().expect("fd slot lock");
        let fired = fired_mask & inner.armed;
        if fired == 0 {
            return;
        }
        let residual = inner.armed & !fired;
        let updated = if residual != 0 {
            self.registry.reregister(
                &mut SourceFd(&ctx.fd),
                Token(fd as usize),
                Self::interest_of(residual),
            )
        } else {
            self.registry.deregister(&mut SourceFd(&ctx.fd))
        };
        if let Err(error) = updated {
            tracing::debug!(fd, %error, "poll re-registration failed during dispatch");
        }
        inner.armed = residual;

        let mut fired_wakers: Vec<std::task::Waker> = Vec::with_capacity(2);
        if fired & READ != 0 {
            if let Some(w) = inner.read.take() {
                fired_wakers.push(w);
            }
        }
        if fired & WRITE != 0 {
            if let Some(w) = inner.write.take() {
                fired_wakers.push(w);
            }
        }
        drop(inner);
        for waker in fired_wakers {
            self.dec_pending();
            waker.wake();
        }
    }
}

impl IdleParker for Reactor {
    fn park(&self, core: &SchedulerCore) {
        match self.parts.try_lock() {
            Ok(mut parts) => self.drive(&mut parts, core),
            Err(TryLockError::WouldBlock) => core.park_on_queue(),
            Err(TryLockError::Poisoned(_)) => panic!("reactor poll lock poisoned"),
        }
    }

    fn unpark(&self, core: &SchedulerCore) {
        core.notify_queue(false);
        self.notify(core);
    }

    fn busy(&self) -> bool {
        self.pending_events() > 0 || self.timers.has_timers()
    }
}
