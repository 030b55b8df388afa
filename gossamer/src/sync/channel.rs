// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Bounded multi-producer multi-consumer channel for tasks.
//!
//! Built from one [`CoMutex`] around the buffer and two [`CoCondVar`]s
//! (`not_full`, `not_empty`), the classic shape. [`Channel::push`] parks
//! while the buffer is full, [`Channel::pop`] while it is empty; both bail
//! out with a closed indication as soon as [`Channel::close`] runs, which
//! also wakes every parked task and discards buffered values.
//!
//! The handle is cheap to clone; all clones share one buffer, which goes
//! away when the last clone drops.

use std::collections::VecDeque;
use std::sync::Arc;

use super::co_condvar::CoCondVar;
use super::co_mutex::CoMutex;

/// Why a timed pop came back empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopTimeoutError {
    /// No value arrived within the deadline.
    Timeout,
    /// The channel was closed while waiting (or before).
    Closed,
}

#[derive(Debug)]
struct ChanState<T> {
    queue: VecDeque<T>,
    closed: bool,
}

#[derive(Debug)]
struct ChannelInner<T> {
    capacity: usize,
    state: CoMutex<ChanState<T>>,
    not_full: CoCondVar,
    not_empty: CoCondVar,
}

#[derive(Debug)]
pub struct Channel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Channel<T> {
    /// A channel buffering up to `capacity` values (at least 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "channel capacity must be at least 1");
        Self {
            inner: Arc::new(ChannelInner {
                capacity,
                state: CoMutex::new(ChanState {
                    queue: VecDeque::with_capacity(capacity),
                    closed: false,
                }),
                not_full: CoCondVar::new(),
                not_empty: CoCondVar::new(),
            }),
        }
    }

    /// Send, parking while full. Returns false once the channel is closed;
    /// the value is dropped in that case.
    pub async fn push(&self, value: T) -> bool {
        let inner = &*self.inner;
        let mut guard = inner.state.lock().await;
        if guard.closed {
            return false;
        }
        while guard.queue.len() >= inner.capacity {
            guard = inner.not_full.wait(guard).await;
            if guard.closed {
                return false;
            }
        }
        guard.queue.push_back(value);
        drop(guard);
        inner.not_empty.notify_one();
        true
    }

    /// Receive, parking while empty. `None` once closed.
    pub async fn pop(&self) -> Option<T> {
        let inner = &*self.inner;
        let mut guard = inner.state.lock().await;
        if guard.closed {
            return None;
        }
        while guard.queue.is_empty() {
            guard = inner.not_empty.wait(guard).await;
            if guard.closed {
                return None;
            }
        }
        let value = guard.queue.pop_front();
        drop(guard);
        inner.not_full.notify_one();
        value
    }

    /// [`Channel::pop`] with a deadline per wait round.
    pub async fn pop_timeout(&self, timeout_ms: u64) -> Result<T, PopTimeoutError> {
        let inner = &*self.inner;
        let mut guard = inner.state.lock().await;
        if guard.closed {
            return Err(PopTimeoutError::Closed);
        }
        while guard.queue.is_empty() {
            let (reacquired, notified) = inner.not_empty.wait_for(guard, timeout_ms).await;
            guard = reacquired;
            if guard.closed {
                return Err(PopTimeoutError::Closed);
            }
            if !notified && guard.queue.is_empty() {
                return Err(PopTimeoutError::Timeout);
            }
        }
        let value = guard.queue.pop_front().expect("nonempty queue");
        drop(guard);
        inner.not_full.notify_one();
        Ok(value)
    }

    /// Close and wake every parked task. Buffered values are discarded;
    /// all further operations fail fast.
    pub async fn close(&self) {
        let inner = &*self.inner;
        let mut guard = inner.state.lock().await;
        if guard.closed {
            return;
        }
        guard.closed = true;
        guard.queue.clear();
        drop(guard);
        inner.not_full.notify_all();
        inner.not_empty.notify_all();
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;
    use crate::config::Settings;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_runtime(threads: usize) -> Arc<Runtime> {
        let mut settings = Settings::default();
        settings.scheduler.threads = threads;
        settings.scheduler.name = "chan_test".into();
        Runtime::new(settings).unwrap()
    }

    #[test]
    fn every_message_received_exactly_once_in_producer_order() {
        let rt = test_runtime(4);
        let chan: Channel<(u32, u32)> = Channel::new(4);
        const PRODUCERS: u32 = 3;
        const PER_PRODUCER: u32 = 40;

        for p in 0..PRODUCERS {
            let chan = chan.clone();
            rt.spawn(async move {
                for i in 0..PER_PRODUCER {
                    assert!(chan.push((p, i)).await);
                }
            });
        }

        let received = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            let chan = chan.clone();
            let received = received.clone();
            let done = done.clone();
            rt.spawn(async move {
                while let Some(msg) = chan.pop().await {
                    received.lock().unwrap().push(msg);
                    if received.lock().unwrap().len() as u32 == PRODUCERS * PER_PRODUCER {
                        chan.close().await;
                    }
                }
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        rt.stop();
        let received = received.lock().unwrap();
        assert_eq!(received.len() as u32, PRODUCERS * PER_PRODUCER);
        // Exactly once, and in per-producer order.
        for p in 0..PRODUCERS {
            let seq: Vec<u32> = received
                .iter()
                .filter(|(who, _)| *who == p)
                .map(|(_, i)| *i)
                .collect();
            let expected: Vec<u32> = (0..PER_PRODUCER).collect();
            assert_eq!(seq, expected, "producer {p}");
        }
    }

    #[test]
    fn push_blocks_at_capacity_until_a_pop() {
        let rt = test_runtime(2);
        let chan: Channel<u32> = Channel::new(1);
        let pushed = Arc::new(AtomicU32::new(0));
        {
            let chan = chan.clone();
            let pushed = pushed.clone();
            rt.spawn(async move {
                chan.push(1).await;
                pushed.fetch_add(1, Ordering::SeqCst);
                chan.push(2).await;
                pushed.fetch_add(1, Ordering::SeqCst);
            });
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(pushed.load(Ordering::SeqCst), 1);

        let chan2 = chan.clone();
        let got = rt.block_on(async move { chan2.pop().await });
        assert_eq!(got, Some(1));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(pushed.load(Ordering::SeqCst), 2);
        rt.stop();
    }

    #[test]
    fn close_wakes_waiters_and_discards_buffer() {
        let rt = test_runtime(2);
        let chan: Channel<u32> = Channel::new(2);
        let popped_none = Arc::new(AtomicU32::new(0));
        {
            let chan = chan.clone();
            let popped_none = popped_none.clone();
            rt.spawn(async move {
                if chan.pop().await.is_none() {
                    popped_none.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        std::thread::sleep(std::time::Duration::from_millis(30));
        let chan2 = chan.clone();
        rt.block_on(async move {
            chan2.close().await;
            assert!(!chan2.push(8).await);
            assert!(chan2.pop().await.is_none());
        });
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(popped_none.load(Ordering::SeqCst), 1);

        // A buffered value does not survive close either.
        let buffered: Channel<u32> = Channel::new(2);
        let buffered2 = buffered.clone();
        rt.block_on(async move {
            assert!(buffered2.push(7).await);
            buffered2.close().await;
            assert!(buffered2.pop().await.is_none());
        });
        rt.stop();
    }

    #[test]
    fn pop_timeout_distinguishes_timeout_from_close() {
        let rt = test_runtime(2);
        let chan: Channel<u32> = Channel::new(1);
        let chan2 = chan.clone();
        let outcome = rt.block_on(async move { chan2.pop_timeout(40).await });
        assert_eq!(outcome, Err(PopTimeoutError::Timeout));

        let chan3 = chan.clone();
        rt.spawn(async move {
            crate::sleep_ms(10).await;
            chan3.close().await;
        });
        let chan4 = chan.clone();
        let outcome = rt.block_on(async move { chan4.pop_timeout(5000).await });
        assert_eq!(outcome, Err(PopTimeoutError::Closed));
        rt.stop();
    }
}
