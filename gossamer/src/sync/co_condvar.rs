// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Condition variable for tasks.
//!
//! Waiters queue FIFO. [`CoCondVar::wait`] atomically enqueues the task,
//! releases the given [`CoMutexGuard`], suspends, and re-acquires the
//! mutex after being notified. [`CoCondVar::wait_for`] additionally arms a
//! conditional timer; whichever of notify/timer wins settles the waiter's
//! state word, so a notification is never both consumed and reported as a
//! timeout.
//!
//! While at least one waiter is queued, the condvar holds a far-future
//! recurring placeholder timer. Runtime shutdown waits for an empty timer
//! set, so the placeholder keeps workers alive while tasks are parked here
//! with no I/O armed.
//!
//! Timed-out or abandoned waiters stay in the queue until a notify pops
//! them; such entries are skipped without consuming the notification.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use super::co_mutex::{CoMutex, CoMutexGuard};
use crate::runtime::{Runtime, TimerHandle};

/// Placeholder timer period: far enough out to never actually matter.
const HOLD_PERIOD_MS: u64 = 365 * 24 * 3600 * 1000;

const WAITING: u8 = 0;
const NOTIFIED: u8 = 1;
const TIMED_OUT: u8 = 2;

#[derive(Debug)]
struct CvEntry {
    state: AtomicU8,
    waker: Mutex<Option<Waker>>,
}

impl CvEntry {
    fn settle(&self, to: u8) -> bool {
        self.state
            .compare_exchange(WAITING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug, Default)]
struct CvInner {
    waiters: VecDeque<Arc<CvEntry>>,
    hold_timer: Option<TimerHandle>,
}

#[derive(Debug, Default)]
pub struct CoCondVar {
    inner: Mutex<CvInner>,
}

impl CoCondVar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park until notified, releasing `guard` for the duration. Returns
    /// the re-acquired guard.
    pub async fn wait<'a, T: ?Sized>(&self, guard: CoMutexGuard<'a, T>) -> CoMutexGuard<'a, T> {
        let mutex: &'a CoMutex<T> = guard.source();
        let _notified = Park {
            cv: self,
            guard: Some(guard),
            entry: None,
            timeout_ms: None,
            timer: None,
        }
        .await;
        mutex.lock().await
    }

    /// Park until notified or until `timeout_ms` elapses. Returns the
    /// re-acquired guard and `true` when actually notified.
    pub async fn wait_for<'a, T: ?Sized>(
        &self,
        guard: CoMutexGuard<'a, T>,
        timeout_ms: u64,
    ) -> (CoMutexGuard<'a, T>, bool) {
        let mutex: &'a CoMutex<T> = guard.source();
        let notified = Park {
            cv: self,
            guard: Some(guard),
            entry: None,
            timeout_ms: Some(timeout_ms),
            timer: None,
        }
        .await;
        (mutex.lock().await, notified)
    }

    /// Wake the oldest live waiter, if any.
    pub fn notify_one(&self) {
        let mut inner = self.inner.lock().expect("condvar lock");
        while let Some(entry) = inner.waiters.pop_front() {
            if entry.settle(NOTIFIED) {
                Self::wake_entry(&entry);
                break;
            }
            // Timed out or abandoned; does not consume the notification.
        }
        Self::maintain_hold_timer(&mut inner);
    }

    /// Wake every live waiter.
    pub fn notify_all(&self) {
        let mut inner = self.inner.lock().expect("condvar lock");
        let drained: Vec<_> = inner.waiters.drain(..).collect();
        Self::maintain_hold_timer(&mut inner);
        drop(inner);
        for entry in drained {
            if entry.settle(NOTIFIED) {
                Self::wake_entry(&entry);
            }
        }
    }

    fn wake_entry(entry: &CvEntry) {
        if let Some(waker) = entry.waker.lock().expect("condvar waker lock").take() {
            waker.wake();
        }
    }

    fn maintain_hold_timer(inner: &mut CvInner) {
        if inner.waiters.is_empty() {
            if let Some(timer) = inner.hold_timer.take() {
                timer.cancel();
            }
        } else if inner.hold_timer.is_none() {
            inner.hold_timer = Some(Runtime::current().add_timer(
                HOLD_PERIOD_MS,
                || {},
                true,
            ));
        }
    }

    fn enqueue(&self, entry: Arc<CvEntry>) {
        let mut inner = self.inner.lock().expect("condvar lock");
        inner.waiters.push_back(entry);
        Self::maintain_hold_timer(&mut inner);
    }

    /// Remove a timed-out or abandoned waiter so it neither eats a future
    /// notification nor keeps the placeholder timer alive.
    fn remove_entry(&self, entry: &Arc<CvEntry>) {
        let mut inner = self.inner.lock().expect("condvar lock");
        if let Some(pos) = inner
            .waiters
            .iter()
            .position(|queued| Arc::ptr_eq(queued, entry))
        {
            inner.waiters.remove(pos);
        }
        Self::maintain_hold_timer(&mut inner);
    }
}

impl Drop for CoCondVar {
    fn drop(&mut self) {
        // The owner is going away with waiters still queued (a dropped,
        // never-closed channel): release the placeholder timer so the
        // runtime is not kept alive by it.
        if let Ok(inner) = self.inner.get_mut() {
            if let Some(timer) = inner.hold_timer.take() {
                timer.cancel();
            }
        }
    }
}

#[must_use = "futures do nothing unless awaited"]
struct Park<'g, 'cv, T: ?Sized> {
    cv: &'cv CoCondVar,
    guard: Option<CoMutexGuard<'g, T>>,
    entry: Option<Arc<CvEntry>>,
    timeout_ms: Option<u64>,
    timer: Option<TimerHandle>,
}

impl<T: ?Sized> Future for Park<'_, '_, T> {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        let this = &mut *self;
        if let Some(entry) = &this.entry {
            return match entry.state.load(Ordering::Acquire) {
                WAITING => {
                    *entry.waker.lock().expect("condvar waker lock") = Some(cx.waker().clone());
                    Poll::Pending
                }
                state => {
                    if let Some(timer) = this.timer.take() {
                        timer.cancel();
                    }
                    if state == TIMED_OUT {
                        // A notify pops its entry; a timeout must clean up
                        // after itself.
                        this.cv.remove_entry(entry);
                    }
                    Poll::Ready(state == NOTIFIED)
                }
            };
        }

        // First poll: enqueue, arm the timeout, then release the mutex.
        let entry = Arc::new(CvEntry {
            state: AtomicU8::new(WAITING),
            waker: Mutex::new(Some(cx.waker().clone())),
        });
        this.cv.enqueue(entry.clone());

        if let Some(ms) = this.timeout_ms {
            let weak: Weak<CvEntry> = Arc::downgrade(&entry);
            let token: Weak<dyn std::any::Any + Send + Sync> = weak.clone();
            this.timer = Some(Runtime::current().add_condition_timer(
                ms,
                Arc::new(move || {
                    if let Some(entry) = weak.upgrade() {
                        if entry.settle(TIMED_OUT) {
                            CoCondVar::wake_entry(&entry);
                        }
                    }
                }),
                token,
                false,
            ));
        }

        this.entry = Some(entry);
        // Release the mutex only after the entry is queued, so a notify
        // racing with this park cannot be missed.
        drop(this.guard.take());
        Poll::Pending
    }
}

impl<T: ?Sized> Drop for Park<'_, '_, T> {
    fn drop(&mut self) {
        if let Some(entry) = &self.entry {
            // Abandoned mid-wait: take ourselves out of the queue so a
            // later notify is not wasted on a dead entry. Removal is
            // idempotent, so it also covers a timeout whose task never got
            // re-polled.
            entry.settle(TIMED_OUT);
            self.cv.remove_entry(entry);
        }
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant};

    fn test_runtime() -> Arc<Runtime> {
        let mut settings = Settings::default();
        settings.scheduler.threads = 2;
        settings.scheduler.name = "condvar_test".into();
        Runtime::new(settings).unwrap()
    }

    #[test]
    fn notify_one_wakes_exactly_one_waiter() {
        let rt = test_runtime();
        let pair = Arc::new((CoMutex::new(false), CoCondVar::new()));
        let woken = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let pair = pair.clone();
            let woken = woken.clone();
            rt.spawn(async move {
                let (lock, cv) = &*pair;
                let mut guard = lock.lock().await;
                while !*guard {
                    guard = cv.wait(guard).await;
                }
                woken.fetch_add(1, Ordering::SeqCst);
            });
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(woken.load(Ordering::SeqCst), 0);

        // Flip the predicate and release everyone, one notify at a time.
        let pair2 = pair.clone();
        rt.block_on(async move {
            let (lock, cv) = &*pair2;
            let mut guard = lock.lock().await;
            *guard = true;
            drop(guard);
            cv.notify_one();
        });
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(woken.load(Ordering::SeqCst), 1);

        pair.1.notify_all();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(woken.load(Ordering::SeqCst), 3);
        rt.stop();
    }

    #[test]
    fn wait_for_times_out_and_reports_it() {
        let rt = test_runtime();
        let pair = Arc::new((CoMutex::new(()), CoCondVar::new()));
        let pair2 = pair.clone();
        let started = Instant::now();
        let notified = rt.block_on(async move {
            let (lock, cv) = &*pair2;
            let guard = lock.lock().await;
            let (_guard, notified) = cv.wait_for(guard, 50).await;
            notified
        });
        assert!(!notified);
        assert!(started.elapsed() >= Duration::from_millis(45));
        rt.stop();
    }

    #[test]
    fn wait_for_returns_true_when_notified_in_time() {
        let rt = test_runtime();
        let pair = Arc::new((CoMutex::new(()), CoCondVar::new()));
        {
            let pair = pair.clone();
            rt.spawn(async move {
                crate::sleep_ms(20).await;
                pair.1.notify_one();
            });
        }
        let pair2 = pair.clone();
        let notified = rt.block_on(async move {
            let (lock, cv) = &*pair2;
            let guard = lock.lock().await;
            let (_guard, notified) = cv.wait_for(guard, 5000).await;
            notified
        });
        assert!(notified);
        rt.stop();
    }
}
