// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Task-parking mutual exclusion.
//!
//! Ownership is one atomic word: 0 means free, otherwise it holds the
//! owning task's id (or a synthetic id when the owner is a `block_on`
//! thread). Uncontended lock/unlock is a single compare-and-swap; the
//! contended path pushes the task's waker onto a short queue guarded by a
//! plain mutex that is never held across a suspension point. Unlock pops
//! one waiter and wakes it; a freshly arriving locker may still win the
//! race (barging), in which case the woken task simply re-queues.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};

use crate::runtime::task;

pub struct CoMutex<T: ?Sized> {
    owner: AtomicU64,
    waiters: Mutex<VecDeque<Waker>>,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by the owner word; the guard only
// exists while the CAS holds.
unsafe impl<T: ?Sized + Send> Send for CoMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for CoMutex<T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for CoMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let owner = self.owner.load(Ordering::Relaxed);
        f.debug_struct("CoMutex").field("owner", &owner).finish_non_exhaustive()
    }
}

impl<T: Default> Default for CoMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> CoMutex<T> {
    pub fn new(data: T) -> Self {
        Self {
            owner: AtomicU64::new(0),
            waiters: Mutex::new(VecDeque::new()),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> CoMutex<T> {
    /// Identity installed into the owner word: the running task's id, or a
    /// synthetic one off the same counter for non-worker threads.
    fn owner_token() -> u64 {
        match task::current_task_id() {
            0 => task::next_id(),
            id => id,
        }
    }

    fn try_acquire(&self, token: u64) -> bool {
        self.owner
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn try_lock(&self) -> Option<CoMutexGuard<'_, T>> {
        let token = Self::owner_token();
        self.try_acquire(token)
            .then(|| CoMutexGuard { mutex: self })
    }

    /// Acquire, suspending the task while someone else holds the lock.
    pub fn lock(&self) -> LockFuture<'_, T> {
        LockFuture {
            mutex: self,
            token: Self::owner_token(),
        }
    }

    fn unlock(&self) {
        self.owner.store(0, Ordering::Release);
        let next = self.waiters.lock().expect("comutex waiter lock").pop_front();
        if let Some(waker) = next {
            waker.wake();
        }
    }
}

#[must_use = "futures do nothing unless awaited"]
pub struct LockFuture<'a, T: ?Sized> {
    mutex: &'a CoMutex<T>,
    token: u64,
}

impl<T: ?Sized + std::fmt::Debug> std::fmt::Debug for LockFuture<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFuture").field("token", &self.token).finish()
    }
}

impl<'a, T: ?Sized> Future for LockFuture<'a, T> {
    type Output = CoMutexGuard<'a, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Fast path.
        if self.mutex.try_acquire(self.token) {
            return Poll::Ready(CoMutexGuard { mutex: self.mutex });
        }
        // Slow path: retry under the waiter lock so an unlock between the
        // failed CAS and the enqueue cannot strand us.
        let mut waiters = self.mutex.waiters.lock().expect("comutex waiter lock");
        if self.mutex.try_acquire(self.token) {
            return Poll::Ready(CoMutexGuard { mutex: self.mutex });
        }
        waiters.push_back(cx.waker().clone());
        Poll::Pending
    }
}

pub struct CoMutexGuard<'a, T: ?Sized> {
    mutex: &'a CoMutex<T>,
}

// Safety: the guard may travel with a Send future between workers; the
// data it dereferences is Send.
unsafe impl<T: ?Sized + Send> Send for CoMutexGuard<'_, T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for CoMutexGuard<'_, T> {}

impl<'a, T: ?Sized> CoMutexGuard<'a, T> {
    /// The mutex this guard came from; condition variables re-lock it
    /// after a wait. The reference outlives the guard itself.
    pub(crate) fn source(&self) -> &'a CoMutex<T> {
        self.mutex
    }
}

impl<T: ?Sized> Deref for CoMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: exclusive ownership while the guard lives.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for CoMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: exclusive ownership while the guard lives.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for CoMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: ?Sized + std::fmt::Debug> std::fmt::Debug for CoMutexGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;
    use crate::config::Settings;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering as AOrdering};

    fn test_runtime() -> Arc<Runtime> {
        let mut settings = Settings::default();
        settings.scheduler.threads = 3;
        settings.scheduler.name = "comutex_test".into();
        Runtime::new(settings).unwrap()
    }

    #[test]
    fn try_lock_reflects_ownership() {
        let m = CoMutex::new(5u32);
        let guard = m.try_lock().unwrap();
        assert!(m.try_lock().is_none());
        drop(guard);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn contended_increments_never_lose_updates() {
        let rt = test_runtime();
        let counter = Arc::new(CoMutex::new(0u32));
        let done = Arc::new(AtomicU32::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            let done = done.clone();
            rt.spawn(async move {
                for _ in 0..100 {
                    let mut guard = counter.lock().await;
                    *guard += 1;
                    drop(guard);
                    crate::yield_now().await;
                }
                done.fetch_add(1, AOrdering::SeqCst);
            });
        }
        rt.stop();
        assert_eq!(done.load(AOrdering::SeqCst), 8);
        assert_eq!(*counter.try_lock().unwrap(), 800);
    }

    #[test]
    fn no_two_tasks_observe_ownership_simultaneously() {
        let rt = test_runtime();
        let m = Arc::new(CoMutex::new(()));
        let inside = Arc::new(AtomicU32::new(0));
        let overlap = Arc::new(AtomicU32::new(0));
        for _ in 0..4 {
            let m = m.clone();
            let inside = inside.clone();
            let overlap = overlap.clone();
            rt.spawn(async move {
                for _ in 0..50 {
                    let guard = m.lock().await;
                    if inside.fetch_add(1, AOrdering::SeqCst) != 0 {
                        overlap.fetch_add(1, AOrdering::SeqCst);
                    }
                    crate::yield_now().await;
                    inside.fetch_sub(1, AOrdering::SeqCst);
                    drop(guard);
                }
            });
        }
        rt.stop();
        assert_eq!(overlap.load(AOrdering::SeqCst), 0);
    }
}
