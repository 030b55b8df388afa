// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Timers keyed by absolute deadline.
//!
//! The set is a `BTreeMap` ordered by `(deadline, id)`; the id makes
//! insertion stable for equal deadlines, so [`TimerWheel::harvest_expired`]
//! hands back callbacks in non-decreasing deadline order. The wheel never
//! runs callbacks itself; the reactor harvests them and pushes them onto
//! the scheduler runqueue.
//!
//! When an insertion becomes the new earliest deadline and the tickled flag
//! is clear, the owner's front-changed hook fires once; the reactor uses it
//! to interrupt its blocking wait so the shorter deadline is honored. The
//! flag is re-armed by [`TimerWheel::next_timer_ms`], i.e. each blocking
//! wait gets at most one interruption from timer churn.
//!
//! A conditional timer carries a weak liveness token; if the token is dead
//! at fire time the callback is dropped silently.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;
pub(crate) type LivenessToken = Weak<dyn Any + Send + Sync>;

struct TimerShared {
    id: u64,
    recurring: bool,
    callback: TimerCallback,
    liveness: Option<LivenessToken>,
    /// Period and current queue position; `deadline` is `None` while the
    /// timer is not in the set. Guarded by the wheel mutex: always taken
    /// after `TimerInner`.
    sched: Mutex<TimerSched>,
    wheel: Weak<TimerWheel>,
}

#[derive(Debug, Clone, Copy)]
struct TimerSched {
    period: Duration,
    deadline: Option<Instant>,
}

impl std::fmt::Debug for TimerShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerShared")
            .field("id", &self.id)
            .field("recurring", &self.recurring)
            .finish()
    }
}

/// Owner handle for one timer. Dropping the handle does not cancel the
/// timer; cancellation is explicit.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    shared: Arc<TimerShared>,
}

impl TimerHandle {
    /// Remove the timer without firing it. Returns false if it already
    /// fired (non-recurring) or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(wheel) = self.shared.wheel.upgrade() else {
            return false;
        };
        let mut inner = wheel.inner.lock().expect("timer set lock");
        let mut sched = self.shared.sched.lock().expect("timer sched lock");
        match sched.deadline.take() {
            Some(deadline) => {
                inner.timers.remove(&(deadline, self.shared.id));
                true
            }
            None => false,
        }
    }

    /// Push the deadline out to `now + period`, keeping the period.
    pub fn refresh(&self) -> bool {
        let Some(wheel) = self.shared.wheel.upgrade() else {
            return false;
        };
        let mut inner = wheel.inner.lock().expect("timer set lock");
        let mut sched = self.shared.sched.lock().expect("timer sched lock");
        let Some(old) = sched.deadline else {
            return false;
        };
        inner.timers.remove(&(old, self.shared.id));
        let deadline = Instant::now() + sched.period;
        sched.deadline = Some(deadline);
        inner.timers.insert((deadline, self.shared.id), self.shared.clone());
        true
    }

    /// Change the period and re-anchor: from now, or from the original
    /// start point.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        let Some(wheel) = self.shared.wheel.upgrade() else {
            return false;
        };
        let period = Duration::from_millis(period_ms);
        let mut inner = wheel.inner.lock().expect("timer set lock");
        let mut sched = self.shared.sched.lock().expect("timer sched lock");
        if sched.period == period && !from_now {
            return true;
        }
        let Some(old) = sched.deadline else {
            return false;
        };
        inner.timers.remove(&(old, self.shared.id));
        let start = if from_now {
            Instant::now()
        } else {
            old.checked_sub(sched.period).unwrap_or_else(Instant::now)
        };
        sched.period = period;
        let deadline = start + period;
        sched.deadline = Some(deadline);
        let fire_front = inner.insert_checking_front((deadline, self.shared.id), self.shared.clone());
        drop(sched);
        drop(inner);
        if fire_front {
            wheel.fire_front_changed();
        }
        true
    }
}

struct TimerInner {
    timers: BTreeMap<(Instant, u64), Arc<TimerShared>>,
    tickled: bool,
}

impl TimerInner {
    /// Insert and report whether the front-changed hook must fire (new
    /// earliest deadline while the tickled flag was clear).
    fn insert_checking_front(
        &mut self,
        key: (Instant, u64),
        shared: Arc<TimerShared>,
    ) -> bool {
        self.timers.insert(key, shared);
        let at_front = self.timers.keys().next() == Some(&key);
        if at_front && !self.tickled {
            self.tickled = true;
            return true;
        }
        false
    }
}

pub(crate) struct TimerWheel {
    inner: Mutex<TimerInner>,
    next_id: AtomicU64,
    front_changed: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl std::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWheel").finish_non_exhaustive()
    }
}

impl TimerWheel {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TimerInner {
                timers: BTreeMap::new(),
                tickled: false,
            }),
            next_id: AtomicU64::new(1),
            front_changed: OnceLock::new(),
        })
    }

    /// Install the hook invoked when a new earliest deadline appears. The
    /// runtime wires this to the reactor wakeup.
    pub(crate) fn set_front_changed(&self, hook: Box<dyn Fn() + Send + Sync>) {
        assert!(
            self.front_changed.set(hook).is_ok(),
            "front-changed hook installed twice"
        );
    }

    fn fire_front_changed(&self) {
        if let Some(hook) = self.front_changed.get() {
            hook();
        }
    }

    pub(crate) fn add_timer(
        self: &Arc<Self>,
        period_ms: u64,
        callback: TimerCallback,
        recurring: bool,
    ) -> TimerHandle {
        self.add_timer_inner(period_ms, callback, recurring, None)
    }

    /// Like [`Self::add_timer`], but the callback only fires while the
    /// liveness token can still be upgraded.
    pub(crate) fn add_condition_timer(
        self: &Arc<Self>,
        period_ms: u64,
        callback: TimerCallback,
        token: LivenessToken,
        recurring: bool,
    ) -> TimerHandle {
        self.add_timer_inner(period_ms, callback, recurring, Some(token))
    }

    fn add_timer_inner(
        self: &Arc<Self>,
        period_ms: u64,
        callback: TimerCallback,
        recurring: bool,
        liveness: Option<LivenessToken>,
    ) -> TimerHandle {
        let period = Duration::from_millis(period_ms);
        let shared = Arc::new(TimerShared {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            recurring,
            callback,
            liveness,
            sched: Mutex::new(TimerSched {
                period,
                deadline: None,
            }),
            wheel: Arc::downgrade(self),
        });
        let fire_front = {
            let mut inner = self.inner.lock().expect("timer set lock");
            let deadline = Instant::now() + period;
            shared.sched.lock().expect("timer sched lock").deadline = Some(deadline);
            inner.insert_checking_front((deadline, shared.id), shared.clone())
        };
        if fire_front {
            self.fire_front_changed();
        }
        TimerHandle { shared }
    }

    /// Milliseconds until the earliest deadline (0 if already due), or
    /// `None` when the set is empty. Re-arms the tickled flag.
    pub(crate) fn next_timer_ms(&self) -> Option<u64> {
        let mut inner = self.inner.lock().expect("timer set lock");
        inner.tickled = false;
        let (deadline, _) = inner.timers.keys().next()?;
        Some(deadline.saturating_duration_since(Instant::now()).as_millis() as u64)
    }

    pub(crate) fn has_timers(&self) -> bool {
        !self.inner.lock().expect("timer set lock").timers.is_empty()
    }

    /// Pull every callback whose deadline has passed, in deadline order.
    /// Recurring timers are re-inserted at `now + period`; dead conditional
    /// timers are dropped without firing.
    pub(crate) fn harvest_expired(&self) -> Vec<Box<dyn FnOnce() + Send>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("timer set lock");
        if inner.timers.is_empty() {
            return Vec::new();
        }
        let due: Vec<(Instant, u64)> = inner
            .timers
            .range(..=(now, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        let mut callbacks: Vec<Box<dyn FnOnce() + Send>> = Vec::with_capacity(due.len());
        for key in due {
            let shared = inner.timers.remove(&key).expect("due timer present");
            let alive = shared
                .liveness
                .as_ref()
                .is_none_or(|token| token.upgrade().is_some());
            let mut sched = shared.sched.lock().expect("timer sched lock");
            if !alive {
                sched.deadline = None;
                continue;
            }
            if shared.recurring {
                let deadline = now + sched.period;
                sched.deadline = Some(deadline);
                drop(sched);
                inner.timers.insert((deadline, shared.id), shared.clone());
            } else {
                sched.deadline = None;
                drop(sched);
            }
            let cb = shared.callback.clone();
            callbacks.push(Box::new(move || cb()));
        }
        callbacks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    fn noop() -> TimerCallback {
        Arc::new(|| {})
    }

    #[test]
    fn harvest_returns_in_deadline_order() {
        let wheel = TimerWheel::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for ms in [30u64, 10, 20] {
            let order = order.clone();
            wheel.add_timer(ms, Arc::new(move || order.lock().unwrap().push(ms)), false);
        }
        std::thread::sleep(Duration::from_millis(50));
        for cb in wheel.harvest_expired() {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
        assert!(!wheel.has_timers());
    }

    #[test]
    fn recurring_timer_reinserts_itself() {
        let wheel = TimerWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        wheel.add_timer(
            5,
            Arc::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        );
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(10));
            for cb in wheel.harvest_expired() {
                cb();
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(wheel.has_timers());
    }

    #[test]
    fn cancel_removes_without_firing() {
        let wheel = TimerWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = wheel.add_timer(
            5,
            Arc::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
            false,
        );
        assert!(handle.cancel());
        assert!(!handle.cancel());
        std::thread::sleep(Duration::from_millis(10));
        assert!(wheel.harvest_expired().is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dead_liveness_token_drops_the_callback() {
        let wheel = TimerWheel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let token: Arc<dyn Any + Send + Sync> = Arc::new(());
        wheel.add_condition_timer(
            1,
            Arc::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::downgrade(&token),
            false,
        );
        drop(token);
        std::thread::sleep(Duration::from_millis(5));
        assert!(wheel.harvest_expired().is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn front_insertion_fires_hook_once_per_wait() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        wheel.set_front_changed(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        wheel.add_timer(1000, noop(), false);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Not at front: no hook.
        wheel.add_timer(5000, noop(), false);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // At front but still tickled: no hook until next_timer_ms re-arms.
        wheel.add_timer(500, noop(), false);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let _unused = wheel.next_timer_ms();
        wheel.add_timer(100, noop(), false);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn next_timer_ms_reports_earliest() {
        let wheel = TimerWheel::new();
        assert_eq!(wheel.next_timer_ms(), None);
        wheel.add_timer(5000, noop(), false);
        let ms = wheel.next_timer_ms().unwrap();
        assert!(ms > 4000 && ms <= 5000, "got {ms}");
    }

    #[test]
    fn refresh_and_reset_move_the_deadline() {
        let wheel = TimerWheel::new();
        let handle = wheel.add_timer(20, noop(), false);
        std::thread::sleep(Duration::from_millis(10));
        assert!(handle.refresh());
        let ms = wheel.next_timer_ms().unwrap();
        assert!(ms > 10, "refresh should re-anchor at now, got {ms}");

        assert!(handle.reset(5000, true));
        let ms = wheel.next_timer_ms().unwrap();
        assert!(ms > 4000, "reset should apply the new period, got {ms}");
    }
}
