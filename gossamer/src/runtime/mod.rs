// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The cooperative M:N runtime: a worker thread pool multiplexing
//! user-space tasks, integrated with a timer set and a readiness reactor.
//!
//! [`Runtime`] composes the three pieces and is the only type most callers
//! touch:
//!
//! ```no_run
//! use gossamer::{Runtime, Settings};
//!
//! let rt = Runtime::new(Settings::default()).unwrap();
//! rt.spawn(async {
//!     gossamer::sleep_ms(10).await;
//!     tracing::info!("hello from a task");
//! });
//! rt.block_on(async { gossamer::yield_now().await });
//! rt.stop();
//! ```
//!
//! Construction order matters internally: the reactor is installed as the
//! scheduler's idle parker and the timer wheel's front-changed hook before
//! any worker starts, so the first task already runs under the full I/O and
//! timer machinery.
//!
//! There is a process-wide default behind [`Runtime::global`]; library code
//! should accept an explicit `Arc<Runtime>` and fall back to
//! [`Runtime::current`] only at the convenience seams.

pub(crate) mod reactor;
pub(crate) mod scheduler;
pub mod task;
pub(crate) mod timer;

pub use task::{TaskState, current_task_id, yield_now};
pub use timer::TimerHandle;

use miette::IntoDiagnostic;
use std::cell::RefCell;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, Weak};
use std::sync::atomic::AtomicBool;
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use crate::config::Settings;
use reactor::Reactor;
use scheduler::{Runnable, Scheduler, SchedulerCore};
use task::Task;
use timer::{LivenessToken, TimerCallback, TimerWheel};

static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();

thread_local! {
    static CURRENT: RefCell<Option<Weak<Runtime>>> = const { RefCell::new(None) };
}

/// Restores the previous thread-local runtime on drop ([`Runtime::block_on`]
/// nests).
struct CurrentGuard {
    previous: Option<Weak<Runtime>>,
}

impl CurrentGuard {
    fn install(rt: Weak<Runtime>) -> Self {
        let previous = CURRENT.with(|c| c.borrow_mut().replace(rt));
        Self { previous }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}

#[derive(Debug)]
pub struct Runtime {
    core: Arc<SchedulerCore>,
    sched: Scheduler,
    timers: Arc<TimerWheel>,
    reactor: Arc<Reactor>,
    settings: Settings,
    stopped: AtomicBool,
}

impl Runtime {
    /// Build and start a runtime: workers spawn immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS poll instance or its wakeup channel
    /// cannot be created.
    pub fn new(settings: Settings) -> miette::Result<Arc<Self>> {
        let core = SchedulerCore::new(
            settings.scheduler.name.clone(),
            settings.scheduler.threads,
        );
        let timers = TimerWheel::new();
        let reactor = Reactor::new(timers.clone()).into_diagnostic()?;
        core.install_parker(reactor.clone());
        {
            let reactor = Arc::downgrade(&reactor);
            let core = Arc::downgrade(&core);
            timers.set_front_changed(Box::new(move || {
                if let (Some(reactor), Some(core)) = (reactor.upgrade(), core.upgrade()) {
                    reactor.notify(&core);
                }
            }));
        }

        let rt = Arc::new(Self {
            sched: Scheduler::new(core.clone()),
            core,
            timers,
            reactor,
            settings,
            stopped: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&rt);
        rt.sched.start(Arc::new(move || {
            CURRENT.with(|c| *c.borrow_mut() = Some(weak.clone()));
        }));
        tracing::info!(
            scheduler = %rt.settings.scheduler.name,
            threads = rt.settings.scheduler.threads,
            "runtime started"
        );
        Ok(rt)
    }

    /// The process-wide default, created on first use from env-aware
    /// settings.
    pub fn global() -> Arc<Self> {
        GLOBAL
            .get_or_init(|| Runtime::new(Settings::from_env()).expect("default runtime"))
            .clone()
    }

    /// The runtime owning the calling worker thread (or the one installed
    /// by an enclosing [`Runtime::block_on`]); falls back to
    /// [`Runtime::global`].
    pub fn current() -> Arc<Self> {
        Self::try_current().unwrap_or_else(Self::global)
    }

    #[must_use]
    pub fn try_current() -> Option<Arc<Self>> {
        CURRENT.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Submit a task; it becomes runnable immediately. Returns the task id.
    pub fn spawn<F>(&self, future: F) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_pinned(future, None)
    }

    /// [`Runtime::spawn`], pinned to one worker: only that worker will ever
    /// poll the task.
    pub fn spawn_pinned<F>(&self, future: F, affinity: Option<usize>) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = Task::new(Box::pin(future), affinity, Arc::downgrade(&self.core));
        let id = task.id();
        task.set_state(TaskState::Ready);
        self.core.push(Runnable::Task(task));
        id
    }

    /// Batch submit; the runqueue is locked once for the whole batch.
    pub fn spawn_batch<I, F>(&self, futures: I)
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = ()> + Send + 'static,
    {
        let runnables: Vec<Runnable> = futures
            .into_iter()
            .map(|future| {
                let task = Task::new(Box::pin(future), None, Arc::downgrade(&self.core));
                task.set_state(TaskState::Ready);
                Runnable::Task(task)
            })
            .collect();
        self.core.push_batch(runnables);
    }

    /// Submit a plain callback. It runs to completion on a worker and
    /// cannot suspend.
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.push(Runnable::Call {
            f: Box::new(f),
            affinity: None,
        });
    }

    /// Register a timer. The callback runs on a worker; recurring timers
    /// re-fire every `period_ms` until cancelled.
    pub fn add_timer<F>(&self, period_ms: u64, callback: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(period_ms, Arc::new(callback), recurring)
    }

    /// A timer whose callback is dropped if `token` is dead when it fires.
    pub(crate) fn add_condition_timer(
        &self,
        period_ms: u64,
        callback: TimerCallback,
        token: LivenessToken,
        recurring: bool,
    ) -> TimerHandle {
        self.timers
            .add_condition_timer(period_ms, callback, token, recurring)
    }

    pub(crate) fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Armed I/O directions across all fds; nonzero keeps workers alive.
    #[must_use]
    pub fn pending_io(&self) -> usize {
        self.reactor.pending_events()
    }

    /// Raise the stop flag and join all workers. Workers drain the runqueue
    /// and wait out armed I/O and live timers before exiting.
    pub fn stop(&self) {
        if self.stopped.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return;
        }
        tracing::info!(scheduler = %self.settings.scheduler.name, "runtime stopping");
        self.sched.stop();
    }

    /// Drive `future` to completion from a non-worker thread, parking the
    /// thread between polls. The runtime is installed as current for the
    /// duration, so `Runtime::current()` resolves inside.
    pub fn block_on<F: Future>(self: &Arc<Self>, future: F) -> F::Output {
        let _guard = CurrentGuard::install(Arc::downgrade(self));
        let waker = Waker::from(Arc::new(ThreadWaker(std::thread::current())));
        let mut cx = Context::from_waker(&waker);
        let mut future = std::pin::pin!(future);
        loop {
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(value) => return value,
                Poll::Pending => std::thread::park(),
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ThreadWaker(std::thread::Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Suspend the current task for `duration`. Uses the current runtime's
/// timer set.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep::new(Runtime::current(), duration)
}

/// [`sleep`] with a millisecond count.
pub fn sleep_ms(ms: u64) -> Sleep {
    sleep(Duration::from_millis(ms))
}

#[derive(Debug, Default)]
struct SleepState {
    fired: std::sync::atomic::AtomicBool,
    waker: std::sync::Mutex<Option<Waker>>,
}

#[derive(Debug)]
pub struct Sleep {
    rt: Arc<Runtime>,
    duration: Duration,
    state: Arc<SleepState>,
    registered: bool,
}

impl Sleep {
    fn new(rt: Arc<Runtime>, duration: Duration) -> Self {
        Self {
            rt,
            duration,
            state: Arc::new(SleepState::default()),
            registered: false,
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.state.fired.load(std::sync::atomic::Ordering::Acquire) {
            return Poll::Ready(());
        }
        *self.state.waker.lock().expect("sleep waker lock") = Some(cx.waker().clone());
        if !self.registered {
            self.registered = true;
            let state = self.state.clone();
            let ms = self.duration.as_millis() as u64;
            self.rt.add_timer(
                ms,
                move || {
                    state.fired.store(true, std::sync::atomic::Ordering::Release);
                    if let Some(waker) = state.waker.lock().expect("sleep waker lock").take() {
                        waker.wake();
                    }
                },
                false,
            );
            // The timer may have fired on another worker already.
            if self.state.fired.load(std::sync::atomic::Ordering::Acquire) {
                return Poll::Ready(());
            }
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_runtime(threads: usize) -> Arc<Runtime> {
        let mut settings = Settings::default();
        settings.scheduler.threads = threads;
        settings.scheduler.name = "rt_test".into();
        Runtime::new(settings).unwrap()
    }

    #[test]
    fn spawn_runs_tasks_to_completion() {
        let rt = test_runtime(2);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            rt.spawn(async move {
                yield_now().await;
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        rt.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn batch_spawn_runs_everything() {
        let rt = test_runtime(2);
        let counter = Arc::new(AtomicU32::new(0));
        rt.spawn_batch((0..30).map(|_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        rt.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 30);
        assert_eq!(rt.pending_io(), 0);
    }

    #[test]
    fn block_on_returns_the_value() {
        let rt = test_runtime(1);
        let got = rt.block_on(async {
            yield_now().await;
            21 * 2
        });
        assert_eq!(got, 42);
        rt.stop();
    }

    #[test]
    fn sleep_suspends_for_roughly_the_duration() {
        let rt = test_runtime(2);
        let started = std::time::Instant::now();
        rt.block_on(async {
            sleep_ms(50).await;
        });
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(45), "woke after {elapsed:?}");
        rt.stop();
    }

    #[test]
    fn timer_callbacks_fire_in_deadline_order() {
        let rt = test_runtime(1);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for ms in [30u64, 10, 20] {
            let order = order.clone();
            rt.add_timer(
                ms,
                move || {
                    order.lock().unwrap().push(ms);
                },
                false,
            );
        }
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
        rt.stop();
    }

    #[test]
    fn recurring_timer_fires_until_cancelled() {
        let rt = test_runtime(1);
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let handle = rt.add_timer(
            10,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        std::thread::sleep(Duration::from_millis(100));
        handle.cancel();
        let seen = hits.load(Ordering::SeqCst);
        assert!(seen >= 3, "only {seen} firings");
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(hits.load(Ordering::SeqCst), seen);
        rt.stop();
    }

    #[test]
    fn current_resolves_inside_workers() {
        let rt = test_runtime(1);
        let ok = Arc::new(AtomicU32::new(0));
        let ok2 = ok.clone();
        rt.spawn(async move {
            if Runtime::try_current().is_some() {
                ok2.fetch_add(1, Ordering::SeqCst);
            }
        });
        rt.stop();
        assert_eq!(ok.load(Ordering::SeqCst), 1);
    }
}
