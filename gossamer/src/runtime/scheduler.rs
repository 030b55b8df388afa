// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Worker thread pool around a shared FIFO runqueue.
//!
//! Workers claim runnables, poll them, and decide what happens next from
//! the poll outcome: re-submit on yield, forget on park (whatever parked
//! the task owns its wakeup), drop on completion. A worker with nothing to
//! claim parks on the installed [`IdleParker`]; the runtime installs a
//! reactor-backed parker so that exactly one idle worker blocks on the OS
//! readiness demultiplexer while the rest sleep on the queue condvar.
//!
//! Stop protocol: `request_stop` raises the flag and unparks everyone.
//! A worker exits only when the flag is up, the queue is empty, no worker
//! is mid-poll, and the parker reports no outstanding parked work (armed
//! I/O, live timers). That last gate is what keeps workers alive while a
//! task is parked on a socket.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use super::task::{PollOutcome, Task};

/// One entry in the runqueue: a resumable task, or a plain callback that
/// runs to completion on the claiming worker.
pub(crate) enum Runnable {
    Task(Arc<Task>),
    Call {
        f: Box<dyn FnOnce() + Send + 'static>,
        affinity: Option<usize>,
    },
}

impl Runnable {
    fn affinity(&self) -> Option<usize> {
        match self {
            Runnable::Task(t) => t.affinity(),
            Runnable::Call { affinity, .. } => *affinity,
        }
    }
}

impl std::fmt::Debug for Runnable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Runnable::Task(t) => f.debug_tuple("Task").field(&t.id()).finish(),
            Runnable::Call { affinity, .. } => f.debug_tuple("Call").field(affinity).finish(),
        }
    }
}

/// How a worker with an empty runqueue waits, and what blocks shutdown.
pub(crate) trait IdleParker: Send + Sync + 'static {
    /// Block the calling worker until work may be available. May return
    /// spuriously; the worker re-checks the queue either way.
    fn park(&self, core: &SchedulerCore);

    /// Wake at least one parked worker.
    fn unpark(&self, core: &SchedulerCore);

    /// Parked work that forbids worker exit (armed I/O, live timers).
    fn busy(&self) -> bool {
        false
    }
}

/// Plain condvar parker; the runtime replaces it with the reactor.
#[derive(Debug, Default)]
pub(crate) struct CondvarParker;

impl IdleParker for CondvarParker {
    fn park(&self, core: &SchedulerCore) {
        core.park_on_queue();
    }

    fn unpark(&self, core: &SchedulerCore) {
        core.notify_queue(false);
    }
}

pub(crate) struct SchedulerCore {
    name: String,
    threads: usize,
    queue: Mutex<VecDeque<Runnable>>,
    queue_cv: Condvar,
    stop: AtomicBool,
    active: AtomicUsize,
    idle: AtomicUsize,
    parker: OnceLock<Arc<dyn IdleParker>>,
}

impl std::fmt::Debug for SchedulerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerCore")
            .field("name", &self.name)
            .field("threads", &self.threads)
            .field("stop", &self.stop.load(Ordering::Relaxed))
            .finish()
    }
}

impl SchedulerCore {
    pub(crate) fn new(name: String, threads: usize) -> Arc<Self> {
        assert!(threads > 0, "scheduler needs at least one worker");
        Arc::new(Self {
            name,
            threads,
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            stop: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            parker: OnceLock::new(),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn threads(&self) -> usize {
        self.threads
    }

    /// Install the idle parker. Must happen before `start`; calling twice
    /// is a bug.
    pub(crate) fn install_parker(&self, parker: Arc<dyn IdleParker>) {
        assert!(
            self.parker.set(parker).is_ok(),
            "idle parker installed twice"
        );
    }

    fn parker(&self) -> &Arc<dyn IdleParker> {
        self.parker.get().expect("idle parker not installed")
    }

    pub(crate) fn push(&self, runnable: Runnable) {
        let was_empty = {
            let mut queue = self.queue.lock().expect("runqueue lock");
            let was_empty = queue.is_empty();
            queue.push_back(runnable);
            was_empty
        };
        if was_empty {
            self.parker().unpark(self);
        }
    }

    pub(crate) fn push_batch(&self, runnables: impl IntoIterator<Item = Runnable>) {
        let was_empty = {
            let mut queue = self.queue.lock().expect("runqueue lock");
            let was_empty = queue.is_empty();
            queue.extend(runnables);
            was_empty && !queue.is_empty()
        };
        if was_empty {
            self.parker().unpark(self);
        }
    }

    /// Pull the first runnable this worker may claim: affinity unset, or
    /// pinned to exactly this worker. If claimable work remains afterwards,
    /// tickle one peer so it gets drained in parallel.
    fn claim(&self, worker_id: usize) -> Option<Runnable> {
        let mut tickle = false;
        let claimed = {
            let mut queue = self.queue.lock().expect("runqueue lock");
            let mut found = None;
            for (i, runnable) in queue.iter().enumerate() {
                match runnable.affinity() {
                    Some(pinned) if pinned != worker_id => {
                        // Someone else's; make sure they hear about it.
                        tickle = true;
                    }
                    _ => {
                        found = Some(i);
                        break;
                    }
                }
            }
            let claimed = found.and_then(|i| queue.remove(i));
            if claimed.is_some() && !queue.is_empty() {
                tickle = true;
            }
            claimed
        };
        if tickle {
            self.parker().unpark(self);
        }
        claimed
    }

    /// stop requested ∧ runqueue empty ∧ nobody mid-poll. The runtime adds
    /// the parker's busy gate on top.
    pub(crate) fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
            && self.active.load(Ordering::Acquire) == 0
            && self.queue.lock().expect("runqueue lock").is_empty()
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.notify_queue(true);
        // Also kick the reactor-side parker so a blocked poll returns.
        if let Some(parker) = self.parker.get() {
            parker.unpark(self);
        }
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    /// Sleep on the queue condvar until work or stop. Bounded wait as a
    /// lost-wakeup backstop.
    pub(crate) fn park_on_queue(&self) {
        let queue = self.queue.lock().expect("runqueue lock");
        if !queue.is_empty() || self.stop_requested() {
            return;
        }
        let _unused = self
            .queue_cv
            .wait_timeout(queue, Duration::from_millis(500))
            .expect("runqueue lock");
    }

    pub(crate) fn notify_queue(&self, all: bool) {
        if all {
            self.queue_cv.notify_all();
        } else {
            self.queue_cv.notify_one();
        }
    }

    /// The worker body. `worker_id` claims pinned work; `thread_init` ran
    /// already on this thread (runtime thread-local install).
    pub(crate) fn worker_loop(self: &Arc<Self>, worker_id: usize) {
        tracing::debug!(worker = worker_id, scheduler = %self.name, "worker up");
        // Recycled shell for plain callbacks, one per worker.
        let recycler = Task::recycler(Some(worker_id), Arc::downgrade(self));

        loop {
            if let Some(runnable) = self.claim(worker_id) {
                self.active.fetch_add(1, Ordering::AcqRel);
                match runnable {
                    Runnable::Task(task) => {
                        let outcome = task.run();
                        match outcome {
                            PollOutcome::Yielded => self.push(Runnable::Task(task)),
                            PollOutcome::Parked
                            | PollOutcome::Completed
                            | PollOutcome::Failed => {}
                        }
                    }
                    Runnable::Call { f, .. } => {
                        // Wrap in the recycled task so callback panics get
                        // the same containment as task panics.
                        recycler.reset(Box::pin(async move { f() }));
                        let _outcome = recycler.run();
                    }
                }
                self.active.fetch_sub(1, Ordering::AcqRel);
                continue;
            }

            if self.stopping() && !self.parker().busy() {
                break;
            }

            self.idle.fetch_add(1, Ordering::AcqRel);
            self.parker().park(self);
            self.idle.fetch_sub(1, Ordering::AcqRel);
        }
        tracing::debug!(worker = worker_id, scheduler = %self.name, "worker exit");
    }
}

/// Owns the worker threads for a [`SchedulerCore`].
#[derive(Debug)]
pub(crate) struct Scheduler {
    core: Arc<SchedulerCore>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn new(core: Arc<SchedulerCore>) -> Self {
        Self {
            core,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn core(&self) -> &Arc<SchedulerCore> {
        &self.core
    }

    /// Spawn the configured number of workers. `thread_init` runs first on
    /// each worker thread (the runtime installs its thread-local handle).
    pub(crate) fn start(&self, thread_init: Arc<dyn Fn() + Send + Sync>) {
        let mut workers = self.workers.lock().expect("worker list lock");
        assert!(workers.is_empty(), "scheduler started twice");
        for worker_id in 0..self.core.threads() {
            let core = self.core.clone();
            let init = thread_init.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}_{worker_id}", self.core.name()))
                .spawn(move || {
                    init();
                    core.worker_loop(worker_id);
                })
                .expect("spawn worker thread");
            workers.push(handle);
        }
    }

    /// Raise the stop flag, wake everyone, join all workers.
    pub(crate) fn stop(&self) {
        self.core.request_stop();
        let workers = {
            let mut guard = self.workers.lock().expect("worker list lock");
            std::mem::take(&mut *guard)
        };
        for handle in workers {
            // Workers can be parked between the flag and the join; keep
            // nudging until each one observes the stop.
            while !handle.is_finished() {
                self.core.request_stop();
                std::thread::sleep(Duration::from_millis(10));
            }
            let _unused = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;

    fn small_core(threads: usize) -> (Arc<SchedulerCore>, Scheduler) {
        let core = SchedulerCore::new("test".into(), threads);
        core.install_parker(Arc::new(CondvarParker));
        let sched = Scheduler::new(core.clone());
        (core, sched)
    }

    #[test]
    fn callbacks_run_and_scheduler_drains_on_stop() {
        let (core, sched) = small_core(2);
        sched.start(Arc::new(|| {}));
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..100 {
            let hits = hits.clone();
            core.push(Runnable::Call {
                f: Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
                affinity: None,
            });
        }
        // stop() drains: the flag is up but the queue must empty first.
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn affinity_pins_to_one_worker() {
        let (core, sched) = small_core(3);
        sched.start(Arc::new(|| {}));
        let names = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..20 {
            let names = names.clone();
            core.push(Runnable::Call {
                f: Box::new(move || {
                    let name = std::thread::current().name().unwrap_or("?").to_string();
                    names.lock().unwrap().push(name);
                }),
                affinity: Some(1),
            });
        }
        sched.stop();
        let names = names.lock().unwrap();
        assert_eq!(names.len(), 20);
        assert!(names.iter().all(|n| n == "test_1"), "got {names:?}");
    }

    #[test]
    fn callback_panic_does_not_kill_the_worker() {
        let (core, sched) = small_core(1);
        sched.start(Arc::new(|| {}));
        let hits = Arc::new(AtomicU32::new(0));
        core.push(Runnable::Call {
            f: Box::new(|| panic!("handler bug")),
            affinity: None,
        });
        let hits2 = hits.clone();
        core.push(Runnable::Call {
            f: Box::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
            affinity: None,
        });
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tasks_yield_and_resume_until_done() {
        let (core, sched) = small_core(2);
        sched.start(Arc::new(|| {}));
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let task = Task::new(
            Box::pin(async move {
                for _ in 0..5 {
                    c.fetch_add(1, Ordering::SeqCst);
                    crate::runtime::task::yield_now().await;
                }
            }),
            None,
            Arc::downgrade(&core),
        );
        task.set_state(super::super::task::TaskState::Ready);
        core.push(Runnable::Task(task));
        sched.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
