// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! A task is one suspendable unit of work: a boxed future plus the
//! bookkeeping the scheduler needs to move it between a runqueue and
//! whatever parked it.
//!
//! Lifecycle: `Init` on creation, `Ready` once submitted, `Exec` while the
//! claiming worker is inside [`Task::run`], `Hold` when it returned
//! `Pending` and some waiter (reactor slot, timer, lock queue) now owns the
//! wakeup, `Term` on completion, `Failed` if the future panicked. The panic
//! is caught here; a task never unwinds into its worker thread.
//!
//! Waking is a state transition, not a queue operation, except for
//! `Hold -> Ready` which re-submits. A wake that lands while the task is
//! `Exec` (readiness arrived before the worker finished the poll) flips the
//! state to `Ready` and the owning worker re-submits after the poll, so a
//! task is never enqueued twice and no other worker can observe it runnable
//! while it executes.

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Wake, Waker};

use super::scheduler::{Runnable, SchedulerCore};

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Task ids are process-global and never reused. Id 0 means "not a task"
/// (a thread outside any worker).
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_TASK_ID: Cell<u64> = const { Cell::new(0) };
}

/// Allocate a fresh nonzero id from the task id space. Also used for
/// synthetic lock owners on threads that are not workers.
pub(crate) fn next_id() -> u64 {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Id of the task the calling worker is currently executing, or 0.
#[must_use]
pub fn current_task_id() -> u64 {
    CURRENT_TASK_ID.with(Cell::get)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[repr(u8)]
pub enum TaskState {
    Init = 0,
    Ready = 1,
    Exec = 2,
    Hold = 3,
    Term = 4,
    Failed = 5,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Ready,
            2 => Self::Exec,
            3 => Self::Hold,
            4 => Self::Term,
            _ => Self::Failed,
        }
    }
}

/// What [`Task::run`] observed, decided atomically against concurrent
/// wakes. The worker acts on this, never on a later state read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// Future completed; task is `Term`.
    Completed,
    /// Future panicked; task is `Failed`.
    Failed,
    /// Pending, and a parker now owns the wakeup; task is `Hold`.
    Parked,
    /// Pending, but a wake arrived mid-poll; caller must re-submit.
    Yielded,
}

pub(crate) struct Task {
    id: u64,
    affinity: Option<usize>,
    state: AtomicU8,
    future: Mutex<Option<TaskFuture>>,
    sched: Weak<SchedulerCore>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("affinity", &self.affinity)
            .finish()
    }
}

impl Task {
    pub(crate) fn new(
        future: TaskFuture,
        affinity: Option<usize>,
        sched: Weak<SchedulerCore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            affinity,
            state: AtomicU8::new(TaskState::Init as u8),
            future: Mutex::new(Some(future)),
            sched,
        })
    }

    /// An empty task shell for the worker-local callback recycler; rebound
    /// with [`Task::reset`] before every use.
    pub(crate) fn recycler(affinity: Option<usize>, sched: Weak<SchedulerCore>) -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            affinity,
            state: AtomicU8::new(TaskState::Term as u8),
            future: Mutex::new(None),
            sched,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn affinity(&self) -> Option<usize> {
        self.affinity
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: TaskState) {
        self.state.store(s as u8, Ordering::Release);
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Rebind the future slot. Legal only while the task is not scheduled
    /// and not executing (`Init`, `Term` or `Failed`).
    pub(crate) fn reset(&self, future: TaskFuture) {
        let state = self.state();
        assert!(
            matches!(state, TaskState::Init | TaskState::Term | TaskState::Failed),
            "reset of a live task (state {state})"
        );
        *self.future.lock().expect("task future lock") = Some(future);
        self.set_state(TaskState::Init);
    }

    /// Poll the task once. Must only be called by the worker that claimed it
    /// from the runqueue; the `Exec` state keeps everyone else out.
    pub(crate) fn run(self: &Arc<Self>) -> PollOutcome {
        self.set_state(TaskState::Exec);
        CURRENT_TASK_ID.with(|c| c.set(self.id));

        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        let mut slot = self.future.lock().expect("task future lock");
        let Some(future) = slot.as_mut() else {
            // reset(None) equivalent: nothing to do.
            self.set_state(TaskState::Term);
            CURRENT_TASK_ID.with(|c| c.set(0));
            return PollOutcome::Completed;
        };

        let polled = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
        CURRENT_TASK_ID.with(|c| c.set(0));

        match polled {
            Ok(Poll::Ready(())) => {
                *slot = None;
                drop(slot);
                self.set_state(TaskState::Term);
                PollOutcome::Completed
            }
            Ok(Poll::Pending) => {
                drop(slot);
                if self.transition(TaskState::Exec, TaskState::Hold) {
                    PollOutcome::Parked
                } else {
                    // Woken mid-poll; state is already Ready.
                    PollOutcome::Yielded
                }
            }
            Err(panic) => {
                *slot = None;
                drop(slot);
                self.set_state(TaskState::Failed);
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".into());
                tracing::error!(task_id = self.id, panic = %msg, "task failed");
                PollOutcome::Failed
            }
        }
    }

    fn wake_task(this: &Arc<Self>) {
        loop {
            match this.state() {
                TaskState::Hold => {
                    if this.transition(TaskState::Hold, TaskState::Ready) {
                        if let Some(sched) = this.sched.upgrade() {
                            sched.push(Runnable::Task(this.clone()));
                        }
                        return;
                    }
                }
                TaskState::Exec => {
                    if this.transition(TaskState::Exec, TaskState::Ready) {
                        return;
                    }
                }
                // Already queued (Ready), not yet submitted (Init), or done.
                TaskState::Init | TaskState::Ready | TaskState::Term | TaskState::Failed => {
                    return;
                }
            }
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        Task::wake_task(&self);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        Task::wake_task(self);
    }
}

/// Reschedule the current task to the back of the runqueue.
#[must_use = "futures do nothing unless awaited"]
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn detached_task(future: TaskFuture) -> Arc<Task> {
        Task::new(future, None, Weak::new())
    }

    #[test]
    fn completes_on_first_poll() {
        let task = detached_task(Box::pin(async {}));
        assert_eq!(task.state(), TaskState::Init);
        assert_eq!(task.run(), PollOutcome::Completed);
        assert_eq!(task.state(), TaskState::Term);
    }

    #[test]
    fn panic_is_contained_and_marks_failed() {
        let task = detached_task(Box::pin(async { panic!("boom") }));
        assert_eq!(task.run(), PollOutcome::Failed);
        assert_eq!(task.state(), TaskState::Failed);
    }

    #[test]
    fn yield_reports_mid_poll_wake() {
        // yield_now wakes its own waker before returning Pending, which is
        // exactly the "woken while Exec" race.
        let task = detached_task(Box::pin(async { yield_now().await }));
        assert_eq!(task.run(), PollOutcome::Yielded);
        assert_eq!(task.state(), TaskState::Ready);
        assert_eq!(task.run(), PollOutcome::Completed);
    }

    #[test]
    fn pending_without_wake_parks() {
        let task = detached_task(Box::pin(std::future::pending::<()>()));
        assert_eq!(task.run(), PollOutcome::Parked);
        assert_eq!(task.state(), TaskState::Hold);
    }

    #[test]
    fn reset_rebinds_a_finished_task() {
        let task = detached_task(Box::pin(async {}));
        task.run();
        task.reset(Box::pin(async {}));
        assert_eq!(task.state(), TaskState::Init);
        assert_eq!(task.run(), PollOutcome::Completed);
    }

    #[test]
    fn current_task_id_visible_inside_poll() {
        struct IdProbe(Arc<AtomicU64>);
        impl Future for IdProbe {
            type Output = ();
            fn poll(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<()> {
                self.0.store(current_task_id(), Ordering::SeqCst);
                Poll::Ready(())
            }
        }
        let seen = Arc::new(AtomicU64::new(0));
        let task = detached_task(Box::pin(IdProbe(seen.clone())));
        let id = task.id();
        task.run();
        assert_eq!(seen.load(Ordering::SeqCst), id);
        assert_eq!(current_task_id(), 0);
    }
}
