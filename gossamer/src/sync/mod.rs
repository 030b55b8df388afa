// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Scheduler-aware synchronization.
//!
//! These primitives park *tasks*, not threads: a contended
//! [`CoMutex::lock`], a [`CoCondVar::wait`] or a full/empty [`Channel`]
//! suspends the calling task and hands the wakeup to whoever releases,
//! notifies or sends next. Worker threads stay free to run other tasks, so
//! the primitives compose with I/O instead of starving it.

mod channel;
mod co_condvar;
mod co_mutex;

pub use channel::*;
pub use co_condvar::*;
pub use co_mutex::*;
