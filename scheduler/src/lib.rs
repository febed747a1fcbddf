// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A user-space fiber runtime and work-stealing task scheduler.
//!
//! A [`Scheduler`] owns a pool of *task threads*, each running ready
//! [`Task`](task::Task)s as stackful fibers, and a pool of *reactor
//! threads* that perform a waiting task's blocking wait for it, so a task
//! thread is never blocked on another task's completion. Work moves between
//! threads through the lock-free SPSC queues in [`spsc`]; a single
//! coordinator — the work pump — is the only code allowed to touch more
//! than one thread's queues at a time, serialized by a simple spinlock.
//!
//! Build one with [`Builder`]:
//!
//! ```no_run
//! let scheduler = scheduler::Builder::new()
//!     .task_threads(4)
//!     .reactor_threads(1)
//!     .build()
//!     .unwrap();
//!
//! scheduler.run_and_wait(|| {
//!     println!("running on a task thread");
//! });
//! ```

mod builder;
mod error;
mod options;
mod pump;
mod scheduler;
mod task;
mod thread;

use std::sync::{Arc, Mutex, OnceLock};

pub use builder::Builder;
pub use error::Error;
pub use options::Options;
pub use scheduler::{yield_now, PendingTask, Scheduler};
pub use task::{TaskFn, TaskHandle};

fn default_slot() -> &'static Mutex<Option<Arc<Scheduler>>> {
    static DEFAULT: OnceLock<Mutex<Option<Arc<Scheduler>>>> = OnceLock::new();
    DEFAULT.get_or_init(|| Mutex::new(None))
}

/// Installs `scheduler` as the process-wide default, replacing whatever was
/// installed before.
pub fn set_default(scheduler: Arc<Scheduler>) {
    *default_slot().lock().unwrap() = Some(scheduler);
}

/// Returns the process-wide default scheduler, if one has been installed
/// with [`set_default`].
#[must_use]
pub fn default() -> Option<Arc<Scheduler>> {
    default_slot().lock().unwrap().clone()
}
