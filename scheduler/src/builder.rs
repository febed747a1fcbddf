// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use fiber::stack::MIN_STACK_SIZE;

use crate::error::Error;
use crate::options::Options;
use crate::scheduler::Scheduler;

const DEFAULT_TASK_STACK_SIZE: usize = 64 * 1024;
const DEFAULT_REACTOR_THREADS: u32 = 1;

/// Configures and builds a [`Scheduler`].
///
/// ```no_run
/// # use scheduler::Builder;
/// let sch = Builder::new()
///     .task_threads(4)
///     .reactor_threads(2)
///     .build()
///     .unwrap();
/// ```
pub struct Builder {
    task_threads: u32,
    max_task_threads: Option<u32>,
    reactor_threads: u32,
    options: Options,
    task_stack_size: usize,
    root_stack_size: usize,
}

impl Default for Builder {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZero::get) as u32;
        Self {
            task_threads: cpus,
            max_task_threads: None,
            reactor_threads: DEFAULT_REACTOR_THREADS,
            options: Options::NONE,
            task_stack_size: DEFAULT_TASK_STACK_SIZE,
            root_stack_size: MIN_STACK_SIZE,
        }
    }
}

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of task threads to spawn immediately. Defaults to
    /// [`std::thread::available_parallelism`].
    #[must_use]
    pub fn task_threads(mut self, count: u32) -> Self {
        self.task_threads = count;
        self
    }

    /// Upper bound on task threads ever spawned, including ones added later
    /// with [`Scheduler::add_task_thread`]. Defaults to `task_threads`.
    #[must_use]
    pub fn max_task_threads(mut self, count: u32) -> Self {
        self.max_task_threads = Some(count);
        self
    }

    /// Number of reactor threads to spawn. Waiting tasks are spread across
    /// these; zero is valid but makes every wait busy-spin on its own task
    /// thread instead of handing off.
    #[must_use]
    pub fn reactor_threads(mut self, count: u32) -> Self {
        self.reactor_threads = count;
        self
    }

    #[must_use]
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Stack size for every task fiber. Rounded up to
    /// [`fiber::stack::MIN_STACK_SIZE`].
    #[must_use]
    pub fn task_stack_size(mut self, bytes: usize) -> Self {
        self.task_stack_size = bytes;
        self
    }

    /// Stack size for each worker thread's root fiber.
    #[must_use]
    pub fn root_stack_size(mut self, bytes: usize) -> Self {
        self.root_stack_size = bytes;
        self
    }

    /// Builds the scheduler, spawning its task and reactor threads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoTaskThreads`] if `task_threads` is zero, or
    /// [`Error::TooManyTaskThreads`] if it exceeds `max_task_threads`.
    pub fn build(self) -> Result<Arc<Scheduler>, Error> {
        if self.task_threads == 0 {
            return Err(Error::NoTaskThreads);
        }
        let max_task_threads = self.max_task_threads.unwrap_or(self.task_threads);
        if self.task_threads > max_task_threads {
            return Err(Error::TooManyTaskThreads);
        }

        Ok(Scheduler::new(
            self.task_threads,
            max_task_threads,
            self.reactor_threads,
            self.options,
            self.task_stack_size,
            self.root_stack_size,
        ))
    }
}
