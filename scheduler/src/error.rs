// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Errors returned while configuring or constructing a [`Scheduler`](crate::Scheduler).
#[derive(Debug)]
pub enum Error {
    /// `Builder::task_threads` was configured to zero; a scheduler with no
    /// task thread can never run a task.
    NoTaskThreads,
    /// `Builder::task_threads` exceeded `Builder::max_task_threads`.
    TooManyTaskThreads,
    /// `Thread::add` was called with every pre-provisioned task thread slot
    /// already spawned; raise `Builder::max_task_threads` up front instead.
    NoCapacity,
    /// The fiber stack pool could not allocate a root or task stack.
    Stack(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoTaskThreads => f.write_str("scheduler must have at least one task thread"),
            Error::TooManyTaskThreads => f.write_str("task_threads exceeds max_task_threads"),
            Error::NoCapacity => f.write_str("no unspawned task thread slot left to add"),
            Error::Stack(err) => write!(f, "failed to allocate fiber stack: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Stack(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Stack(err)
    }
}
