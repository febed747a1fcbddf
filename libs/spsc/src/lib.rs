// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Single-producer/single-consumer queue algebra for the `scheduler` crate.
//!
//! [`Ring`] is a bounded, fixed-capacity ring buffer; [`Queue`] is an
//! unbounded queue built from a chain of `Ring` blocks, recycling retired
//! blocks instead of freeing and reallocating them. Both require the caller
//! to uphold the single-producer/single-consumer contract themselves — the
//! types do not track which thread is calling.

mod queue;
mod ring;

pub use queue::Queue;
pub use ring::Ring;
