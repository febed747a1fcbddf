// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::measurement::Measurement;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use fiber::stack::StackPool;
use fiber::{Options, get_api};

unsafe extern "C" fn noop(_user_data: *mut u8) {}

fn fiber_create<M: Measurement + 'static>(name: &str, c: &mut Criterion<M>) {
    let api = get_api(Options::NONE);
    let mut pool = StackPool::new(64 * 1024);

    c.bench_function(name, |b| {
        b.iter(|| {
            let stack = pool.acquire();
            // Safety: `stack` outlives the created fiber for the duration of
            // this benchmark iteration; the fiber is never started.
            let fiber = unsafe {
                api.create(stack.as_ptr(), stack.len(), 0, noop, std::ptr::null_mut())
            };
            black_box(fiber);
            pool.release(stack);
        });
    });
}

fn fiber_create_time(c: &mut Criterion) {
    fiber_create("fiber_create_time", c);
}

criterion_group!(
    name = time;
    config = Criterion::default();
    targets = fiber_create_time
);

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        use criterion_cycles_per_byte::CyclesPerByte;

        fn fiber_create_cycles(c: &mut Criterion<CyclesPerByte>) {
            fiber_create("fiber_create_cycles", c);
        }

        criterion_group!(
            name = cycles;
            config = Criterion::default().with_measurement(CyclesPerByte);
            targets = fiber_create_cycles
        );

        criterion_main!(cycles, time);
    } else {
        criterion_main!(time);
    }
}
