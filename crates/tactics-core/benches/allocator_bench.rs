//! Benchmarks for the buffer allocators.

use std::hint::black_box;
use std::rc::Rc;

use criterion::{Criterion, criterion_group, criterion_main};

use tactics_core::memory::{BufferAllocator, DefaultAllocator, DeferBufferAllocator, EagerBufferAllocator};

/// Sizes cycled through by the workloads.
const SIZES: [usize; 8] = [64, 256, 1000, 4096, 128, 512, 20_000, 96];

/// Allocates a window of live chunks, freeing the oldest as each new one
/// arrives.
fn sliding_window(allocator: &mut dyn BufferAllocator, steps: usize, window: usize) {
    let mut live = std::collections::VecDeque::with_capacity(window);
    for i in 0..steps {
        live.push_back(allocator.alloc(SIZES[i % SIZES.len()], false, 0));
        if live.len() > window {
            if let Some(chunk) = live.pop_front() {
                allocator.free(&chunk);
            }
        }
    }
}

fn bench_eager_sliding_window(c: &mut Criterion) {
    c.bench_function("eager_sliding_window_1000", |b| {
        b.iter(|| {
            let mut eager = EagerBufferAllocator::new(Rc::new(DefaultAllocator::new()));
            sliding_window(&mut eager, 1000, 8);
            black_box(eager.total_size())
        });
    });
}

fn bench_eager_warm_reuse(c: &mut Criterion) {
    let mut eager = EagerBufferAllocator::new(Rc::new(DefaultAllocator::new()));
    sliding_window(&mut eager, 1000, 8);
    eager.release(false);

    c.bench_function("eager_warm_reuse", |b| {
        b.iter(|| {
            sliding_window(&mut eager, 200, 8);
            eager.release(false);
            black_box(eager.total_size())
        });
    });
}

fn bench_defer_plan_and_compute(c: &mut Criterion) {
    c.bench_function("defer_plan_compute_1000", |b| {
        b.iter(|| {
            let mut defer = DeferBufferAllocator::new(Rc::new(DefaultAllocator::new()));
            sliding_window(&mut defer, 1000, 8);
            defer.compute().unwrap();
            black_box(defer.total_size())
        });
    });
}

fn bench_defer_replan(c: &mut Criterion) {
    let mut defer = DeferBufferAllocator::new(Rc::new(DefaultAllocator::new()));
    sliding_window(&mut defer, 1000, 8);
    defer.compute().unwrap();

    c.bench_function("defer_replan_keeps_backing", |b| {
        b.iter(|| {
            defer.release(false);
            sliding_window(&mut defer, 1000, 8);
            defer.compute().unwrap();
            black_box(defer.backing_size())
        });
    });
}

criterion_group!(
    benches,
    bench_eager_sliding_window,
    bench_eager_warm_reuse,
    bench_defer_plan_and_compute,
    bench_defer_replan,
);

criterion_main!(benches);
