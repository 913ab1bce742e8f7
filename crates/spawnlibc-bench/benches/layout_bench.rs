//! Mapping layout benchmarks.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use spawnlibc_core::config::AddressSpace;
use spawnlibc_core::pthread::layout::{LayoutRequest, compute_layout, randomized_stack_top};
use spawnlibc_core::random::SplitMix64;

fn bench_compute_layout(c: &mut Criterion) {
    let sizes: &[usize] = &[16 * 1024, 256 * 1024, 2 * 1024 * 1024, 8 * 1024 * 1024];
    let rng = SplitMix64::new(0x1234);
    let mut group = c.benchmark_group("compute_layout");

    for &size in sizes {
        for (label, space) in [
            ("abundant", AddressSpace::Abundant),
            ("constrained", AddressSpace::Constrained),
        ] {
            let request = LayoutRequest {
                stack_size: size,
                guard_size: 4096,
                page_size: 4096,
                static_tls_size: 2048,
                bookkeeping_size: 512,
                address_space: space,
            };
            group.bench_with_input(BenchmarkId::new(label, size), &request, |b, request| {
                b.iter(|| black_box(compute_layout(black_box(request), &rng)));
            });
        }
    }
    group.finish();
}

fn bench_stack_top(c: &mut Criterion) {
    let rng = SplitMix64::new(7);
    c.bench_function("randomized_stack_top", |b| {
        b.iter(|| black_box(randomized_stack_top(black_box(0x7f00_0020_0000), 512, &rng)));
    });
}

criterion_group!(benches, bench_compute_layout, bench_stack_top);
criterion_main!(benches);
