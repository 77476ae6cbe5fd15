//! Dispatch throughput: one stub call, one trap, one handler.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ferry_abi::{api, Array, GuestSlice};
use ferry_runtime::{Bridge, ObjectApiStubs};
use std::sync::Arc;

#[api(module = 9, name = "bench")]
pub trait BenchApi: Send + Sync {
    fn add(&self, a: u64, b: u64) -> u64;
    fn sum(&self, values: Array<u32>) -> u32;
}

struct BenchHost;

impl BenchApi for BenchHost {
    fn add(&self, a: u64, b: u64) -> u64 {
        a.wrapping_add(b)
    }

    fn sum(&self, values: Vec<u32>) -> u32 {
        values.iter().copied().fold(0, u32::wrapping_add)
    }
}

fn bridge() -> Arc<Bridge> {
    let table = BenchApiOp::dispatch_table(Arc::new(BenchHost));
    Arc::new(Bridge::windowed_with(1 << 20, [table]).unwrap())
}

fn bench_scalar_call(c: &mut Criterion) {
    let stubs = BenchApiStubs::new(bridge());
    c.bench_function("scalar_call", |b| {
        b.iter(|| stubs.add(black_box(20), black_box(22)))
    });
}

fn bench_array_call(c: &mut Criterion) {
    let bridge = bridge();
    let stubs = BenchApiStubs::new(Arc::clone(&bridge));
    let mut group = c.benchmark_group("array_call");
    for len in [1usize, 64, 4096] {
        let values: Vec<u32> = (0..len as u32).collect();
        let addr = bridge.memory().alloc_slice(&values).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            b.iter(|| stubs.sum(GuestSlice::new(addr, black_box(len))))
        });
    }
    group.finish();
}

fn bench_ref_counting(c: &mut Criterion) {
    let bridge = bridge();
    let handle = bridge.objects().insert(0u64, &[]);
    let stubs = ObjectApiStubs::new(Arc::clone(&bridge));
    c.bench_function("add_ref_release", |b| {
        b.iter(|| {
            stubs.add_ref(black_box(handle));
            stubs.release(black_box(handle))
        })
    });
}

criterion_group!(benches, bench_scalar_call, bench_array_call, bench_ref_counting);
criterion_main!(benches);
