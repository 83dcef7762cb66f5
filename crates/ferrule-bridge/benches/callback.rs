//! Callback Benchmarks
//!
//! Cost of crossing the bridge:
//! - Calling a host callback with a varying number of arguments
//! - Reporting a host error through the failure slot
//! - Calling through a bound function
//! - Protected table primitives
//!
//! Run with: cargo bench --bench callback

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ferrule_bridge::{Bridge, Error, Value};

fn ints(n: i64) -> Vec<Value> {
    (0..n).map(Value::Integer).collect()
}

// ============================================================================
// Callbacks
// ============================================================================

fn bench_call_echo(c: &mut Criterion) {
    let mut group = c.benchmark_group("callback_echo");
    for nargs in [0i64, 1, 4, 16] {
        let mut bridge = Bridge::new().unwrap();
        let echo = bridge.create_function(|_, args| Ok(args)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(nargs), &nargs, |b, &n| {
            b.iter(|| bridge.call_function(&echo, black_box(ints(n))).unwrap());
        });
    }
    group.finish();
}

fn bench_call_error(c: &mut Criterion) {
    let mut bridge = Bridge::new().unwrap();
    let failing = bridge
        .create_function(|_, _| Err(Error::runtime("bench")))
        .unwrap();
    c.bench_function("callback_error", |b| {
        b.iter(|| bridge.call_function(&failing, vec![]).unwrap_err());
    });
}

fn bench_call_bound(c: &mut Criterion) {
    let mut bridge = Bridge::new().unwrap();
    let echo = bridge.create_function(|_, args| Ok(args)).unwrap();
    let bound = bridge.bind(&echo, ints(4)).unwrap();
    c.bench_function("callback_bound_4", |b| {
        b.iter(|| bridge.call_function(&bound, black_box(ints(2))).unwrap());
    });
}

// ============================================================================
// Table primitives
// ============================================================================

fn bench_table_insert_remove(c: &mut Criterion) {
    let mut bridge = Bridge::new().unwrap();
    let t = bridge.create_table().unwrap();
    for i in 1..=64 {
        bridge.raw_insert(&t, i, Value::Integer(i)).unwrap();
    }
    c.bench_function("table_insert_remove_front", |b| {
        b.iter(|| {
            bridge.raw_insert(&t, 1, Value::Integer(0)).unwrap();
            bridge.raw_remove(&t, 1).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_call_echo,
    bench_call_error,
    bench_call_bound,
    bench_table_insert_remove
);
criterion_main!(benches);
