//! # Throttle Benchmarks
//!
//! Hot-path costs of the byte-rate engine and the delay primitive.
//!
//! Run with: `cargo bench`

use byte_throttle::{DelayKind, ManualClock, NativeDelay, Throttle, ThrottleBuilder};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Non-waiting debits against a bucket that never runs dry.
fn bench_try_account(c: &mut Criterion) {
    let mut group = c.benchmark_group("try_account");

    for amount in [1i64, 1024, 64 * 1024] {
        group.throughput(Throughput::Bytes(amount as u64));
        group.bench_with_input(BenchmarkId::from_parameter(amount), &amount, |b, &amount| {
            let throttle = Throttle::builder()
                .rate(i64::MAX / 2)
                .burst(i64::MAX / 2)
                .build()
                .unwrap();
            let state = throttle.new_state();
            b.iter(|| std::hint::black_box(throttle.try_account(&state, amount)));
        });
    }

    group.finish();
}

/// The async path when tokens are available: no delay is ever armed.
fn bench_account_or_wait_admitted(c: &mut Criterion) {
    let throttle = Throttle::builder()
        .rate(i64::MAX / 2)
        .burst(i64::MAX / 2)
        .build()
        .unwrap();
    let state = throttle.new_state();
    let cancel = CancellationToken::new();

    c.bench_function("account_or_wait_admitted", |b| {
        b.iter(|| {
            futures::executor::block_on(throttle.account_or_wait(&state, 4096, &cancel)).unwrap()
        })
    });
}

/// Refill claim plus debit on every call, driven by a manual clock.
fn bench_refill(c: &mut Criterion) {
    let clock = Arc::new(ManualClock::new());
    let throttle = ThrottleBuilder::new()
        .rate(1_000_000)
        .burst(1_000_000)
        .clock(Arc::clone(&clock))
        .build()
        .unwrap();
    let state = throttle.new_state();

    c.bench_function("refill_and_debit", |b| {
        b.iter(|| {
            clock.advance_ticks(1_000);
            std::hint::black_box(throttle.try_account(&state, 1))
        })
    });
}

/// Many threads debiting one shared state.
fn bench_shared_state_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_state_contention");

    for num_threads in [2, 4, 8] {
        group.throughput(Throughput::Elements(num_threads as u64 * 1000));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{num_threads}_threads")),
            &num_threads,
            |b, &num_threads| {
                let throttle = Arc::new(
                    Throttle::builder()
                        .rate(i64::MAX / 2)
                        .burst(i64::MAX / 2)
                        .build()
                        .unwrap(),
                );
                let state = Arc::new(throttle.new_state());

                b.iter_custom(|iters| {
                    let mut total_duration = Duration::ZERO;

                    for _ in 0..iters {
                        throttle.reset_state(&state);
                        let start = Instant::now();

                        let handles: Vec<_> = (0..num_threads)
                            .map(|_| {
                                let throttle = Arc::clone(&throttle);
                                let state = Arc::clone(&state);
                                thread::spawn(move || {
                                    for _ in 0..1000 {
                                        throttle.try_account(&state, 64);
                                    }
                                })
                            })
                            .collect();

                        for handle in handles {
                            handle.join().unwrap();
                        }

                        total_duration += start.elapsed();
                    }

                    total_duration
                });
            },
        );
    }

    group.finish();
}

/// Arm, await and tear down one short delay.
fn bench_delay_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("delay_round_trip");
    group.sample_size(20);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    for kind in [DelayKind::Portable, DelayKind::HighResolution] {
        if !kind.is_available() {
            continue;
        }
        group.bench_function(format!("{kind:?}"), |b| {
            let mut delay = NativeDelay::new(kind);
            let cancel = CancellationToken::new();
            b.iter(|| {
                runtime.block_on(async {
                    delay
                        .wait(Duration::from_micros(200), &cancel)
                        .unwrap()
                        .await
                        .unwrap()
                })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_try_account,
    bench_account_or_wait_admitted,
    bench_refill,
    bench_shared_state_contention,
    bench_delay_round_trip,
);

criterion_main!(benches);
