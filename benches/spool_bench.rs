//! Benchmarks for the spools.
//!
//! Benchmarks cover:
//! - Thread spool throughput for trivial jobs at several quotas
//! - Task spool throughput on a `LocalSet`
//! - Backlog-heavy drains where admission dominates

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use spool::config::SpoolConfig;
use spool::core::{FinishOptions, NullProgress, TaskSpool, ThreadSpool};
use spool::runtime::LocalRuntime;

const JOBS: u64 = 200;

fn config(quota: usize) -> SpoolConfig {
    SpoolConfig::new()
        .with_quota(quota)
        .with_name("bench")
        .with_show_progress(false)
}

// ============================================================================
// ThreadSpool
// ============================================================================

fn bench_thread_spool(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_spool");
    group.throughput(Throughput::Elements(JOBS));
    group.sample_size(20);

    for quota in [1_usize, 4, 16] {
        group.bench_with_input(BenchmarkId::new("drain", quota), &quota, |b, &quota| {
            b.iter(|| {
                let sum = Arc::new(AtomicU64::new(0));
                let spool =
                    ThreadSpool::with_sink(config(quota), Arc::new(NullProgress)).unwrap();
                for i in 0..JOBS {
                    let sum = Arc::clone(&sum);
                    spool
                        .enqueue(move || {
                            sum.fetch_add(black_box(i), Ordering::Relaxed);
                        })
                        .unwrap();
                }
                spool.finish(FinishOptions::new()).unwrap();
                black_box(sum.load(Ordering::Relaxed))
            });
        });
    }
    group.finish();
}

// ============================================================================
// TaskSpool
// ============================================================================

fn bench_task_spool(c: &mut Criterion) {
    let rt = LocalRuntime::new().unwrap();
    let mut group = c.benchmark_group("task_spool");
    group.throughput(Throughput::Elements(JOBS));

    for quota in [1_usize, 8, 64] {
        group.bench_with_input(BenchmarkId::new("drain", quota), &quota, |b, &quota| {
            b.iter(|| {
                rt.block_on(async {
                    let spool = TaskSpool::with_sink(config(quota), Arc::new(NullProgress)).unwrap();
                    for i in 0..JOBS {
                        spool
                            .enqueue(async move {
                                tokio::task::yield_now().await;
                                black_box(i);
                            })
                            .unwrap();
                    }
                    spool.finish(FinishOptions::new()).await.unwrap();
                });
            });
        });
    }
    group.finish();
}

// ============================================================================
// Admission under a deep backlog
// ============================================================================

fn bench_belayed_backlog(c: &mut Criterion) {
    let mut group = c.benchmark_group("belayed_backlog");
    group.sample_size(10);
    group.bench_function("thread_1000_jobs_quota_8", |b| {
        b.iter(|| {
            let spool = ThreadSpool::with_sink(
                config(8).with_autostart(false),
                Arc::new(NullProgress),
            )
            .unwrap();
            for _ in 0..1000 {
                spool.enqueue(|| ()).unwrap();
            }
            spool.finish(FinishOptions::new()).unwrap();
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_thread_spool,
    bench_task_spool,
    bench_belayed_backlog
);
criterion_main!(benches);
