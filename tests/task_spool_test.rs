//! Integration tests for TaskSpool
//!
//! Every test runs inside a `LocalSet` because task spools spawn with
//! `spawn_local`. Covered:
//! - Completion of every queued future, including ones queued mid-drain
//! - Quota enforcement and live quota changes
//! - Failure isolation for erroring and panicking futures
//! - Cancellation, flush, resume and pre-loaded spools
//! - Driving a spool from synchronous code through `LocalRuntime`

#![cfg(feature = "tokio-runtime")]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use spool::config::SpoolConfig;
use spool::core::{
    FinishOptions, InMemoryProgress, ProgressEvent, ProgressSink, SpoolError, TaskJob, TaskSpool,
};
use spool::runtime::LocalRuntime;
use tokio::task::LocalSet;
use tokio::time::sleep;

fn quiet(quota: usize, name: &str) -> SpoolConfig {
    SpoolConfig::new()
        .with_quota(quota)
        .with_name(name)
        .with_show_progress(false)
}

/// Single-threaded concurrency tracker.
#[derive(Default)]
struct Concurrency {
    current: Cell<usize>,
    peak: Cell<usize>,
}

impl Concurrency {
    async fn run(&self, duration: Duration) {
        self.current.set(self.current.get() + 1);
        self.peak.set(self.peak.get().max(self.current.get()));
        sleep(duration).await;
        self.current.set(self.current.get() - 1);
    }
}

#[tokio::test]
async fn test_every_future_runs_exactly_once() {
    LocalSet::new()
        .run_until(async {
            for n in [0_usize, 1, 20, 40] {
                let markers = Rc::new(RefCell::new(Vec::new()));
                let spool = TaskSpool::with_config(quiet(8, "markers")).unwrap();
                for i in 0..n {
                    let markers = Rc::clone(&markers);
                    spool
                        .enqueue(async move {
                            sleep(Duration::from_millis((i % 4) as u64)).await;
                            markers.borrow_mut().push(i);
                        })
                        .unwrap();
                }
                spool.finish(FinishOptions::new()).await.unwrap();

                let mut seen = markers.borrow().clone();
                seen.sort_unstable();
                assert_eq!(seen, (0..n).collect::<Vec<_>>(), "n = {n}");
                assert_eq!(spool.running_count(), 0);
                assert!(spool.is_closed());
            }
        })
        .await;
}

#[tokio::test]
async fn test_quota_is_never_exceeded() {
    LocalSet::new()
        .run_until(async {
            let tracker = Rc::new(Concurrency::default());
            let spool = TaskSpool::with_config(quiet(3, "bounded")).unwrap();
            for _ in 0..40 {
                let tracker = Rc::clone(&tracker);
                spool
                    .enqueue(async move { tracker.run(Duration::from_millis(5)).await })
                    .unwrap();
                assert!(spool.running_count() <= 3);
            }
            spool.finish(FinishOptions::new()).await.unwrap();
            assert_eq!(tracker.peak.get(), 3);
            assert_eq!(spool.stats().done, 40);
        })
        .await;
}

#[tokio::test]
async fn test_quota_bounds_wall_clock() {
    LocalSet::new()
        .run_until(async {
            let job = Duration::from_millis(100);
            let spool = TaskSpool::with_config(quiet(8, "waves")).unwrap();
            let start = Instant::now();
            for _ in 0..20 {
                spool.enqueue(sleep(job)).unwrap();
            }
            spool.finish(FinishOptions::new()).await.unwrap();
            let elapsed = start.elapsed();
            assert!(elapsed >= job * 3, "finished too early: {elapsed:?}");
            assert!(elapsed < job * 6, "finished too late: {elapsed:?}");
        })
        .await;
}

#[tokio::test]
async fn test_failures_are_isolated() {
    LocalSet::new()
        .run_until(async {
            let ok = Rc::new(Cell::new(0));
            let spool = TaskSpool::with_config(quiet(2, "faulty")).unwrap();
            spool
                .enqueue::<_, ()>(async {
                    sleep(Duration::from_millis(1)).await;
                    panic!("decode failed");
                })
                .unwrap();
            spool
                .enqueue(async { Err::<(), _>(std::io::Error::other("no such image")) })
                .unwrap();
            for _ in 0..3 {
                let ok = Rc::clone(&ok);
                spool.enqueue(async move { ok.set(ok.get() + 1) }).unwrap();
            }
            spool.finish(FinishOptions::new()).await.unwrap();

            assert_eq!(ok.get(), 3);
            let stats = spool.stats();
            assert_eq!(stats.done, 5);
            assert_eq!(stats.failed, 2);
        })
        .await;
}

#[tokio::test]
async fn test_cancel_belayed_spool_runs_nothing() {
    LocalSet::new()
        .run_until(async {
            let ran = Rc::new(Cell::new(0));
            let spool = TaskSpool::with_config(quiet(4, "belayed").with_autostart(false)).unwrap();
            for _ in 0..10 {
                let ran = Rc::clone(&ran);
                spool.enqueue(async move { ran.set(ran.get() + 1) }).unwrap();
            }
            spool.cancel().await.unwrap();
            assert_eq!(ran.get(), 0);
            assert!(spool.is_closed());
        })
        .await;
}

#[tokio::test]
async fn test_cancel_handle_interrupts_drain() {
    LocalSet::new()
        .run_until(async {
            let ran = Rc::new(Cell::new(0));
            let spool = TaskSpool::with_config(quiet(2, "interrupted")).unwrap();
            for _ in 0..40 {
                let ran = Rc::clone(&ran);
                spool
                    .enqueue(async move {
                        sleep(Duration::from_millis(10)).await;
                        ran.set(ran.get() + 1);
                    })
                    .unwrap();
            }
            let handle = spool.cancel_handle();
            tokio::task::spawn_local(async move {
                sleep(Duration::from_millis(25)).await;
                handle.cancel();
            });

            let result = spool.finish(FinishOptions::new()).await;
            assert!(matches!(result, Err(SpoolError::Cancelled)));
            assert!(spool.is_closed());
            assert_eq!(spool.running_count(), 0);
            assert!(ran.get() > 0 && ran.get() < 40, "ran {}", ran.get());
        })
        .await;
}

#[tokio::test]
async fn test_set_quota_uses_new_slack() {
    LocalSet::new()
        .run_until(async {
            let spool = TaskSpool::with_config(quiet(1, "throttled")).unwrap();
            for _ in 0..10 {
                spool.enqueue(sleep(Duration::from_millis(50))).unwrap();
            }
            assert_eq!(spool.running_count(), 1);
            spool.set_quota(10);
            assert_eq!(spool.running_count(), 10);

            let start = Instant::now();
            spool.finish(FinishOptions::new()).await.unwrap();
            assert!(start.elapsed() < Duration::from_millis(250));
        })
        .await;
}

#[tokio::test]
async fn test_flush_holds_admission_until_idle() {
    LocalSet::new()
        .run_until(async {
            let first_done = Rc::new(Cell::new(0));
            let overlaps = Rc::new(Cell::new(0));
            let spool = TaskSpool::with_config(quiet(4, "flushed")).unwrap();
            for _ in 0..2 {
                let first_done = Rc::clone(&first_done);
                spool
                    .enqueue(async move {
                        sleep(Duration::from_millis(20)).await;
                        first_done.set(first_done.get() + 1);
                    })
                    .unwrap();
            }
            spool.flush();
            for _ in 0..2 {
                let first_done = Rc::clone(&first_done);
                let overlaps = Rc::clone(&overlaps);
                spool
                    .enqueue(async move {
                        if first_done.get() < 2 {
                            overlaps.set(overlaps.get() + 1);
                        }
                    })
                    .unwrap();
            }
            assert_eq!(spool.running_count(), 2);
            assert_eq!(spool.queued_count(), 2);

            spool.finish(FinishOptions::new()).await.unwrap();
            assert_eq!(overlaps.get(), 0);
        })
        .await;
}

#[tokio::test]
async fn test_resume_and_reject_after_close() {
    LocalSet::new()
        .run_until(async {
            let count = Rc::new(Cell::new(0));
            let spool = TaskSpool::with_config(quiet(3, "resumed")).unwrap();
            for round in 1..=2 {
                for _ in 0..4 {
                    let count = Rc::clone(&count);
                    spool.enqueue(async move { count.set(count.get() + 1) }).unwrap();
                }
                spool
                    .finish(FinishOptions::new().with_resume(true))
                    .await
                    .unwrap();
                assert_eq!(count.get(), round * 4);
                assert!(!spool.is_closed());
            }

            spool.finish(FinishOptions::new()).await.unwrap();
            let err = spool.enqueue(async {}).unwrap_err();
            assert!(matches!(err, SpoolError::InvalidJob(_)));
            assert!(matches!(spool.start(), Err(SpoolError::InvalidJob(_))));
        })
        .await;
}

#[tokio::test]
async fn test_with_jobs_and_scope() {
    LocalSet::new()
        .run_until(async {
            let count = Rc::new(Cell::new(0));
            let jobs = (0..6).map(|i| {
                let count = Rc::clone(&count);
                TaskJob::new(format!("preload-{i}"), async move { count.set(count.get() + 1) })
            });
            let spool = TaskSpool::with_jobs(quiet(2, "preloaded"), jobs).unwrap();
            assert_eq!(spool.stats().total, 6);
            spool.finish(FinishOptions::new()).await.unwrap();
            assert_eq!(count.get(), 6);

            let scoped = Rc::clone(&count);
            let queued = TaskSpool::scope(quiet(2, "scoped"), async |spool: &TaskSpool| {
                for _ in 0..4 {
                    let scoped = Rc::clone(&scoped);
                    spool
                        .enqueue(async move {
                            sleep(Duration::from_millis(2)).await;
                            scoped.set(scoped.get() + 1);
                        })
                        .unwrap();
                }
                4
            })
            .await
            .unwrap();
            assert_eq!(count.get(), 6 + queued);
        })
        .await;
}

#[tokio::test]
async fn test_progress_reports_reach_sink() {
    LocalSet::new()
        .run_until(async {
            let sink = Arc::new(InMemoryProgress::default());
            let dyn_sink: Arc<dyn ProgressSink> = sink.clone();
            let spool = TaskSpool::with_sink(
                SpoolConfig::new().with_quota(2).with_name("reported"),
                dyn_sink,
            )
            .unwrap();
            for _ in 0..5 {
                spool.enqueue(sleep(Duration::from_millis(2))).unwrap();
            }
            spool.finish(FinishOptions::new()).await.unwrap();

            let events = sink.events();
            assert!(matches!(events.first(), Some(ProgressEvent::Begin(r)) if r.total == 5));
            assert!(matches!(events.last(), Some(ProgressEvent::End(r)) if r.done == 5));
            assert!(sink.peak_running() <= 2);
        })
        .await;
}

#[test]
fn test_local_runtime_from_sync_code() {
    let rt = LocalRuntime::new().unwrap();
    let count = Rc::new(Cell::new(0));
    rt.block_on(async {
        let spool = TaskSpool::with_config(quiet(4, "sync")).unwrap();
        for _ in 0..12 {
            let count = Rc::clone(&count);
            spool
                .enqueue(async move {
                    tokio::task::yield_now().await;
                    count.set(count.get() + 1);
                })
                .unwrap();
        }
        spool.finish(FinishOptions::new()).await.unwrap();
    });
    assert_eq!(count.get(), 12);
}
