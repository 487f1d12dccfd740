//! Progress reporting for draining spools.
//!
//! Spools never print on their own. A [`ProgressSink`] is injected at
//! construction (defaulting to [`TracingProgress`]) and receives a
//! [`ProgressReport`] when a drain begins, whenever the counts move, and when
//! the drain ends. Reports are observability only and never feed back into
//! scheduling decisions.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

/// Snapshot of a spool's progress at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressReport {
    /// Spool name.
    pub name: String,
    /// Jobs accounted for by the current drain (done + running + queued).
    pub total: u64,
    /// Jobs completed since the drain began, failures included.
    pub done: u64,
    /// Jobs completed with an error or panic since the drain began.
    pub failed: u64,
    /// Units currently running.
    pub running: usize,
    /// Jobs waiting for admission.
    pub queued: usize,
    /// Current concurrency quota.
    pub quota: usize,
}

impl ProgressReport {
    /// True when nothing is running or queued.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.running == 0 && self.queued == 0
    }

    fn same_counts(&self, other: &Self) -> bool {
        self.done == other.done
            && self.running == other.running
            && self.queued == other.queued
            && self.quota == other.quota
    }
}

/// Receiver of drain progress.
///
/// Implementations are called from whichever thread is draining the spool and
/// must not block for long. A panicking sink is contained and logged.
pub trait ProgressSink: Send + Sync {
    /// A drain with outstanding work has started.
    fn begin(&self, report: &ProgressReport);
    /// Counts changed during the drain.
    fn update(&self, report: &ProgressReport);
    /// The drain ended, successfully or not.
    fn end(&self, report: &ProgressReport);
    /// Route a free-form line through the sink.
    fn message(&self, spool: &str, line: &str) {
        tracing::info!(spool = %spool, "{line}");
    }
}

/// Default sink: progress as structured `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn begin(&self, report: &ProgressReport) {
        tracing::info!(
            spool = %report.name,
            total = report.total,
            queued = report.queued,
            running = report.running,
            quota = report.quota,
            "draining spool"
        );
    }

    fn update(&self, report: &ProgressReport) {
        tracing::info!(
            spool = %report.name,
            done = report.done,
            total = report.total,
            queued = report.queued,
            running = report.running,
            quota = report.quota,
            "spool progress"
        );
    }

    fn end(&self, report: &ProgressReport) {
        tracing::info!(
            spool = %report.name,
            done = report.done,
            total = report.total,
            failed = report.failed,
            "spool drained"
        );
    }
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn begin(&self, _report: &ProgressReport) {}
    fn update(&self, _report: &ProgressReport) {}
    fn end(&self, _report: &ProgressReport) {}
    fn message(&self, _spool: &str, _line: &str) {}
}

/// Event captured by [`InMemoryProgress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// `begin` was called.
    Begin(ProgressReport),
    /// `update` was called.
    Update(ProgressReport),
    /// `end` was called.
    End(ProgressReport),
    /// `message` was called.
    Message(String),
}

/// In-memory sink for testing and dev, bounded like a ring buffer.
#[derive(Debug)]
pub struct InMemoryProgress {
    events: Mutex<Vec<ProgressEvent>>,
    max_events: usize,
}

impl InMemoryProgress {
    /// Create a sink keeping at most `max_events` events (oldest dropped first).
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(Vec::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    /// Snapshot of recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    /// The highest running count seen in any report.
    #[must_use]
    pub fn peak_running(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::Begin(r) | ProgressEvent::Update(r) | ProgressEvent::End(r) => {
                    Some(r.running)
                }
                ProgressEvent::Message(_) => None,
            })
            .max()
            .unwrap_or(0)
    }

    fn record(&self, event: ProgressEvent) {
        let mut events = self.events.lock();
        if self.max_events > 0 && events.len() >= self.max_events {
            events.remove(0);
        }
        events.push(event);
    }
}

impl Default for InMemoryProgress {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl ProgressSink for InMemoryProgress {
    fn begin(&self, report: &ProgressReport) {
        self.record(ProgressEvent::Begin(report.clone()));
    }

    fn update(&self, report: &ProgressReport) {
        self.record(ProgressEvent::Update(report.clone()));
    }

    fn end(&self, report: &ProgressReport) {
        self.record(ProgressEvent::End(report.clone()));
    }

    fn message(&self, _spool: &str, line: &str) {
        self.record(ProgressEvent::Message(line.to_string()));
    }
}

fn contained(name: &str, call: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(call)).is_err() {
        tracing::warn!(spool = %name, "progress sink panicked; report dropped");
    }
}

/// Open progress report for one drain.
///
/// `end` is delivered exactly once, from `Drop`, so the sink is closed on
/// every exit path including unwinding.
pub(crate) struct ProgressGuard {
    sink: Arc<dyn ProgressSink>,
    last: ProgressReport,
}

impl ProgressGuard {
    /// Open a report, or `None` when there is nothing to report on.
    pub(crate) fn open(sink: &Arc<dyn ProgressSink>, report: ProgressReport) -> Option<Self> {
        if report.total == 0 {
            return None;
        }
        contained(&report.name, || sink.begin(&report));
        Some(Self {
            sink: Arc::clone(sink),
            last: report,
        })
    }

    /// True if `report` differs from the last one forwarded.
    pub(crate) fn is_stale(&self, report: &ProgressReport) -> bool {
        !report.same_counts(&self.last)
    }

    /// Forward `report` if the counts moved since the last one.
    pub(crate) fn update(&mut self, report: ProgressReport) {
        if report.same_counts(&self.last) {
            return;
        }
        contained(&report.name, || self.sink.update(&report));
        self.last = report;
    }
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        let sink = &self.sink;
        let last = &self.last;
        contained(&last.name, || sink.end(last));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(done: u64, running: usize, queued: usize) -> ProgressReport {
        ProgressReport {
            name: "test".into(),
            total: 10,
            done,
            failed: 0,
            running,
            queued,
            quota: 4,
        }
    }

    #[test]
    fn test_guard_skips_empty_drain() {
        let sink = Arc::new(InMemoryProgress::default());
        let dyn_sink: Arc<dyn ProgressSink> = sink.clone();
        let guard = ProgressGuard::open(&dyn_sink, ProgressReport::default());
        assert!(guard.is_none());
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_guard_dedups_and_ends_once() {
        let sink = Arc::new(InMemoryProgress::default());
        let dyn_sink: Arc<dyn ProgressSink> = sink.clone();
        {
            let mut guard = ProgressGuard::open(&dyn_sink, report(0, 4, 6)).unwrap();
            guard.update(report(0, 4, 6));
            guard.update(report(1, 4, 5));
        }
        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ProgressEvent::Begin(_)));
        assert!(matches!(events[1], ProgressEvent::Update(ref r) if r.done == 1));
        assert!(matches!(events[2], ProgressEvent::End(ref r) if r.done == 1));
        assert_eq!(sink.peak_running(), 4);
    }

    struct PanickingSink;

    impl ProgressSink for PanickingSink {
        fn begin(&self, _report: &ProgressReport) {
            panic!("begin");
        }
        fn update(&self, _report: &ProgressReport) {
            panic!("update");
        }
        fn end(&self, _report: &ProgressReport) {
            panic!("end");
        }
    }

    #[test]
    fn test_panicking_sink_is_contained() {
        let sink: Arc<dyn ProgressSink> = Arc::new(PanickingSink);
        let mut guard = ProgressGuard::open(&sink, report(0, 1, 1)).unwrap();
        guard.update(report(1, 0, 1));
        drop(guard);
    }

    #[test]
    fn test_in_memory_sink_is_bounded() {
        let sink = InMemoryProgress::new(2);
        sink.message("s", "one");
        sink.message("s", "two");
        sink.message("s", "three");
        assert_eq!(
            sink.events(),
            vec![
                ProgressEvent::Message("two".into()),
                ProgressEvent::Message("three".into())
            ]
        );
    }
}
