//! Bounded work-queue scheduler ("spool").
//!
//! A spool accepts jobs at any time, runs at most `quota` of them at once and
//! offers a drain (`finish`) that returns only when nothing is queued or
//! running. Two strategies share that contract:
//!
//! - [`ThreadSpool`]: every admitted job gets its own OS thread. A dedicated
//!   control thread admits work in the background; a draining caller takes
//!   over admission until the spool is empty.
//! - [`TaskSpool`]: every admitted job is a task on a single-threaded tokio
//!   `LocalSet`. There is no control process: each job's completion callback
//!   runs the next admission pass.
//!
//! # Admission
//!
//! Admission is level-triggered. Whenever something that could free a slot
//! happens (enqueue, job completion, quota change, flush end) the predicate
//! `running < quota && !pending.is_empty() && !flushing` is re-evaluated under
//! the state lock before anyone waits again, and exactly
//! `min(pending, quota - running)` jobs are admitted per pass.
//!
//! # Example
//!
//! ```rust,ignore
//! use spool::core::{FinishOptions, ThreadSpool};
//!
//! let spool = ThreadSpool::new(8, "resize")?;
//! for path in paths {
//!     spool.enqueue(move || resize(&path))?;
//! }
//! spool.finish(FinishOptions::default())?;
//! ```

mod thread;
#[cfg(feature = "tokio-runtime")]
mod task;

use std::collections::VecDeque;

use crate::core::job::JobId;
use crate::core::progress::ProgressReport;

pub use thread::{CancelHandle, ThreadSpool};
#[cfg(feature = "tokio-runtime")]
pub use task::{TaskCancelHandle, TaskSpool};

/// Options for a drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinishOptions {
    /// Restart background admission after the drain instead of closing the spool.
    pub resume: bool,
    /// Log the spool state before and after the drain.
    pub verbose: bool,
    /// Override the spool's configured progress setting for this drain.
    pub show_progress: Option<bool>,
}

impl FinishOptions {
    /// Default options: close the spool, quiet, configured progress.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            resume: false,
            verbose: false,
            show_progress: None,
        }
    }

    /// Set whether admission resumes after the drain.
    #[must_use]
    pub const fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Set verbose state logging.
    #[must_use]
    pub const fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Force progress reporting on or off for this drain.
    #[must_use]
    pub const fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = Some(show_progress);
        self
    }
}

/// A job waiting in the backlog together with its sequential id.
pub(crate) struct Pending<J> {
    pub(crate) id: JobId,
    pub(crate) job: J,
}

/// Lifecycle of a spool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Created with autostart off; jobs wait until `start`.
    Belayed,
    /// Admitting in the background.
    Spooling,
    /// A caller is draining; admission continues but will stop once empty.
    Draining,
    /// Terminal: finished without resume, cancelled, or dropped.
    Closed,
}

/// Backlog, quota and counters shared by both strategies.
///
/// Always accessed under the owning spool's lock (or on its only thread).
pub(crate) struct Backlog<J> {
    queue: VecDeque<Pending<J>>,
    next_id: JobId,
    quota: usize,
    flushing: bool,
    submitted: u64,
    completed: u64,
    failed: u64,
}

impl<J> Backlog<J> {
    pub(crate) const fn new(quota: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            next_id: 0,
            quota,
            flushing: false,
            submitted: 0,
            completed: 0,
            failed: 0,
        }
    }

    /// Append a job and return its id.
    pub(crate) fn push(&mut self, job: J) -> JobId {
        let id = self.next_id;
        self.next_id += 1;
        self.submitted += 1;
        self.queue.push_back(Pending { id, job });
        id
    }

    /// Drop every queued job, returning how many were discarded.
    pub(crate) fn clear(&mut self) -> usize {
        let discarded = self.queue.len();
        self.queue.clear();
        discarded
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) const fn quota(&self) -> usize {
        self.quota
    }

    pub(crate) fn set_quota(&mut self, quota: usize) {
        self.quota = quota;
    }

    pub(crate) fn flush(&mut self) {
        self.flushing = true;
    }

    /// How many jobs may be admitted right now given `running` live units.
    ///
    /// Ends a flush once the running set is empty.
    pub(crate) fn admittable(&mut self, running: usize) -> usize {
        if self.flushing {
            if running > 0 {
                return 0;
            }
            self.flushing = false;
            tracing::debug!("flush complete, admission resumed");
        }
        self.queue.len().min(self.quota.saturating_sub(running))
    }

    pub(crate) fn pop(&mut self) -> Option<Pending<J>> {
        self.queue.pop_front()
    }

    pub(crate) fn record_completion(&mut self, ok: bool) {
        self.completed += 1;
        if !ok {
            self.failed += 1;
        }
    }

    pub(crate) const fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Progress relative to `baseline`, the counters when the drain began.
    pub(crate) fn report(&self, name: &str, running: usize, baseline: Baseline) -> ProgressReport {
        let done = self.completed.saturating_sub(baseline.completed);
        let queued = self.queue.len();
        ProgressReport {
            name: name.to_string(),
            total: done + (running + queued) as u64,
            done,
            failed: self.failed.saturating_sub(baseline.failed),
            running,
            queued,
            quota: self.quota,
        }
    }

    pub(crate) const fn baseline(&self) -> Baseline {
        Baseline {
            completed: self.completed,
            failed: self.failed,
        }
    }
}

/// Completion counters captured when a drain starts.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Baseline {
    completed: u64,
    failed: u64,
}
