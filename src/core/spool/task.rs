//! Task-backed spool: admitted jobs are tasks on a single-threaded `LocalSet`.
//!
//! There is no control process. Admission runs synchronously on the one
//! thread of control: on enqueue, on quota changes, and from each job's
//! completion callback. Because only one completion callback can execute at a
//! time, admission is never reentrant.
//!
//! A finishing job is still tracked while its callback runs, so the callback
//! admits while `active - 1 < quota`, then marks its own unit done.
//!
//! All spawning goes through `tokio::task::spawn_local`; a `TaskSpool` with
//! admitted work must be driven from inside a `tokio::task::LocalSet` (see
//! [`LocalRuntime`](crate::runtime::LocalRuntime)).

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SpoolConfig;
use crate::core::error::SpoolError;
use crate::core::job::{JobId, JobOutcome, TaskJob};
use crate::core::progress::{ProgressGuard, ProgressReport, ProgressSink, TracingProgress};

use super::{Backlog, Baseline, FinishOptions, Pending, Phase};

struct TaskUnit {
    id: JobId,
    done: bool,
    handle: JoinHandle<()>,
}

impl TaskUnit {
    fn is_live(&self) -> bool {
        !self.done && !self.handle.is_finished()
    }
}

struct TaskState {
    backlog: Backlog<TaskJob>,
    running: Vec<TaskUnit>,
    phase: Phase,
    cancel_requested: bool,
}

impl TaskState {
    fn live_count(&self) -> usize {
        self.running.iter().filter(|unit| unit.is_live()).count()
    }

    fn is_idle(&self) -> bool {
        self.backlog.is_empty() && self.live_count() == 0
    }
}

struct TaskShared {
    id: Uuid,
    name: String,
    state: RefCell<TaskState>,
    changed: Notify,
    sink: Arc<dyn ProgressSink>,
    show_progress: bool,
}

impl TaskShared {
    /// One admission pass. `finishing` is 1 when called from a completion callback.
    fn admit(self: &Rc<Self>, finishing: usize) {
        let mut st = self.state.borrow_mut();
        if !matches!(st.phase, Phase::Spooling | Phase::Draining) {
            return;
        }
        st.running.retain(TaskUnit::is_live);
        let active = st.live_count().saturating_sub(finishing);
        let slots = st.backlog.admittable(active);
        if slots > 0 {
            debug!(spool = %self.name, slots, active, queued = st.backlog.len(), "admitting tasks");
        }
        for _ in 0..slots {
            let Some(Pending { id, job }) = st.backlog.pop() else {
                debug!(spool = %self.name, "backlog emptied during admission pass");
                break;
            };
            let handle = tokio::task::spawn_local(Self::run_job(Rc::clone(self), id, job));
            st.running.push(TaskUnit {
                id,
                done: false,
                handle,
            });
        }
    }

    async fn run_job(shared: Rc<Self>, id: JobId, job: TaskJob) {
        let label = job.label().to_string();
        debug!(spool = %shared.name, job_id = id, label = %label, "task started");
        let outcome = job.run().await;
        if let Err(failure) = &outcome {
            error!(spool = %shared.name, job_id = id, label = %label, error = %failure, "aborting spooled task");
        }
        shared.state.borrow_mut().backlog.record_completion(outcome.is_ok());
        shared.admit(1);
        {
            let mut st = shared.state.borrow_mut();
            if let Some(unit) = st.running.iter_mut().find(|unit| unit.id == id) {
                unit.done = true;
            }
        }
        shared.changed.notify_waiters();
    }

    fn report(&self, baseline: Baseline) -> ProgressReport {
        let st = self.state.borrow();
        st.backlog.report(&self.name, st.live_count(), baseline)
    }
}

/// Clears the backlog and closes the spool if a drain is abandoned mid-way
/// (its future dropped, e.g. by `select!` on a shutdown signal).
struct AbandonGuard<'a> {
    shared: &'a TaskShared,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let discarded = {
            let mut st = self.shared.state.borrow_mut();
            st.phase = Phase::Closed;
            st.backlog.clear()
        };
        warn!(spool = %self.shared.name, discarded, "drain abandoned; spool closed");
    }
}

/// Spool running each admitted job as a task on the current `LocalSet`.
///
/// Dropping an open spool discards queued jobs; running tasks keep going on
/// the `LocalSet`. Use [`TaskSpool::finish`] or [`TaskSpool::scope`] to wait.
pub struct TaskSpool {
    shared: Rc<TaskShared>,
}

impl TaskSpool {
    /// Create a spool with the given quota and name.
    ///
    /// # Errors
    ///
    /// `SpoolError::InvalidConfig` if `quota` is zero or `name` is empty.
    pub fn new(quota: usize, name: impl Into<String>) -> Result<Self, SpoolError> {
        Self::with_config(SpoolConfig::new().with_quota(quota).with_name(name))
    }

    /// Create a spool from configuration, reporting progress through `tracing`.
    ///
    /// # Errors
    ///
    /// `SpoolError::InvalidConfig` if the configuration is invalid.
    pub fn with_config(config: SpoolConfig) -> Result<Self, SpoolError> {
        Self::with_sink(config, Arc::new(TracingProgress))
    }

    /// Create a spool from configuration with an injected progress sink.
    ///
    /// # Errors
    ///
    /// `SpoolError::InvalidConfig` if the configuration is invalid.
    pub fn with_sink(config: SpoolConfig, sink: Arc<dyn ProgressSink>) -> Result<Self, SpoolError> {
        config.validate().map_err(SpoolError::InvalidConfig)?;
        let shared = Rc::new(TaskShared {
            id: Uuid::new_v4(),
            name: config.name,
            state: RefCell::new(TaskState {
                backlog: Backlog::new(config.quota),
                running: Vec::new(),
                phase: Phase::Belayed,
                cancel_requested: false,
            }),
            changed: Notify::new(),
            sink,
            show_progress: config.show_progress,
        });
        info!(
            spool = %shared.name,
            id = %shared.id,
            quota = config.quota,
            autostart = config.autostart,
            "TaskSpool created"
        );
        let spool = Self { shared };
        if config.autostart {
            spool.start()?;
        }
        Ok(spool)
    }

    /// Create a spool pre-loaded with `jobs`.
    ///
    /// # Errors
    ///
    /// `SpoolError::InvalidConfig` if the configuration is invalid.
    pub fn with_jobs(
        config: SpoolConfig,
        jobs: impl IntoIterator<Item = TaskJob>,
    ) -> Result<Self, SpoolError> {
        let spool = Self::with_config(config)?;
        for job in jobs {
            spool.submit(job)?;
        }
        Ok(spool)
    }

    /// Run `body` with a fresh spool, then drain and close it.
    ///
    /// # Errors
    ///
    /// Construction errors, or `SpoolError::Cancelled` if a
    /// [`TaskCancelHandle`] fired during the final drain.
    pub async fn scope<T>(
        config: SpoolConfig,
        body: impl AsyncFnOnce(&Self) -> T,
    ) -> Result<T, SpoolError> {
        let spool = Self::with_config(config)?;
        let out = body(&spool).await;
        spool.finish(FinishOptions::new()).await?;
        Ok(out)
    }

    /// Enable admission and admit whatever fits.
    ///
    /// # Errors
    ///
    /// `SpoolError::InvalidJob` on a closed spool.
    pub fn start(&self) -> Result<(), SpoolError> {
        {
            let mut st = self.shared.state.borrow_mut();
            let phase = st.phase;
            match phase {
                Phase::Closed => {
                    return Err(SpoolError::InvalidJob(format!(
                        "spool `{}` is closed and cannot be restarted",
                        self.shared.name
                    )));
                }
                Phase::Belayed => st.phase = Phase::Spooling,
                Phase::Spooling | Phase::Draining => {}
            }
        }
        self.shared.admit(0);
        Ok(())
    }

    /// Queue a future labelled with the spool name.
    ///
    /// # Errors
    ///
    /// `SpoolError::InvalidJob` if the spool is closed.
    pub fn enqueue<F, O>(&self, work: F) -> Result<JobId, SpoolError>
    where
        F: Future<Output = O> + 'static,
        O: JobOutcome,
    {
        self.submit(TaskJob::new(self.shared.name.clone(), work))
    }

    /// Queue a future with an explicit label for log correlation.
    ///
    /// # Errors
    ///
    /// `SpoolError::InvalidJob` if the spool is closed.
    pub fn enqueue_labeled<F, O>(&self, label: impl Into<String>, work: F) -> Result<JobId, SpoolError>
    where
        F: Future<Output = O> + 'static,
        O: JobOutcome,
    {
        self.submit(TaskJob::new(label, work))
    }

    /// Queue a prepared job and run an admission pass.
    ///
    /// # Errors
    ///
    /// `SpoolError::InvalidJob` if the spool is closed.
    pub fn submit(&self, job: TaskJob) -> Result<JobId, SpoolError> {
        let id = {
            let mut st = self.shared.state.borrow_mut();
            if st.phase == Phase::Closed {
                warn!(spool = %self.shared.name, label = %job.label(), "job submitted to closed spool");
                return Err(SpoolError::InvalidJob(format!(
                    "spool `{}` is closed; rejected job `{}`",
                    self.shared.name,
                    job.label()
                )));
            }
            st.backlog.push(job)
        };
        debug!(spool = %self.shared.name, job_id = id, "task queued");
        self.shared.admit(0);
        Ok(id)
    }

    /// Change the quota and use any new slack immediately.
    pub fn set_quota(&self, quota: usize) {
        self.shared.state.borrow_mut().backlog.set_quota(quota);
        debug!(spool = %self.shared.name, quota, "quota changed");
        self.shared.admit(0);
    }

    /// Finish every active task before admitting any queued one.
    pub fn flush(&self) {
        self.shared.state.borrow_mut().backlog.flush();
    }

    /// Discard queued jobs, then drain and close like `finish`.
    ///
    /// # Errors
    ///
    /// `SpoolError::Cancelled` if a [`TaskCancelHandle`] fired during the drain.
    pub async fn cancel(&self) -> Result<(), SpoolError> {
        let discarded = self.shared.state.borrow_mut().backlog.clear();
        info!(spool = %self.shared.name, discarded, "spool cancelled");
        self.finish(FinishOptions::new()).await
    }

    /// Suspend until nothing is queued or active.
    ///
    /// # Errors
    ///
    /// `SpoolError::Cancelled` if a [`TaskCancelHandle`] fired during the
    /// drain; the backlog is discarded and active tasks are awaited first.
    ///
    /// # Panics
    ///
    /// If the drain ends with queued or active tasks left, which would be a
    /// bug in the spool itself.
    pub async fn finish(&self, options: FinishOptions) -> Result<(), SpoolError> {
        let shared = &self.shared;
        let show_progress = options.show_progress.unwrap_or(shared.show_progress);
        if options.verbose {
            info!("{self}");
        }

        {
            let mut st = shared.state.borrow_mut();
            if st.phase == Phase::Closed {
                debug!(spool = %shared.name, "finish on closed spool");
                return Ok(());
            }
            st.phase = Phase::Draining;
        }
        shared.admit(0);

        let baseline = shared.state.borrow().backlog.baseline();
        let mut progress = if show_progress {
            ProgressGuard::open(&shared.sink, shared.report(baseline))
        } else {
            None
        };
        let mut abandon = AbandonGuard {
            shared,
            armed: true,
        };

        let outcome = loop {
            // Registered before the predicate is checked so no completion is missed.
            let changed = shared.changed.notified();

            let cancelled = {
                let mut st = shared.state.borrow_mut();
                if st.cancel_requested {
                    let discarded = st.backlog.clear();
                    if discarded > 0 {
                        warn!(spool = %shared.name, discarded, "cancellation requested while draining");
                    }
                }
                st.cancel_requested
            };
            shared.admit(0);

            if let Some(guard) = progress.as_mut() {
                guard.update(shared.report(baseline));
            }

            if shared.state.borrow().is_idle() {
                break if cancelled {
                    Err(SpoolError::Cancelled)
                } else {
                    Ok(())
                };
            }
            changed.await;
        };
        abandon.armed = false;
        drop(progress);

        let mut st = shared.state.borrow_mut();
        if let Err(e) = outcome {
            st.phase = Phase::Closed;
            warn!(spool = %shared.name, "drain cancelled");
            return Err(e);
        }

        if options.resume {
            st.cancel_requested = false;
            st.phase = Phase::Spooling;
        } else {
            assert!(
                st.backlog.is_empty(),
                "spool `{}` finished without deploying all tasks",
                shared.name
            );
            assert!(
                st.live_count() == 0,
                "spool `{}` finished without finishing all tasks",
                shared.name
            );
            st.running.clear();
            st.phase = Phase::Closed;
            info!(spool = %shared.name, "spool closed");
        }
        drop(st);

        if options.verbose {
            info!("{self}");
        }
        Ok(())
    }

    /// Handle that can cancel this spool from another task on the same thread.
    #[must_use]
    pub fn cancel_handle(&self) -> TaskCancelHandle {
        TaskCancelHandle {
            shared: Rc::clone(&self.shared),
        }
    }

    /// Route a line through the progress sink.
    pub fn print(&self, line: &str) {
        self.shared.sink.message(&self.shared.name, line);
    }

    /// Tasks currently active.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.shared.state.borrow().live_count()
    }

    /// Jobs waiting for admission.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.shared.state.borrow().backlog.len()
    }

    /// Current quota.
    #[must_use]
    pub fn quota(&self) -> usize {
        self.shared.state.borrow().backlog.quota()
    }

    /// True once the spool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.borrow().phase == Phase::Closed
    }

    /// Lifetime totals: submitted jobs as `total`, completions as `done`.
    #[must_use]
    pub fn stats(&self) -> ProgressReport {
        let mut report = self.shared.report(Baseline::default());
        report.total = self.shared.state.borrow().backlog.submitted();
        report
    }

    /// Spool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Unique id of this spool instance.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }
}

impl fmt::Display for TaskSpool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.borrow();
        write!(
            f,
            "TaskSpool '{}' ({}): {}/{} active with {} queued.",
            self.shared.name,
            self.shared.id,
            st.live_count(),
            st.backlog.quota(),
            st.backlog.len()
        )
    }
}

impl fmt::Debug for TaskSpool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpool")
            .field("name", &self.shared.name)
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl Drop for TaskSpool {
    fn drop(&mut self) {
        let Ok(mut st) = self.shared.state.try_borrow_mut() else {
            return;
        };
        if st.phase == Phase::Closed {
            return;
        }
        st.phase = Phase::Closed;
        let discarded = st.backlog.clear();
        let active = st.live_count();
        drop(st);
        if discarded > 0 || active > 0 {
            warn!(
                spool = %self.shared.name,
                discarded,
                active,
                "TaskSpool dropped without finish"
            );
        }
    }
}

/// Cancellation signal for a [`TaskSpool`], for use by another task on the
/// same `LocalSet` (for example one awaiting `tokio::signal::ctrl_c`).
#[derive(Clone)]
pub struct TaskCancelHandle {
    shared: Rc<TaskShared>,
}

impl TaskCancelHandle {
    /// Discard the backlog and make the current or next drain return
    /// `SpoolError::Cancelled` once active tasks have completed.
    pub fn cancel(&self) {
        let discarded = {
            let mut st = self.shared.state.borrow_mut();
            st.cancel_requested = true;
            st.backlog.clear()
        };
        self.shared.changed.notify_waiters();
        warn!(spool = %self.shared.name, discarded, "cancellation signalled");
    }
}

impl fmt::Debug for TaskCancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCancelHandle")
            .field("spool", &self.shared.name)
            .finish()
    }
}
