//! Thread-backed spool: one OS thread per admitted job.
//!
//! # Design
//!
//! - One `parking_lot::Mutex` guards the backlog, the running set and the
//!   lifecycle phase; one `Condvar` is the wake condition.
//! - Job wrappers mark their unit finished and record the outcome under the
//!   lock, then notify. The admission predicate is always re-checked under
//!   the same lock before anyone waits, so no wakeup is lost.
//! - A control thread admits in the background while the spool is spooling.
//!   `finish` stops it and the draining caller admits the rest itself.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SpoolConfig;
use crate::core::error::SpoolError;
use crate::core::job::{Job, JobFailure, JobId, JobOutcome};
use crate::core::progress::{ProgressGuard, ProgressSink, TracingProgress};

use super::{Backlog, FinishOptions, Pending, Phase};

/// A job that has been handed its own thread.
struct RunningUnit {
    id: JobId,
    label: String,
    finished: bool,
    handle: JoinHandle<()>,
}

/// Units admitted and not yet pruned.
///
/// Counting and pruning are separate operations; counting never mutates.
#[derive(Default)]
struct RunningSet {
    units: Vec<RunningUnit>,
}

impl RunningSet {
    fn insert(&mut self, unit: RunningUnit) {
        self.units.push(unit);
    }

    fn mark_finished(&mut self, id: JobId) {
        match self.units.iter_mut().find(|unit| unit.id == id) {
            Some(unit) => unit.finished = true,
            None => debug!(job_id = id, "finished job not in running set"),
        }
    }

    fn live_count(&self) -> usize {
        self.units.iter().filter(|unit| !unit.finished).count()
    }

    /// Remove finished units; the caller joins them outside the lock.
    fn prune_finished(&mut self) -> Vec<RunningUnit> {
        let (finished, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.units)
            .into_iter()
            .partition(|unit| unit.finished);
        self.units = live;
        finished
    }

    fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

struct ThreadState {
    backlog: Backlog<Job>,
    running: RunningSet,
    phase: Phase,
    control: Option<JoinHandle<()>>,
    cancel_requested: bool,
}

struct Shared {
    id: Uuid,
    name: String,
    state: Mutex<ThreadState>,
    wake: Condvar,
    sink: Arc<dyn ProgressSink>,
    show_progress: bool,
    progress_interval: Duration,
}

impl Shared {
    fn closed_error(&self, label: &str) -> SpoolError {
        SpoolError::InvalidJob(format!(
            "spool `{}` is closed; rejected job `{label}`",
            self.name
        ))
    }

    /// One admission pass. Returns pruned units for the caller to join unlocked.
    fn admit(self: &Arc<Self>, st: &mut ThreadState) -> Vec<RunningUnit> {
        let finished = st.running.prune_finished();
        let slots = st.backlog.admittable(st.running.live_count());
        if slots > 0 {
            debug!(
                spool = %self.name,
                slots,
                queued = st.backlog.len(),
                running = st.running.live_count(),
                "admitting jobs"
            );
        }
        for _ in 0..slots {
            let Some(Pending { id, job }) = st.backlog.pop() else {
                debug!(spool = %self.name, "backlog emptied during admission pass");
                break;
            };
            let label = job.label().to_string();
            match self.spawn_unit(id, job) {
                Ok(handle) => st.running.insert(RunningUnit {
                    id,
                    label,
                    finished: false,
                    handle,
                }),
                Err(e) => {
                    error!(spool = %self.name, job_id = id, label = %label, error = %e, "failed to start job thread");
                    st.backlog.record_completion(false);
                }
            }
        }
        finished
    }

    fn spawn_unit(self: &Arc<Self>, id: JobId, job: Job) -> std::io::Result<JoinHandle<()>> {
        let shared = Arc::clone(self);
        thread::Builder::new()
            .name(format!("{}-{id}", self.name))
            .spawn(move || {
                let label = job.label().to_string();
                debug!(spool = %shared.name, job_id = id, label = %label, "job started");
                let outcome = job.run();
                if let Err(failure) = &outcome {
                    report_failure(&shared.name, id, &label, failure);
                }
                shared.complete(id, outcome.is_ok());
            })
    }

    fn complete(&self, id: JobId, ok: bool) {
        {
            let mut st = self.state.lock();
            st.running.mark_finished(id);
            st.backlog.record_completion(ok);
        }
        self.wake.notify_all();
    }

    fn spawn_control(self: &Arc<Self>) -> Result<JoinHandle<()>, SpoolError> {
        let shared = Arc::clone(self);
        thread::Builder::new()
            .name(format!("{}-spooler", self.name))
            .spawn(move || control_loop(&shared))
            .map_err(|e| SpoolError::Spawn(e.to_string()))
    }
}

fn report_failure(spool: &str, id: JobId, label: &str, failure: &JobFailure) {
    error!(spool = %spool, job_id = id, label = %label, error = %failure, "aborting spooled job");
}

fn join_units(spool: &str, units: Vec<RunningUnit>) {
    for unit in units {
        if unit.handle.join().is_err() {
            error!(spool = %spool, job_id = unit.id, label = %unit.label, "job thread panicked outside its wrapper");
        }
    }
}

/// Background admission; exits as soon as the spool stops spooling.
fn control_loop(shared: &Arc<Shared>) {
    debug!(spool = %shared.name, "spooler started");
    let mut st = shared.state.lock();
    while st.phase == Phase::Spooling {
        let finished = shared.admit(&mut st);
        if !finished.is_empty() {
            MutexGuard::unlocked(&mut st, || join_units(&shared.name, finished));
            continue;
        }
        shared.wake.wait(&mut st);
    }
    debug!(spool = %shared.name, "spooler stopped");
}

/// Spool running each admitted job on its own OS thread.
///
/// All methods take `&self`; share the spool between producers with `Arc` or
/// scoped threads. Dropping an open spool drains it like `finish`.
///
/// Jobs must not call `finish` or `cancel` on the spool running them: the
/// drain would wait for the calling job itself.
pub struct ThreadSpool {
    shared: Arc<Shared>,
}

impl ThreadSpool {
    /// Create and start a spool with the given quota and name.
    ///
    /// # Errors
    ///
    /// `SpoolError::InvalidConfig` if `quota` is zero or `name` is empty,
    /// `SpoolError::Spawn` if the control thread cannot be started.
    pub fn new(quota: usize, name: impl Into<String>) -> Result<Self, SpoolError> {
        Self::with_config(SpoolConfig::new().with_quota(quota).with_name(name))
    }

    /// Create a spool from configuration, reporting progress through `tracing`.
    ///
    /// # Errors
    ///
    /// See [`ThreadSpool::with_sink`].
    pub fn with_config(config: SpoolConfig) -> Result<Self, SpoolError> {
        Self::with_sink(config, Arc::new(TracingProgress))
    }

    /// Create a spool from configuration with an injected progress sink.
    ///
    /// # Errors
    ///
    /// `SpoolError::InvalidConfig` if the configuration is invalid,
    /// `SpoolError::Spawn` if autostart cannot start the control thread.
    pub fn with_sink(config: SpoolConfig, sink: Arc<dyn ProgressSink>) -> Result<Self, SpoolError> {
        config.validate().map_err(SpoolError::InvalidConfig)?;
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            name: config.name,
            state: Mutex::new(ThreadState {
                backlog: Backlog::new(config.quota),
                running: RunningSet::default(),
                phase: Phase::Belayed,
                control: None,
                cancel_requested: false,
            }),
            wake: Condvar::new(),
            sink,
            show_progress: config.show_progress,
            progress_interval: Duration::from_millis(config.progress_interval_ms),
        });
        info!(
            spool = %shared.name,
            id = %shared.id,
            quota = config.quota,
            autostart = config.autostart,
            "ThreadSpool created"
        );
        let spool = Self { shared };
        if config.autostart {
            spool.start()?;
        }
        Ok(spool)
    }

    /// Run `body` with a fresh spool, then drain and close it.
    ///
    /// If `body` panics the spool is still drained while unwinding.
    ///
    /// # Errors
    ///
    /// Construction errors, or `SpoolError::Cancelled` if a [`CancelHandle`]
    /// fired during the final drain.
    pub fn scope<T>(config: SpoolConfig, body: impl FnOnce(&Self) -> T) -> Result<T, SpoolError> {
        let spool = Self::with_config(config)?;
        let out = body(&spool);
        spool.finish(FinishOptions::new())?;
        Ok(out)
    }

    /// Begin admitting in the background, if not already doing so.
    ///
    /// # Errors
    ///
    /// `SpoolError::InvalidJob` on a closed spool, `SpoolError::Spawn` if the
    /// control thread cannot be started.
    pub fn start(&self) -> Result<(), SpoolError> {
        let mut st = self.shared.state.lock();
        let phase = st.phase;
        match phase {
            Phase::Closed => Err(SpoolError::InvalidJob(format!(
                "spool `{}` is closed and cannot be restarted",
                self.shared.name
            ))),
            // The draining caller owns admission; `finish(resume)` restarts the spooler.
            Phase::Draining => Ok(()),
            Phase::Spooling if st.control.as_ref().is_some_and(|h| !h.is_finished()) => Ok(()),
            Phase::Belayed | Phase::Spooling => {
                st.phase = Phase::Spooling;
                st.control = Some(self.shared.spawn_control()?);
                drop(st);
                self.shared.wake.notify_all();
                debug!(spool = %self.shared.name, "spooling in background");
                Ok(())
            }
        }
    }

    /// Queue a closure labelled with the spool name.
    ///
    /// # Errors
    ///
    /// `SpoolError::InvalidJob` if the spool is closed.
    pub fn enqueue<F, O>(&self, work: F) -> Result<JobId, SpoolError>
    where
        F: FnOnce() -> O + Send + 'static,
        O: JobOutcome,
    {
        self.submit(Job::new(self.shared.name.clone(), work))
    }

    /// Queue a closure with an explicit label for log correlation.
    ///
    /// # Errors
    ///
    /// `SpoolError::InvalidJob` if the spool is closed.
    pub fn enqueue_labeled<F, O>(&self, label: impl Into<String>, work: F) -> Result<JobId, SpoolError>
    where
        F: FnOnce() -> O + Send + 'static,
        O: JobOutcome,
    {
        self.submit(Job::new(label, work))
    }

    /// Queue a prepared job. Never blocks on running work.
    ///
    /// # Errors
    ///
    /// `SpoolError::InvalidJob` if the spool is closed.
    pub fn submit(&self, job: Job) -> Result<JobId, SpoolError> {
        let mut st = self.shared.state.lock();
        if st.phase == Phase::Closed {
            warn!(spool = %self.shared.name, label = %job.label(), "job submitted to closed spool");
            return Err(self.shared.closed_error(job.label()));
        }
        let id = st.backlog.push(job);
        drop(st);
        self.shared.wake.notify_all();
        debug!(spool = %self.shared.name, job_id = id, "job queued");
        Ok(id)
    }

    /// Change the quota. Running jobs are unaffected; slack is used immediately.
    pub fn set_quota(&self, quota: usize) {
        self.shared.state.lock().backlog.set_quota(quota);
        self.shared.wake.notify_all();
        debug!(spool = %self.shared.name, quota, "quota changed");
    }

    /// Finish every running job before admitting any queued one.
    pub fn flush(&self) {
        self.shared.state.lock().backlog.flush();
        self.shared.wake.notify_all();
    }

    /// Discard queued jobs, then drain and close like `finish`.
    ///
    /// Running jobs are never interrupted.
    ///
    /// # Errors
    ///
    /// `SpoolError::Cancelled` if a [`CancelHandle`] fired during the drain.
    pub fn cancel(&self) -> Result<(), SpoolError> {
        let discarded = self.shared.state.lock().backlog.clear();
        info!(spool = %self.shared.name, discarded, "spool cancelled");
        self.finish(FinishOptions::new())
    }

    /// Block until nothing is queued or running.
    ///
    /// Background admission stops; the calling thread keeps admitting queued
    /// jobs (including ones enqueued during the drain) until the spool is
    /// empty. Afterwards the spool either resumes background admission or is
    /// closed for good.
    ///
    /// # Errors
    ///
    /// `SpoolError::Cancelled` if a [`CancelHandle`] fired during the drain;
    /// the backlog is discarded and running jobs are awaited first.
    ///
    /// # Panics
    ///
    /// If the drain ends with queued or running jobs left, which would be a
    /// bug in the spool itself.
    pub fn finish(&self, options: FinishOptions) -> Result<(), SpoolError> {
        let show_progress = options.show_progress.unwrap_or(self.shared.show_progress);
        if options.verbose {
            info!("{self}");
        }

        let control = {
            let mut st = self.shared.state.lock();
            if st.phase == Phase::Closed {
                debug!(spool = %self.shared.name, "finish on closed spool");
                return Ok(());
            }
            st.phase = Phase::Draining;
            st.control.take()
        };
        self.shared.wake.notify_all();
        if let Some(handle) = control {
            if handle.join().is_err() {
                error!(spool = %self.shared.name, "spooler thread panicked");
            }
        }

        let mut st = self.shared.state.lock();
        let drained = self.drain(&mut st, show_progress);
        if let Err(e) = drained {
            st.phase = Phase::Closed;
            warn!(spool = %self.shared.name, "drain cancelled");
            return Err(e);
        }

        if options.resume {
            st.cancel_requested = false;
            st.phase = Phase::Spooling;
            st.control = Some(self.shared.spawn_control()?);
            drop(st);
            self.shared.wake.notify_all();
        } else {
            assert!(
                st.backlog.is_empty(),
                "spool `{}` finished without deploying all jobs",
                self.shared.name
            );
            assert!(
                st.running.is_empty(),
                "spool `{}` finished without finishing all jobs",
                self.shared.name
            );
            st.phase = Phase::Closed;
            drop(st);
            info!(spool = %self.shared.name, "spool closed");
        }

        if options.verbose {
            info!("{self}");
        }
        Ok(())
    }

    /// Admit and wait until empty, holding `st` except around sink calls and joins.
    fn drain(&self, st: &mut MutexGuard<'_, ThreadState>, show_progress: bool) -> Result<(), SpoolError> {
        let shared = &self.shared;
        let baseline = st.backlog.baseline();
        let mut progress = None;
        if show_progress {
            let report = st.backlog.report(&shared.name, st.running.live_count(), baseline);
            progress = MutexGuard::unlocked(st, || ProgressGuard::open(&shared.sink, report));
        }
        let mut warned_stalled = false;

        let outcome = loop {
            if st.cancel_requested {
                let discarded = st.backlog.clear();
                if discarded > 0 {
                    warn!(spool = %shared.name, discarded, "cancellation requested while draining");
                }
            }

            let finished = shared.admit(st);
            if !finished.is_empty() {
                MutexGuard::unlocked(st, || join_units(&shared.name, finished));
                continue;
            }

            let live = st.running.live_count();
            if let Some(guard) = progress.as_mut() {
                let report = st.backlog.report(&shared.name, live, baseline);
                if guard.is_stale(&report) {
                    MutexGuard::unlocked(st, || guard.update(report));
                    continue;
                }
            }

            if st.backlog.is_empty() && st.running.is_empty() {
                break if st.cancel_requested {
                    Err(SpoolError::Cancelled)
                } else {
                    Ok(())
                };
            }

            if live == 0 && st.backlog.quota() == 0 && !warned_stalled {
                warn!(spool = %shared.name, queued = st.backlog.len(), "draining with quota 0; waiting for set_quota");
                warned_stalled = true;
            }

            if progress.is_some() {
                shared.wake.wait_for(st, shared.progress_interval);
            } else {
                shared.wake.wait(st);
            }
        };

        MutexGuard::unlocked(st, || drop(progress));
        outcome
    }

    /// Handle that can cancel this spool from any thread.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Route a line through the progress sink.
    pub fn print(&self, line: &str) {
        self.shared.sink.message(&self.shared.name, line);
    }

    /// Jobs currently running.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.shared.state.lock().running.live_count()
    }

    /// Jobs waiting for admission.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.shared.state.lock().backlog.len()
    }

    /// Current quota.
    #[must_use]
    pub fn quota(&self) -> usize {
        self.shared.state.lock().backlog.quota()
    }

    /// True once the spool has been closed by `finish`, `cancel` or a cancellation.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().phase == Phase::Closed
    }

    /// Lifetime totals: submitted jobs as `total`, completions as `done`.
    #[must_use]
    pub fn stats(&self) -> crate::core::ProgressReport {
        let st = self.shared.state.lock();
        let mut report = st.backlog.report(&self.shared.name, st.running.live_count(), super::Baseline::default());
        report.total = st.backlog.submitted();
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

impl fmt::Display for ThreadSpool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (running, quota, queued) = {
            let st = self.shared.state.lock();
            (st.running.live_count(), st.backlog.quota(), st.backlog.len())
        };
        write!(
            f,
            "ThreadSpool '{}' ({}): {running}/{quota} running with {queued} queued.",
            self.shared.name, self.shared.id
        )
    }
}

impl fmt::Debug for ThreadSpool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSpool")
            .field("name", &self.shared.name)
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl Drop for ThreadSpool {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        debug!(spool = %self.shared.name, "spool dropped while open; draining");
        if let Err(e) = self.finish(FinishOptions::new()) {
            warn!(spool = %self.shared.name, error = %e, "drain on drop ended early");
        }
    }
}

/// Cancellation signal for a [`ThreadSpool`], usable from any thread
/// (for example a Ctrl-C handler).
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    /// Discard the backlog and make the current or next drain return
    /// `SpoolError::Cancelled` once running jobs have completed.
    pub fn cancel(&self) {
        let discarded = {
            let mut st = self.shared.state.lock();
            st.cancel_requested = true;
            st.backlog.clear()
        };
        self.shared.wake.notify_all();
        warn!(spool = %self.shared.name, discarded, "cancellation signalled");
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("spool", &self.shared.name)
            .finish()
    }
}
