//! Units of work accepted by the spools.
//!
//! A job is a zero-argument closure (thread-backed spool) or a not-yet-started
//! future (task-backed spool) that captures its own inputs. Whatever the work
//! returns is collapsed into an outcome through [`JobOutcome`], so callers can
//! submit plain side effects as well as fallible work:
//!
//! ```rust,ignore
//! spool.enqueue(move || work.lock().push(i))?;
//! spool.enqueue(move || std::fs::remove_file(&path))?;
//! ```

use std::any::Any;
use std::fmt;
#[cfg(feature = "tokio-runtime")]
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
#[cfg(feature = "tokio-runtime")]
use std::pin::Pin;

#[cfg(feature = "tokio-runtime")]
use futures::FutureExt;

/// Sequential identifier assigned to every accepted job.
pub type JobId = u64;

/// Conversion from a job's return value into a success/failure outcome.
pub trait JobOutcome {
    /// Collapse the value into `Ok(())` or a printable failure reason.
    ///
    /// # Errors
    ///
    /// Returns the failure reason when the job reported one.
    fn into_outcome(self) -> Result<(), String>;
}

impl JobOutcome for () {
    fn into_outcome(self) -> Result<(), String> {
        Ok(())
    }
}

impl<E: fmt::Display> JobOutcome for Result<(), E> {
    fn into_outcome(self) -> Result<(), String> {
        // `{:#}` prints the whole cause chain for anyhow errors.
        self.map_err(|e| format!("{e:#}"))
    }
}

/// Why a job did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    /// The job returned an error.
    Error(String),
    /// The job panicked.
    Panic(String),
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(reason) => write!(f, "job returned error: {reason}"),
            Self::Panic(reason) => write!(f, "job panicked: {reason}"),
        }
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

type BoxedWork = Box<dyn FnOnce() -> Result<(), String> + Send + 'static>;

/// A closure job for [`ThreadSpool`](crate::core::ThreadSpool).
pub struct Job {
    label: String,
    work: BoxedWork,
}

impl Job {
    /// Wrap a closure with a display label.
    pub fn new<F, O>(label: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> O + Send + 'static,
        O: JobOutcome,
    {
        Self {
            label: label.into(),
            work: Box::new(move || work().into_outcome()),
        }
    }

    /// Display label used in logs.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run the job on the current thread, containing errors and panics.
    pub(crate) fn run(self) -> Result<(), JobFailure> {
        let work = self.work;
        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(JobFailure::Error(reason)),
            Err(payload) => Err(JobFailure::Panic(panic_reason(payload.as_ref()))),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("label", &self.label).finish_non_exhaustive()
    }
}

#[cfg(feature = "tokio-runtime")]
type BoxedFuture = Pin<Box<dyn Future<Output = Result<(), String>> + 'static>>;

/// A not-yet-started future for [`TaskSpool`](crate::core::TaskSpool).
///
/// Task jobs never leave the spool's thread, so the future need not be `Send`.
#[cfg(feature = "tokio-runtime")]
pub struct TaskJob {
    label: String,
    work: BoxedFuture,
}

#[cfg(feature = "tokio-runtime")]
impl TaskJob {
    /// Wrap a future with a display label. The future is not polled until admitted.
    pub fn new<F, O>(label: impl Into<String>, work: F) -> Self
    where
        F: Future<Output = O> + 'static,
        O: JobOutcome,
    {
        Self {
            label: label.into(),
            work: Box::pin(async move { work.await.into_outcome() }),
        }
    }

    /// Display label used in logs.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Drive the future to completion, containing errors and panics.
    pub(crate) async fn run(self) -> Result<(), JobFailure> {
        match AssertUnwindSafe(self.work).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(JobFailure::Error(reason)),
            Err(payload) => Err(JobFailure::Panic(panic_reason(payload.as_ref()))),
        }
    }
}

#[cfg(feature = "tokio-runtime")]
impl fmt::Debug for TaskJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskJob")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_job_succeeds() {
        let job = Job::new("noop", || ());
        assert_eq!(job.label(), "noop");
        assert_eq!(job.run(), Ok(()));
    }

    #[test]
    fn test_error_job_reports_reason() {
        let job = Job::new("io", || -> Result<(), std::io::Error> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
        });
        assert_eq!(job.run(), Err(JobFailure::Error("gone".into())));
    }

    #[test]
    fn test_anyhow_job_reports_chain() {
        let job = Job::new("chain", || -> anyhow::Result<()> {
            Err(anyhow::anyhow!("root cause").context("outer"))
        });
        assert_eq!(
            job.run(),
            Err(JobFailure::Error("outer: root cause".into()))
        );
    }

    #[test]
    fn test_panicking_job_is_contained() {
        let job = Job::new::<_, ()>("boom", || panic!("kaboom"));
        let failure = job.run().unwrap_err();
        assert_eq!(failure, JobFailure::Panic("kaboom".into()));
        assert_eq!(failure.to_string(), "job panicked: kaboom");
    }

    #[cfg(feature = "tokio-runtime")]
    #[tokio::test]
    async fn test_task_job_panic_is_contained() {
        let job = TaskJob::new::<_, ()>("async-boom", async {
            panic!("async kaboom");
        });
        assert_eq!(
            job.run().await,
            Err(JobFailure::Panic("async kaboom".into()))
        );
    }

    #[cfg(feature = "tokio-runtime")]
    #[tokio::test]
    async fn test_task_job_error() {
        let job = TaskJob::new("async-err", async { Err::<(), _>("nope") });
        assert_eq!(job.run().await, Err(JobFailure::Error("nope".into())));
    }
}
