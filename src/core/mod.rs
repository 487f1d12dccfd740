//! Core scheduling abstractions: jobs, progress reporting and the spools.

pub mod error;
pub mod job;
pub mod progress;
pub mod spool;

pub use error::{AppResult, SpoolError};
#[cfg(feature = "tokio-runtime")]
pub use job::TaskJob;
pub use job::{Job, JobFailure, JobId, JobOutcome};
pub use progress::{
    InMemoryProgress, NullProgress, ProgressEvent, ProgressReport, ProgressSink, TracingProgress,
};
pub use spool::{CancelHandle, FinishOptions, ThreadSpool};
#[cfg(feature = "tokio-runtime")]
pub use spool::{TaskCancelHandle, TaskSpool};
