//! Error types for spool operations.

use thiserror::Error;

/// Errors produced by spool components.
///
/// Job failures are deliberately absent: a job that errors or panics is
/// logged and counted by the spool, never surfaced to the submitter.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// The spool was closed by a terminal `finish`/`cancel`; the job was rejected.
    #[error("invalid job: {0}")]
    InvalidJob(String),
    /// A cancellation signal arrived while the spool was draining.
    #[error("spool cancelled while draining")]
    Cancelled,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The operating system refused to start a thread.
    #[error("failed to spawn: {0}")]
    Spawn(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
