//! # Spool
//!
//! A bounded work-queue scheduler for background jobs.
//!
//! A spool accepts jobs at any time, runs at most `quota` of them concurrently
//! and lets the caller drain it: `finish` blocks (or awaits) until nothing is
//! queued or running. Jobs that fail or panic are logged and counted, never
//! propagated, so one bad job cannot stall the rest.
//!
//! ## Strategies
//!
//! - [`ThreadSpool`](crate::core::ThreadSpool): one OS thread per admitted job,
//!   with a background control thread doing admission. Suited to blocking
//!   work such as file I/O or subprocesses.
//! - [`TaskSpool`](crate::core::TaskSpool) (feature `tokio-runtime`): one
//!   `spawn_local` task per admitted job on a single-threaded tokio
//!   `LocalSet`. Admission is driven from each job's completion.
//!
//! ```rust,ignore
//! use spool::config::SpoolConfig;
//! use spool::core::{FinishOptions, ThreadSpool};
//!
//! let outcome = ThreadSpool::scope(SpoolConfig::new().with_name("thumbnails"), |spool| {
//!     for path in paths {
//!         spool.enqueue(move || make_thumbnail(&path))?;
//!     }
//!     Ok::<_, spool::core::SpoolError>(())
//! })?;
//! ```
//!
//! ## Progress
//!
//! Drains report through a [`ProgressSink`](crate::core::ProgressSink);
//! the default emits `tracing` events. Call
//! [`init_tracing`](crate::util::init_tracing) or install your own subscriber.
//!
//! ## Deferred deletion
//!
//! [`Trash`](crate::infra::Trash) is a small collaborator built on a
//! `ThreadSpool`: deletions are held in a bounded undo window and committed
//! in the background.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Jobs, spools, progress reporting and errors.
pub mod core;
/// Configuration models for spools.
pub mod config;
/// Builders to construct spools from configuration.
pub mod builders;
/// Collaborators built on top of spools.
pub mod infra;
/// Runtime helpers for task-backed spools.
#[cfg(feature = "tokio-runtime")]
pub mod runtime;
/// Shared utilities.
pub mod util;
