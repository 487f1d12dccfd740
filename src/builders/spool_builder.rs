//! Builders to construct spools from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{SpoolConfig, SpoolsConfig};
use crate::core::{ProgressSink, SpoolError, ThreadSpool, TracingProgress};
#[cfg(feature = "tokio-runtime")]
use crate::core::TaskSpool;

/// Builder pairing a [`SpoolConfig`] with a progress sink.
#[derive(Clone)]
pub struct SpoolBuilder {
    config: SpoolConfig,
    sink: Arc<dyn ProgressSink>,
}

impl SpoolBuilder {
    /// Start from `config`, reporting progress through `tracing`.
    #[must_use]
    pub fn new(config: SpoolConfig) -> Self {
        Self {
            config,
            sink: Arc::new(TracingProgress),
        }
    }

    /// Route progress to `sink` instead.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Adjust the configuration in place.
    #[must_use]
    pub fn configure(mut self, f: impl FnOnce(SpoolConfig) -> SpoolConfig) -> Self {
        self.config = f(self.config);
        self
    }

    /// The configuration the next spool will be built with.
    #[must_use]
    pub const fn config(&self) -> &SpoolConfig {
        &self.config
    }

    /// Build a thread-backed spool.
    ///
    /// # Errors
    ///
    /// `SpoolError::InvalidConfig` or `SpoolError::Spawn`.
    pub fn build_thread(&self) -> Result<ThreadSpool, SpoolError> {
        ThreadSpool::with_sink(self.config.clone(), Arc::clone(&self.sink))
    }

    /// Build a task-backed spool. Jobs are spawned on the current `LocalSet`.
    ///
    /// # Errors
    ///
    /// `SpoolError::InvalidConfig`.
    #[cfg(feature = "tokio-runtime")]
    pub fn build_task(&self) -> Result<TaskSpool, SpoolError> {
        TaskSpool::with_sink(self.config.clone(), Arc::clone(&self.sink))
    }
}

impl std::fmt::Debug for SpoolBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpoolBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Build one thread-backed spool per configured key, all sharing `sink`.
///
/// # Errors
///
/// `SpoolError::InvalidConfig` if any entry is invalid; no spool is built in
/// that case.
pub fn build_thread_spools(
    cfg: &SpoolsConfig,
    sink: &Arc<dyn ProgressSink>,
) -> Result<HashMap<String, ThreadSpool>, SpoolError> {
    cfg.validate().map_err(SpoolError::InvalidConfig)?;

    let mut spools = HashMap::with_capacity(cfg.spools.len());
    for (key, spool_cfg) in &cfg.spools {
        let spool = ThreadSpool::with_sink(spool_cfg.clone(), Arc::clone(sink))?;
        spools.insert(key.clone(), spool);
    }
    Ok(spools)
}
