//! Single-threaded runtime for driving a [`TaskSpool`](crate::core::TaskSpool)
//! from synchronous code.

use std::future::Future;

use tokio::runtime::{Builder, Runtime};
use tokio::task::LocalSet;

use crate::core::SpoolError;

/// A current-thread tokio runtime paired with a `LocalSet`.
///
/// Task spools spawn with `spawn_local`, so their futures must be polled
/// inside a `LocalSet`; this bundles both.
pub struct LocalRuntime {
    runtime: Runtime,
    local: LocalSet,
}

impl LocalRuntime {
    /// Build the runtime with all drivers (time, I/O) enabled.
    ///
    /// # Errors
    ///
    /// `SpoolError::Spawn` if the runtime cannot be created.
    pub fn new() -> Result<Self, SpoolError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name("spool-local")
            .build()
            .map_err(|e| SpoolError::Spawn(format!("tokio runtime: {e}")))?;
        Ok(Self {
            runtime,
            local: LocalSet::new(),
        })
    }

    /// Run `future` to completion inside the `LocalSet`.
    ///
    /// Local tasks left running when `future` returns are polled again on
    /// the next call.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.local.block_on(&self.runtime, future)
    }
}

impl std::fmt::Debug for LocalRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRuntime").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpoolConfig;
    use crate::core::{FinishOptions, NullProgress, TaskSpool};
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::Arc;

    #[test]
    fn test_block_on_drives_task_spool() {
        let rt = LocalRuntime::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        rt.block_on(async {
            let spool = TaskSpool::with_sink(
                SpoolConfig::new().with_quota(2).with_name("local"),
                Arc::new(NullProgress),
            )
            .unwrap();
            for _ in 0..5 {
                let hits = Rc::clone(&hits);
                spool
                    .enqueue(async move {
                        tokio::task::yield_now().await;
                        hits.set(hits.get() + 1);
                    })
                    .unwrap();
            }
            spool.finish(FinishOptions::new()).await.unwrap();
        });
        assert_eq!(hits.get(), 5);
    }
}
