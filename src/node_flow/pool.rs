//! Worker threads running node invocations.
//!
//! Invocation bodies are plain blocking functions, so they go through
//! tokio's blocking pool. A pool either owns its runtime or borrows the
//! handle of a runtime the caller already runs.

use std::sync::Arc;
use tokio::runtime::{Handle, Runtime};
use tracing::info;

use crate::core::config::FlowConfig;
use crate::core::errors::{FlowError, Result};

lazy_static::lazy_static! {
    static ref GLOBAL_POOL: parking_lot::Mutex<Option<WorkerPool>> = parking_lot::Mutex::new(None);
}

/// Cheap, cloneable access to the threads running invocations
#[derive(Clone)]
pub struct WorkerPool {
    handle: Handle,
    _runtime: Option<Arc<OwnedRuntime>>,
}

/// Shuts the runtime down without blocking, whichever thread drops it last
struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

impl WorkerPool {
    /// Starts a dedicated runtime sized by `config`
    pub fn new(config: &FlowConfig) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .max_blocking_threads(config.max_blocking_threads)
            .thread_name(config.thread_name.clone())
            .enable_time()
            .build()
            .map_err(|e| FlowError::io("starting worker pool", e))?;

        info!(
            worker_threads = config.worker_threads,
            max_blocking_threads = config.max_blocking_threads,
            "Worker pool started"
        );
        Ok(Self {
            handle: runtime.handle().clone(),
            _runtime: Some(Arc::new(OwnedRuntime(Some(runtime)))),
        })
    }

    /// Runs invocations on a runtime owned by the caller
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            _runtime: None,
        }
    }

    /// The process-wide pool, started with default settings on first use
    /// unless [`WorkerPool::init_global`] ran before.
    pub fn global() -> Result<Self> {
        let mut global = GLOBAL_POOL.lock();
        if let Some(pool) = global.as_ref() {
            return Ok(pool.clone());
        }
        let pool = Self::new(&FlowConfig::default())?;
        *global = Some(pool.clone());
        Ok(pool)
    }

    /// Starts the process-wide pool with `config`. Fails if it is already
    /// running.
    pub fn init_global(config: &FlowConfig) -> Result<()> {
        let mut global = GLOBAL_POOL.lock();
        if global.is_some() {
            return Err(FlowError::configuration(
                "global worker pool is already running",
            ));
        }
        *global = Some(Self::new(config)?);
        Ok(())
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Runs `job` on a blocking thread. The job is never awaited; it reports
    /// back through the node it belongs to.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        drop(self.handle.spawn_blocking(job));
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("owned", &self._runtime.is_some())
            .finish()
    }
}
