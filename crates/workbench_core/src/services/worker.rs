//! Bounded worker pool for engine calls.
//!
//! Engine I/O never runs on the caller's thread: the pool owns a small
//! multi-threaded tokio runtime and every connection dispatches onto it.

use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::config::RuntimeConfig;
use crate::error::{WorkbenchError, WorkbenchResult};

/// A fixed-size pool of worker threads shared by a registry's connections.
pub struct WorkerPool {
    handle: Handle,
    runtime: Option<Runtime>,
    worker_threads: usize,
}

impl WorkerPool {
    /// Create a pool with the given number of worker threads (minimum one).
    pub fn new(worker_threads: usize) -> WorkbenchResult<Self> {
        let worker_threads = worker_threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("workbench-worker")
            .enable_all()
            .build()
            .map_err(|e| WorkbenchError::internal(format!("Failed to create worker pool: {e}")))?;

        tracing::debug!(worker_threads, "Worker pool started");

        Ok(Self { handle: runtime.handle().clone(), runtime: Some(runtime), worker_threads })
    }

    /// Create a pool sized from the runtime configuration.
    pub fn from_config(config: &RuntimeConfig) -> WorkbenchResult<Self> {
        Self::new(config.worker_threads)
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Spawn a future on the pool.
    pub fn spawn<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run a future on the pool and wait for it without blocking the caller's thread.
    pub async fn run<F, T>(&self, future: F) -> WorkbenchResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(future)
            .await
            .map_err(|e| WorkbenchError::internal(format!("Worker task failed: {e}")))
    }

    /// Block the current thread until the future completes.
    ///
    /// Must not be called from inside an async context.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Dropping a Runtime inside an async context panics.
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("worker_threads", &self.worker_threads).finish()
    }
}
