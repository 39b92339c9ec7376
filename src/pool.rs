//! Dedicated, independently sized execution pools.
//!
//! The worker loops, the scheduler's asynchronous dispatch and the heartbeat
//! updater each run on their own multi-threaded tokio runtime. Saturating one
//! runtime's threads never delays tasks on another.

use crate::error::Result;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

/// A named tokio runtime with a fixed number of worker threads.
pub struct DedicatedPool {
    name: String,
    threads: usize,
    runtime: Option<Runtime>,
    handle: Handle,
}

impl DedicatedPool {
    /// Build a pool whose threads are named `{name}-{n}`.
    pub fn new(name: impl Into<String>, threads: usize) -> Result<Self> {
        let name = name.into();
        let threads = threads.max(1);
        let prefix = name.clone();
        let counter = AtomicUsize::new(0);

        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name_fn(move || {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                format!("{prefix}-{n}")
            })
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        debug!(pool = %name, threads, "dedicated pool started");

        Ok(Self {
            name,
            threads,
            runtime: Some(runtime),
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Shut the runtime down without blocking the caller.
    ///
    /// Safe to call from inside another runtime. Tasks still running are
    /// dropped at their next yield point.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            debug!(pool = %self.name, "dedicated pool shutting down");
            runtime.shutdown_background();
        }
    }
}

impl Drop for DedicatedPool {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

impl std::fmt::Debug for DedicatedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedicatedPool")
            .field("name", &self.name)
            .field("threads", &self.threads)
            .field("running", &self.runtime.is_some())
            .finish()
    }
}
