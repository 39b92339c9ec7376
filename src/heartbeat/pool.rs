//! The pool heartbeat updates run on.
//!
//! Sized independently of the worker and scheduler pools so a flood of
//! message processing can never delay a liveness update, and slow liveness
//! updates can never hold up processing.

use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::pool::DedicatedPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use tokio::runtime::Handle;
use tracing::info;

const COMPONENT: &str = "heartbeat thread pool";

#[derive(Debug)]
pub struct HeartBeatThreadPool {
    threads: usize,
    lifecycle: Lifecycle,
    pool: Mutex<Option<DedicatedPool>>,
    handle: OnceLock<Handle>,
    /// Heartbeat workers currently ticking on this pool.
    running: AtomicUsize,
}

impl HeartBeatThreadPool {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            lifecycle: Lifecycle::new(COMPONENT),
            pool: Mutex::new(None),
            handle: OnceLock::new(),
            running: AtomicUsize::new(0),
        }
    }

    pub fn start(&self) -> Result<()> {
        self.lifecycle.ensure_active()?;
        let mut slot = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(Error::AlreadyStarted(COMPONENT));
        }

        let pool = DedicatedPool::new("workq-heartbeat", self.threads)?;
        let _ = self.handle.set(pool.handle().clone());
        *slot = Some(pool);
        info!(threads = self.threads, "heartbeat pool started");
        Ok(())
    }

    pub fn started(&self) -> bool {
        self.handle.get().is_some()
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn running_workers(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn handle(&self) -> Result<Handle> {
        self.lifecycle.ensure_active()?;
        self.handle
            .get()
            .cloned()
            .ok_or(Error::NotStarted(COMPONENT))
    }

    pub(crate) fn worker_started(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn worker_finished(&self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
    }

    /// Tear the pool down. Heartbeat workers still attached stop ticking.
    pub fn dispose(&self) {
        if !self.lifecycle.begin_dispose() {
            return;
        }
        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pool) = pool {
            pool.shutdown();
        }
        self.lifecycle.finish_dispose();
        info!("heartbeat pool disposed");
    }
}
