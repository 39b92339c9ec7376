//! Bounded-capacity task scheduler.
//!
//! Every running task holds one of `max_threads` global slots. Grouped work
//! also holds a slot of its group and, when either is taken, may wait in the
//! group's queue. All admitted work runs on the scheduler's dedicated pool.

use super::gate::{BackpressureGate, GateWake};
use super::work_group::WorkGroup;
use super::{RoomForTask, ScheduledTask, TryStartResult};
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::pool::DedicatedPool;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

const COMPONENT: &str = "task scheduler";

/// Admission control over named work groups plus an ungrouped default.
pub struct TaskScheduler {
    shared: Arc<Shared>,
}

struct Shared {
    id: Uuid,
    config: SchedulerConfig,
    lifecycle: Lifecycle,
    started: AtomicBool,
    groups: RwLock<HashMap<String, WorkGroup>>,
    /// Global slots taken: running tasks of every kind.
    in_flight: AtomicUsize,
    drained: Notify,
    gate: Arc<BackpressureGate>,
    pool: Mutex<Option<DedicatedPool>>,
    handle: OnceLock<Handle>,
    subscribers: Mutex<HashSet<Uuid>>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_gate(config, Arc::new(BackpressureGate::new()))
    }

    /// Build a scheduler that signals an externally owned gate.
    pub fn with_gate(config: SchedulerConfig, gate: Arc<BackpressureGate>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                config,
                lifecycle: Lifecycle::new(COMPONENT),
                started: AtomicBool::new(false),
                groups: RwLock::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                gate,
                pool: Mutex::new(None),
                handle: OnceLock::new(),
                subscribers: Mutex::new(HashSet::new()),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Register a work group. Only allowed before [`start`](Self::start).
    ///
    /// A name can be registered once; a second registration fails with
    /// [`Error::DuplicateWorkGroup`].
    pub fn add_work_group(
        &self,
        name: impl Into<String>,
        concurrency_level: usize,
        max_queue_size: usize,
    ) -> Result<WorkGroup> {
        self.shared.lifecycle.ensure_active()?;
        if self.started() {
            return Err(Error::AlreadyStarted(COMPONENT));
        }

        let name = name.into();
        if concurrency_level == 0 || concurrency_level > self.shared.config.max_threads {
            return Err(Error::InvalidWorkGroup {
                reason: format!(
                    "concurrency level must be between 1 and {}, got {concurrency_level}",
                    self.shared.config.max_threads
                ),
                name,
            });
        }

        let mut groups = self.shared.groups.write().unwrap_or_else(|e| e.into_inner());
        if groups.contains_key(&name) {
            return Err(Error::DuplicateWorkGroup(name));
        }

        let group = WorkGroup::new(self.shared.id, name.clone(), concurrency_level, max_queue_size);
        groups.insert(name, group.clone());
        debug!(
            group = group.name(),
            concurrency_level, max_queue_size, "work group registered"
        );
        Ok(group)
    }

    pub fn work_group(&self, name: &str) -> Option<WorkGroup> {
        self.shared
            .groups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spin up the dispatch pool. Work groups are frozen from here on.
    pub fn start(&self) -> Result<()> {
        self.shared.lifecycle.ensure_active()?;
        if self
            .shared
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyStarted(COMPONENT));
        }

        let pool = match DedicatedPool::new("workq-scheduler", self.shared.config.max_threads) {
            Ok(pool) => pool,
            Err(e) => {
                self.shared.started.store(false, Ordering::Release);
                return Err(e);
            }
        };
        let _ = self.shared.handle.set(pool.handle().clone());
        *self.shared.pool.lock().unwrap_or_else(|e| e.into_inner()) = Some(pool);

        info!(
            max_threads = self.shared.config.max_threads,
            groups = self.shared.groups.read().unwrap_or_else(|e| e.into_inner()).len(),
            "task scheduler started"
        );
        Ok(())
    }

    pub fn started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lifecycle.is_disposed()
    }

    /// Drop queued work, wait up to the configured shutdown wait for running
    /// work, release every gate waiter and tear the pool down.
    ///
    /// Idempotent. Every public operation fails with [`Error::Disposed`]
    /// once this has been called.
    pub async fn dispose(&self) {
        if !self.shared.lifecycle.begin_dispose() {
            return;
        }

        let dropped: usize = self.shared.groups().iter().map(WorkGroup::clear).sum();
        if dropped > 0 {
            warn!(dropped, "queued work discarded on scheduler dispose");
        }

        let timeout = self.shared.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.shared.wait_drained()).await.is_err() {
            warn!(
                remaining = self.shared.in_flight.load(Ordering::Acquire),
                timeout_ms = timeout.as_millis() as u64,
                "scheduler shutdown wait elapsed with work still running"
            );
        }

        self.shared.gate.cancel();
        let pool = self
            .shared
            .pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(pool) = pool {
            pool.shutdown();
        }

        self.shared.lifecycle.finish_dispose();
        info!("task scheduler disposed");
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Room for ungrouped work. Never blocks.
    pub fn room_for_new_task(&self) -> Result<RoomForTask> {
        self.shared.lifecycle.ensure_active()?;
        Ok(self.shared.ungrouped_room())
    }

    /// Room for work in `group`. Never blocks.
    pub fn room_for_new_work_group_task(&self, group: &WorkGroup) -> Result<RoomForTask> {
        self.shared.lifecycle.ensure_active()?;
        self.shared.check_owner(group)?;
        Ok(group.room(self.shared.global_room()))
    }

    /// Start, queue or reject `task`. Never blocks.
    pub fn add_task<F>(&self, task: F, group: Option<&WorkGroup>) -> Result<TryStartResult>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shared.lifecycle.ensure_active()?;
        if !self.started() {
            return Err(Error::NotStarted(COMPONENT));
        }

        let task: ScheduledTask = Box::pin(task);
        let result = match group {
            None => {
                if self.shared.try_acquire_global() {
                    Shared::spawn_admitted(&self.shared, task, None);
                    TryStartResult::Added
                } else {
                    TryStartResult::Rejected
                }
            }
            Some(group) => {
                self.shared.check_owner(group)?;
                if self.shared.try_admit(group) {
                    Shared::spawn_admitted(&self.shared, task, Some(group.clone()));
                    TryStartResult::Added
                } else {
                    match group.try_enqueue(task) {
                        Ok(()) => {
                            // A slot may have freed between the failed admit and the push.
                            Shared::promote(&self.shared, Some(group));
                            TryStartResult::Queued
                        }
                        Err(_) => TryStartResult::Rejected,
                    }
                }
            }
        };

        metrics::scheduler_admissions().add(
            1,
            &[
                KeyValue::new("result", result.as_str()),
                KeyValue::new(
                    "group",
                    group.map(|g| g.name().to_string()).unwrap_or_default(),
                ),
            ],
        );
        if result == TryStartResult::Rejected {
            debug!(group = group.map(WorkGroup::name), "task rejected: no capacity");
        }
        Ok(result)
    }

    /// Resolve once there is room for new work in `group` (or ungrouped work
    /// when `None`), or once the gate is cancelled.
    pub async fn wait_for_free_thread(&self, group: Option<&WorkGroup>) -> Result<GateWake> {
        let name = group.map(WorkGroup::name);
        loop {
            self.shared.lifecycle.ensure_active()?;
            // Close the gate before checking so a completion racing the check
            // re-opens it and the wait below returns.
            self.shared.gate.reset(name);
            let room = match group {
                Some(group) => self.room_for_new_work_group_task(group)?,
                None => self.room_for_new_task()?,
            };
            if room.has_room() {
                return Ok(GateWake::Signalled);
            }
            if self.shared.gate.wait(name).await == GateWake::Cancelled {
                return Ok(GateWake::Cancelled);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Consumers
    // -----------------------------------------------------------------------

    /// Register a consumer. Advisory only; used for diagnostics.
    pub fn subscribe(&self) -> Result<Uuid> {
        self.shared.lifecycle.ensure_active()?;
        let id = Uuid::new_v4();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
        Ok(id)
    }

    pub fn unsubscribe(&self, id: Uuid) -> Result<()> {
        self.shared.lifecycle.ensure_active()?;
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    pub fn max_threads(&self) -> usize {
        self.shared.config.max_threads
    }

    /// Running tasks, grouped and ungrouped.
    pub fn current_task_count(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn gate(&self) -> &Arc<BackpressureGate> {
        &self.shared.gate
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        let pool = self
            .shared
            .pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(pool) = pool {
            self.shared.gate.cancel();
            pool.shutdown();
        }
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("max_threads", &self.shared.config.max_threads)
            .field("started", &self.started())
            .field("state", &self.shared.lifecycle.state())
            .field("in_flight", &self.current_task_count())
            .finish()
    }
}

impl Shared {
    fn global_room(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) < self.config.max_threads
    }

    fn ungrouped_room(&self) -> RoomForTask {
        if self.global_room() {
            RoomForTask::RoomForTask
        } else {
            RoomForTask::No
        }
    }

    fn try_acquire_global(&self) -> bool {
        let limit = self.config.max_threads;
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_global(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        debug_assert!(previous.is_ok(), "global slot released twice");
        if previous == Ok(1) {
            self.drained.notify_waiters();
        }
    }

    /// Take a group slot and a global slot, or neither.
    fn try_admit(&self, group: &WorkGroup) -> bool {
        if !group.try_acquire_slot() {
            return false;
        }
        if self.try_acquire_global() {
            return true;
        }
        group.release_slot();
        false
    }

    fn check_owner(&self, group: &WorkGroup) -> Result<()> {
        if group.inner.owner == self.id {
            Ok(())
        } else {
            Err(Error::InvalidWorkGroup {
                name: group.name().to_string(),
                reason: "registered with a different scheduler".to_string(),
            })
        }
    }

    fn groups(&self) -> Vec<WorkGroup> {
        self.groups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Run a task whose slots have already been acquired.
    fn spawn_admitted(shared: &Arc<Shared>, task: ScheduledTask, group: Option<WorkGroup>) {
        let guard = CompletionGuard {
            shared: Arc::clone(shared),
            group,
        };
        match shared.handle.get() {
            Some(handle) => {
                handle.spawn(async move {
                    let _guard = guard;
                    task.await;
                });
            }
            // Not reachable after start(); dropping the guard hands the slots back.
            None => drop(guard),
        }
    }

    /// Move queued tasks into free slots: `first` before the other groups,
    /// oldest first within a group.
    fn promote(shared: &Arc<Shared>, first: Option<&WorkGroup>) {
        if let Some(group) = first {
            if !Shared::promote_group(shared, group) {
                return;
            }
        }
        for group in shared.groups() {
            if !Shared::promote_group(shared, &group) {
                return;
            }
        }
    }

    /// Returns false once the global slots are exhausted.
    fn promote_group(shared: &Arc<Shared>, group: &WorkGroup) -> bool {
        while group.queued_count() > 0 && !shared.lifecycle.is_disposed() {
            if !group.try_acquire_slot() {
                return true;
            }
            if !shared.try_acquire_global() {
                group.release_slot();
                return false;
            }
            match group.dequeue() {
                Some(task) => Shared::spawn_admitted(shared, task, Some(group.clone())),
                None => {
                    group.release_slot();
                    shared.release_global();
                    return true;
                }
            }
        }
        true
    }

    /// Wake every gate: a freed global slot may unblock any group.
    fn signal_capacity(&self) {
        self.gate.set(None);
        for group in self.groups() {
            self.gate.set(Some(group.name()));
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Hands slots back when its task finishes, panics or is dropped.
struct CompletionGuard {
    shared: Arc<Shared>,
    group: Option<WorkGroup>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(group) = &self.group {
            group.release_slot();
        }
        self.shared.release_global();
        Shared::promote(&self.shared, self.group.as_ref());
        self.shared.signal_capacity();
    }
}
