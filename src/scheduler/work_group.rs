//! Work groups: named partitions of admission control.
//!
//! A group's counters are only touched through compare-and-swap so admission
//! decisions never take a lock. The bounded queue is the one structure behind
//! a mutex, held just long enough to push or pop.

use super::{RoomForTask, ScheduledTask};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Handle to a registered work group. Cheap to clone.
#[derive(Clone)]
pub struct WorkGroup {
    pub(crate) inner: Arc<WorkGroupState>,
}

pub(crate) struct WorkGroupState {
    pub(crate) owner: Uuid,
    name: String,
    concurrency_level: usize,
    max_queue_size: usize,
    active: AtomicUsize,
    queued: AtomicUsize,
    queue: Mutex<VecDeque<ScheduledTask>>,
}

impl WorkGroup {
    pub(crate) fn new(
        owner: Uuid,
        name: String,
        concurrency_level: usize,
        max_queue_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(WorkGroupState {
                owner,
                name,
                concurrency_level,
                max_queue_size,
                active: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                queue: Mutex::new(VecDeque::with_capacity(max_queue_size)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn concurrency_level(&self) -> usize {
        self.inner.concurrency_level
    }

    /// Zero means the group never queues: saturation rejects.
    pub fn max_queue_size(&self) -> usize {
        self.inner.max_queue_size
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn queued_count(&self) -> usize {
        self.inner.queued.load(Ordering::Acquire)
    }

    /// `global_room` is whether the scheduler still has a free global slot.
    pub(crate) fn room(&self, global_room: bool) -> RoomForTask {
        if global_room && self.active_count() < self.inner.concurrency_level {
            RoomForTask::RoomForTask
        } else if self.queued_count() < self.inner.max_queue_size {
            RoomForTask::RoomInQueue
        } else {
            RoomForTask::No
        }
    }

    pub(crate) fn try_acquire_slot(&self) -> bool {
        let limit = self.inner.concurrency_level;
        self.inner
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    pub(crate) fn release_slot(&self) {
        let released = self
            .inner
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        debug_assert!(released, "work group slot released twice");
    }

    /// Reserve a queue position, then push. The reservation keeps
    /// `queued <= max_queue_size` without holding the lock during the check.
    pub(crate) fn try_enqueue(&self, task: ScheduledTask) -> Result<(), ScheduledTask> {
        let limit = self.inner.max_queue_size;
        let reserved = self
            .inner
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            return Err(task);
        }

        self.inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(task);
        Ok(())
    }

    /// Pop the oldest queued task, if any.
    pub(crate) fn dequeue(&self) -> Option<ScheduledTask> {
        let task = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if task.is_some() {
            self.inner.queued.fetch_sub(1, Ordering::AcqRel);
        }
        task
    }

    /// Drop every queued task without running it.
    pub(crate) fn clear(&self) -> usize {
        let drained: Vec<ScheduledTask> = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        self.inner.queued.fetch_sub(drained.len(), Ordering::AcqRel);
        drained.len()
    }
}

impl std::fmt::Debug for WorkGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGroup")
            .field("name", &self.inner.name)
            .field("concurrency_level", &self.inner.concurrency_level)
            .field("max_queue_size", &self.inner.max_queue_size)
            .field("active", &self.active_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}
