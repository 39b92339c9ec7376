//! Non-blocking front door to the scheduler.

use super::task_scheduler::TaskScheduler;
use super::work_group::WorkGroup;
use super::{RoomForTask, TryStartResult};
use crate::error::Result;
use std::future::Future;
use std::sync::Arc;

/// Starts work now, queues it, or rejects it. Never waits for capacity.
#[derive(Debug, Clone)]
pub struct TaskFactory {
    scheduler: Arc<TaskScheduler>,
}

impl TaskFactory {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Hand `task` to the scheduler.
    ///
    /// On [`TryStartResult::Rejected`] the future is dropped unpolled; the
    /// caller still owns whatever the work referred to and must put it back.
    pub fn try_start_new<F>(&self, task: F, group: Option<&WorkGroup>) -> Result<TryStartResult>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.scheduler.add_task(task, group)
    }

    pub fn room(&self, group: Option<&WorkGroup>) -> Result<RoomForTask> {
        match group {
            Some(group) => self.scheduler.room_for_new_work_group_task(group),
            None => self.scheduler.room_for_new_task(),
        }
    }
}
