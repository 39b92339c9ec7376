//! Admission control: the task scheduler, its work groups, the backpressure
//! gate workers wait on, and the non-blocking task factory in front of it.

pub mod gate;
pub mod task_factory;
pub mod task_scheduler;
pub mod work_group;

pub use gate::{BackpressureGate, GateWake};
pub use task_factory::TaskFactory;
pub use task_scheduler::TaskScheduler;
pub use work_group::WorkGroup;

use futures::future::BoxFuture;

/// A unit of work owned by the scheduler from admission to completion.
pub(crate) type ScheduledTask = BoxFuture<'static, ()>;

/// Answer to "could new work start right now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomForTask {
    /// A slot is free; the work would start immediately.
    RoomForTask,
    /// The group is saturated but its queue has space.
    RoomInQueue,
    /// Saturated and no queue space.
    No,
}

impl RoomForTask {
    pub fn has_room(self) -> bool {
        self != RoomForTask::No
    }
}

/// What happened to work handed to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryStartResult {
    /// Started immediately.
    Added,
    /// Parked in the group's queue; runs when a slot frees.
    Queued,
    /// No capacity. The work was dropped without running.
    Rejected,
}

impl TryStartResult {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            TryStartResult::Added => "added",
            TryStartResult::Queued => "queued",
            TryStartResult::Rejected => "rejected",
        }
    }
}
