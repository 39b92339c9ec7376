//! One polling loop.
//!
//! A worker repeatedly waits for capacity, dequeues, and either processes the
//! message inline or hands it to the task scheduler. It never exits on a
//! plumbing failure; those are reported and the loop carries on.

use super::notifications::{SystemError, WorkerNotifications};
use super::poller::SinglePoller;
use super::processor::{ActiveMessages, Claim, MessageProcessor};
use crate::error::Error;
use crate::heartbeat::HeartBeatWorker;
use crate::model::ReceivedMessage;
use crate::scheduler::{GateWake, TaskFactory, TryStartResult, WorkGroup};
use crate::telemetry::metrics;
use crate::transport::{MessageTransport, QueueWait};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Last idle state a worker reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStatus {
    Unknown,
    Idle,
    NotIdle,
}

impl IdleStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Idle,
            2 => Self::NotIdle,
            _ => Self::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Idle => 1,
            Self::NotIdle => 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared loop state
// ---------------------------------------------------------------------------

/// Where a dequeued message goes.
pub(crate) enum Dispatch {
    Inline,
    Scheduled {
        factory: TaskFactory,
        group: Option<WorkGroup>,
    },
}

/// Everything the loops of one collection share.
pub(crate) struct LoopContext {
    pub(crate) transport: Arc<dyn MessageTransport>,
    pub(crate) processor: Arc<MessageProcessor>,
    pub(crate) dispatch: Dispatch,
    pub(crate) queue_wait: Arc<dyn QueueWait>,
    pub(crate) poller: Option<SinglePoller>,
    pub(crate) paused: watch::Receiver<bool>,
    pub(crate) gate_wait: Duration,
    pub(crate) active: Arc<ActiveMessages>,
    pub(crate) notifications: WorkerNotifications,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct Worker {
    id: usize,
    started: AtomicBool,
    idle: AtomicU8,
    stop: CancellationToken,
    cancel: CancellationToken,
    exited: CancellationToken,
    /// Messages this worker dequeued that are not settled yet.
    outstanding: Mutex<usize>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// `stop` and `cancel` are the collection's tokens; the worker listens on
    /// children of them so it can also be terminated on its own.
    pub(crate) fn new(id: usize, stop: &CancellationToken, cancel: &CancellationToken) -> Self {
        Self {
            id,
            started: AtomicBool::new(false),
            idle: AtomicU8::new(IdleStatus::Unknown.as_u8()),
            stop: stop.child_token(),
            cancel: cancel.child_token(),
            exited: CancellationToken::new(),
            outstanding: Mutex::new(0),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether the loop has been started and has not exited.
    pub fn running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.exited.is_cancelled()
    }

    pub fn idle_status(&self) -> IdleStatus {
        IdleStatus::from_u8(self.idle.load(Ordering::Acquire))
    }

    /// Spawn the loop on `handle`. The worker reports idle before its first
    /// poll, so a freshly started collection counts as idle.
    pub(crate) fn start(self: &Arc<Self>, handle: &Handle, context: Arc<LoopContext>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.idle.store(IdleStatus::Idle.as_u8(), Ordering::Release);

        let worker = Arc::clone(self);
        let task = handle.spawn(async move {
            let _exited = worker.exited.clone().drop_guard();
            worker.run(&context).await;
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    /// Ask the loop to stop and cancel what it is processing, then wait for
    /// it to exit.
    pub async fn try_force_terminate(&self) {
        self.stop.cancel();
        self.cancel.cancel();
        if self.started.load(Ordering::Acquire) {
            self.exited.cancelled().await;
        }
    }

    /// Signal the loop to stop without waiting. Returns true if it has
    /// already exited.
    pub fn attempt_to_terminate(&self) -> bool {
        self.stop.cancel();
        self.cancel.cancel();
        !self.running()
    }

    pub(crate) async fn exited(&self) {
        if self.started.load(Ordering::Acquire) {
            self.exited.cancelled().await;
        }
    }

    /// Kill the loop outright. The message it holds, if any, is left claimed.
    pub(crate) fn abort(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            task.abort();
        }
    }

    fn set_idle_status(&self, status: IdleStatus, notifications: &WorkerNotifications) {
        let previous = self.idle.swap(status.as_u8(), Ordering::AcqRel);
        if previous == status.as_u8() {
            return;
        }
        match status {
            IdleStatus::Idle => notifications.idle(self.id),
            IdleStatus::NotIdle => notifications.not_idle(self.id),
            IdleStatus::Unknown => {}
        }
    }

    /// Mark one more message as owned by this worker. The worker stays
    /// `NotIdle` until every guard handed out here is dropped, which for
    /// scheduled dispatch is when the message settles on the scheduler pool.
    fn busy(self: &Arc<Self>, notifications: &WorkerNotifications) -> BusyGuard {
        let mut outstanding = self.lock_outstanding();
        *outstanding += 1;
        if *outstanding == 1 {
            self.set_idle_status(IdleStatus::NotIdle, notifications);
        }
        BusyGuard {
            worker: Arc::clone(self),
            notifications: notifications.clone(),
        }
    }

    fn settled(&self, notifications: &WorkerNotifications) {
        let mut outstanding = self.lock_outstanding();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.set_idle_status(IdleStatus::Idle, notifications);
        }
    }

    fn lock_outstanding(&self) -> std::sync::MutexGuard<'_, usize> {
        self.outstanding.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim(
        self: &Arc<Self>,
        ctx: &LoopContext,
        message: ReceivedMessage,
        heartbeat: Option<Arc<HeartBeatWorker>>,
    ) -> Claim {
        Claim {
            worker_id: self.id,
            message,
            stop: self.stop.clone(),
            cancel: self.cancel.clone(),
            heartbeat,
            active: ctx.active.enter(),
            busy: self.busy(&ctx.notifications),
        }
    }

    fn report(&self, notifications: &WorkerNotifications, error: Error) {
        notifications.system_exception(SystemError {
            worker_id: Some(self.id),
            message_id: None,
            error,
        });
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    async fn run(self: &Arc<Self>, ctx: &LoopContext) {
        info!(worker_id = self.id, "worker started");
        let mut polling = false;

        while !self.stop.is_cancelled() {
            if *ctx.paused.borrow() {
                let mut paused = ctx.paused.clone();
                tokio::select! {
                    _ = self.stop.cancelled() => break,
                    _ = async { paused.wait_for(|p| !*p).await.is_ok() } => {}
                }
                continue;
            }

            if let Dispatch::Scheduled { factory, group } = &ctx.dispatch {
                match self.wait_for_room(factory, group.as_ref(), ctx.gate_wait).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        self.report(&ctx.notifications, e);
                        ctx.queue_wait.wait(&self.stop).await;
                        continue;
                    }
                }
            }

            let received = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                received = ctx.transport.receive(&self.stop) => received,
            };

            match received {
                Ok(Some(message)) => {
                    ctx.queue_wait.reset();
                    if polling {
                        polling = false;
                        if let Some(poller) = &ctx.poller {
                            poller.release();
                        }
                    }
                    metrics::messages_received().add(1, &[]);
                    self.dispatch(ctx, message).await;
                }
                Ok(None) => match &ctx.poller {
                    Some(poller) => {
                        let mut wake = poller.subscribe();
                        if polling || poller.try_claim() {
                            polling = true;
                            ctx.queue_wait.wait(&self.stop).await;
                        } else {
                            debug!(worker_id = self.id, "queue empty, parking behind poller");
                            tokio::select! {
                                _ = self.stop.cancelled() => {}
                                _ = wake.changed() => {}
                            }
                        }
                    }
                    None => ctx.queue_wait.wait(&self.stop).await,
                },
                Err(e) => {
                    self.report(&ctx.notifications, e);
                    ctx.queue_wait.wait(&self.stop).await;
                }
            }
        }

        if polling {
            if let Some(poller) = &ctx.poller {
                poller.release();
            }
        }
        info!(worker_id = self.id, "worker stopped");
    }

    /// True when the scheduler has room. Otherwise waits on the gate for at
    /// most `gate_wait` and returns false so the caller re-checks.
    async fn wait_for_room(
        &self,
        factory: &TaskFactory,
        group: Option<&WorkGroup>,
        gate_wait: Duration,
    ) -> crate::error::Result<bool> {
        if factory.room(group)?.has_room() {
            return Ok(true);
        }

        let gate = factory.scheduler().gate();
        let name = group.map(WorkGroup::name);
        gate.reset(name);
        // A task may have finished between the check and the reset.
        if factory.room(group)?.has_room() {
            return Ok(true);
        }

        tokio::select! {
            _ = self.stop.cancelled() => {}
            wake = gate.wait_timeout(name, gate_wait) => {
                if wake == Some(GateWake::Cancelled) {
                    return Err(Error::Disposed("task scheduler"));
                }
            }
        }
        Ok(false)
    }

    async fn dispatch(self: &Arc<Self>, ctx: &LoopContext, message: ReceivedMessage) {
        let heartbeat = ctx.processor.start_heartbeat(self.id, &message);
        match &ctx.dispatch {
            Dispatch::Inline => {
                let claim = self.claim(ctx, message, heartbeat);
                ctx.processor.process(claim).await;
            }
            Dispatch::Scheduled { factory, group } => {
                // Counts the message until it is handed off or put back.
                let _handoff = (ctx.active.enter(), self.busy(&ctx.notifications));

                let processor = Arc::clone(&ctx.processor);
                let claim = self.claim(ctx, message.clone(), heartbeat.clone());
                let task = async move { processor.process(claim).await };

                let result = factory.try_start_new(task, group.as_ref());
                let label = match &result {
                    Ok(r) => r.as_str(),
                    Err(_) => "error",
                };
                debug!(worker_id = self.id, message_id = %message.id, result = label, "dispatched");

                match result {
                    Ok(TryStartResult::Added | TryStartResult::Queued) => {}
                    Ok(TryStartResult::Rejected) => {
                        ctx.processor.reject(self.id, &message, heartbeat).await;
                    }
                    Err(e) => {
                        self.report(&ctx.notifications, e);
                        ctx.processor.reject(self.id, &message, heartbeat).await;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("running", &self.running())
            .field("idle", &self.idle_status())
            .finish()
    }
}

/// Returns its worker to `Idle` once the last outstanding message settles.
pub(crate) struct BusyGuard {
    worker: Arc<Worker>,
    notifications: WorkerNotifications,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.worker.settled(&self.notifications);
    }
}
