//! A fixed set of worker loops over one transport.
//!
//! Stopping is staged. First every loop is asked to stop and in-flight
//! messages get `stop_timeout` to finish. Then in-flight work is cancelled
//! (and rolled back) with `cancel_timeout` to wind down. Anything still
//! running after that is aborted only if the configuration allows it.

use super::notifications::WorkerNotifications;
use super::poller::SinglePoller;
use super::processor::{ActiveMessages, MessageProcessor};
use super::wait::LinearBackoff;
use super::worker::{Dispatch, IdleStatus, LoopContext, Worker};
use crate::config::{QueueWaitConfig, WorkerConfig};
use crate::error::{Error, Result};
use crate::heartbeat::HeartBeatSupport;
use crate::lifecycle::Lifecycle;
use crate::pool::DedicatedPool;
use crate::scheduler::{TaskFactory, WorkGroup};
use crate::transport::{MessageHandler, MessageTransport, QueueWait};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const COMPONENT: &str = "worker collection";

pub struct WorkerCollection {
    config: WorkerConfig,
    transport: Arc<dyn MessageTransport>,
    handler: Arc<dyn MessageHandler>,
    factory: Option<(TaskFactory, Option<WorkGroup>)>,
    heartbeat: Option<HeartBeatSupport>,
    queue_wait: Arc<dyn QueueWait>,
    notifications: WorkerNotifications,
    lifecycle: Lifecycle,
    paused: watch::Sender<bool>,
    stop: CancellationToken,
    cancel: CancellationToken,
    active: Arc<ActiveMessages>,
    running: Mutex<Option<Running>>,
}

struct Running {
    pool: DedicatedPool,
    workers: Vec<Arc<Worker>>,
    subscription: Option<Uuid>,
    owns_heartbeat_pool: bool,
}

impl WorkerCollection {
    pub fn new(
        config: WorkerConfig,
        transport: Arc<dyn MessageTransport>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            config,
            transport,
            handler,
            factory: None,
            heartbeat: None,
            queue_wait: Arc::new(LinearBackoff::new(&QueueWaitConfig::default())),
            notifications: WorkerNotifications::default(),
            lifecycle: Lifecycle::new(COMPONENT),
            paused,
            stop: CancellationToken::new(),
            cancel: CancellationToken::new(),
            active: Arc::new(ActiveMessages::default()),
            running: Mutex::new(None),
        }
    }

    /// Process messages on the scheduler behind `factory` instead of inline.
    /// With a `group`, work is admitted against that group's limits.
    pub fn with_task_factory(mut self, factory: TaskFactory, group: Option<WorkGroup>) -> Self {
        self.factory = Some((factory, group));
        self
    }

    /// Keep a heartbeat going for every message while it is processed.
    /// Ignored if the transport does not persist heartbeats.
    pub fn with_heartbeat(mut self, heartbeat: HeartBeatSupport) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_queue_wait(mut self, queue_wait: Arc<dyn QueueWait>) -> Self {
        self.queue_wait = queue_wait;
        self
    }

    pub fn with_notifications(mut self, notifications: WorkerNotifications) -> Self {
        self.notifications = notifications;
        self
    }

    // -----------------------------------------------------------------------
    // Start / stop
    // -----------------------------------------------------------------------

    /// Spawn the worker loops. A collection runs at most once.
    pub fn start(&self) -> Result<()> {
        self.lifecycle.ensure_active()?;
        self.config.validate()?;

        let mut running = self.lock_running();
        if running.is_some() || self.stop.is_cancelled() {
            return Err(Error::AlreadyStarted(COMPONENT));
        }

        if let Some((factory, _)) = &self.factory {
            if !factory.scheduler().started() {
                return Err(Error::NotStarted("task scheduler"));
            }
        }

        let heartbeat = self
            .heartbeat
            .clone()
            .filter(|_| self.transport.supports_heartbeat());
        let mut owns_heartbeat_pool = false;
        if let Some(support) = &heartbeat {
            if !support.pool().started() {
                support.pool().start()?;
                owns_heartbeat_pool = true;
            }
        }

        let pool = DedicatedPool::new("workq-worker", self.config.worker_count)?;
        let subscription = match &self.factory {
            Some((factory, _)) => Some(factory.scheduler().subscribe()?),
            None => None,
        };

        let processor = Arc::new(MessageProcessor {
            transport: Arc::clone(&self.transport),
            handler: Arc::clone(&self.handler),
            heartbeat,
            notifications: self.notifications.clone(),
        });
        let dispatch = match &self.factory {
            Some((factory, group)) => Dispatch::Scheduled {
                factory: factory.clone(),
                group: group.clone(),
            },
            None => Dispatch::Inline,
        };
        let context = Arc::new(LoopContext {
            transport: Arc::clone(&self.transport),
            processor,
            dispatch,
            queue_wait: Arc::clone(&self.queue_wait),
            poller: self.config.single_poller_when_idle.then(SinglePoller::new),
            paused: self.paused.subscribe(),
            gate_wait: self.config.gate_wait,
            active: Arc::clone(&self.active),
            notifications: self.notifications.clone(),
        });

        let workers: Vec<Arc<Worker>> = (0..self.config.worker_count)
            .map(|id| Arc::new(Worker::new(id, &self.stop, &self.cancel)))
            .collect();
        for worker in &workers {
            worker.start(pool.handle(), Arc::clone(&context));
        }

        info!(
            workers = self.config.worker_count,
            scheduled = self.factory.is_some(),
            single_poller = self.config.single_poller_when_idle,
            "worker collection started"
        );
        *running = Some(Running {
            pool,
            workers,
            subscription,
            owns_heartbeat_pool,
        });
        Ok(())
    }

    /// Stop every loop, giving in-flight messages the configured grace
    /// windows. Returns true if everything wound down without an abort.
    pub async fn stop(&self) -> bool {
        let workers = match self.lock_running().as_ref() {
            Some(running) => running.workers.clone(),
            None => return true,
        };

        info!(in_flight = self.active.count(), "stopping workers");
        self.stop.cancel();

        if self.wound_down(&workers, self.config.stop_timeout).await {
            info!("workers stopped");
            return true;
        }

        warn!(
            in_flight = self.active.count(),
            timeout_ms = self.config.stop_timeout.as_millis() as u64,
            "workers did not stop in time, cancelling in-flight messages"
        );
        self.cancel.cancel();
        if self.wound_down(&workers, self.config.cancel_timeout).await {
            info!("workers stopped after cancellation");
            return true;
        }

        let stuck = workers.iter().filter(|w| w.running()).count();
        if self.config.abort_workers_on_stop_timeout {
            warn!(stuck, "aborting workers that ignored cancellation");
            for worker in &workers {
                worker.abort();
            }
        } else {
            warn!(
                stuck,
                in_flight = self.active.count(),
                "workers still running after cancellation; leaving them"
            );
        }
        false
    }

    async fn wound_down(&self, workers: &[Arc<Worker>], timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            for worker in workers {
                worker.exited().await;
            }
            self.active.wait_drained().await;
        })
        .await
        .is_ok()
    }

    /// Stop (if running) and release the worker pool.
    pub async fn dispose(&self) {
        if !self.lifecycle.begin_dispose() {
            return;
        }
        self.stop().await;

        let running = self.lock_running().take();
        if let Some(running) = running {
            if let (Some(id), Some((factory, _))) = (running.subscription, &self.factory) {
                if let Err(e) = factory.scheduler().unsubscribe(id) {
                    debug!(error = %e, "scheduler gone before unsubscribe");
                }
            }
            if running.owns_heartbeat_pool {
                if let Some(support) = &self.heartbeat {
                    support.pool().dispose();
                }
            }
            running.pool.shutdown();
        }
        self.lifecycle.finish_dispose();
        info!("worker collection disposed");
    }

    // -----------------------------------------------------------------------
    // Pause / status
    // -----------------------------------------------------------------------

    /// Stop dequeuing. Messages already in flight are unaffected.
    pub fn pause_workers(&self) -> Result<()> {
        self.lifecycle.ensure_active()?;
        self.paused.send_replace(true);
        info!("workers paused");
        Ok(())
    }

    pub fn resume_workers(&self) -> Result<()> {
        self.lifecycle.ensure_active()?;
        self.paused.send_replace(false);
        info!("workers resumed");
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// True once started and every worker last reported idle.
    pub fn all_workers_are_idle(&self) -> bool {
        match self.lock_running().as_ref() {
            Some(running) => running
                .workers
                .iter()
                .all(|w| w.idle_status() == IdleStatus::Idle),
            None => false,
        }
    }

    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.lock_running()
            .as_ref()
            .map(|r| r.workers.clone())
            .unwrap_or_default()
    }

    pub fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    pub fn running_workers(&self) -> usize {
        self.lock_running()
            .as_ref()
            .map(|r| r.workers.iter().filter(|w| w.running()).count())
            .unwrap_or(0)
    }

    /// Messages dequeued and not yet committed or rolled back.
    pub fn in_flight(&self) -> usize {
        self.active.count()
    }

    pub fn is_disposed(&self) -> bool {
        self.lifecycle.is_disposed()
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for WorkerCollection {
    fn drop(&mut self) {
        self.stop.cancel();
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for WorkerCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCollection")
            .field("worker_count", &self.config.worker_count)
            .field("scheduled", &self.factory.is_some())
            .field("in_flight", &self.active.count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
