//! Per-message liveness updates.
//!
//! Each tracked message owns exactly one [`HeartBeatWorker`], so at most one
//! update for a message is ever in flight. Every update runs while holding
//! `update_lock`; [`HeartBeatWorker::stop`] takes the same lock, which is
//! what makes it wait for an in-flight update and forbids any update from
//! starting afterwards.

use super::pool::HeartBeatThreadPool;
use super::schedule::HeartBeatSchedule;
use crate::error::{Error, Result};
use crate::model::{HeartBeatStatus, MessageId};
use crate::telemetry::metrics;
use crate::transport::HeartBeatStore;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const COMPONENT: &str = "heartbeat worker";

pub struct HeartBeatWorker {
    shared: Arc<Shared>,
    pool: Arc<HeartBeatThreadPool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    message_id: MessageId,
    store: Arc<dyn HeartBeatStore>,
    schedule: HeartBeatSchedule,
    status: Mutex<HeartBeatStatus>,
    update_lock: tokio::sync::Mutex<()>,
    stopped: AtomicBool,
    stop: CancellationToken,
    failure: CancellationToken,
    updates: AtomicU64,
    error_count: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl HeartBeatWorker {
    /// `initial` is the heartbeat the transport stamped at dequeue, if any.
    pub fn new(
        message_id: MessageId,
        initial: Option<DateTime<Utc>>,
        store: Arc<dyn HeartBeatStore>,
        schedule: HeartBeatSchedule,
        pool: Arc<HeartBeatThreadPool>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                message_id,
                store,
                schedule,
                status: Mutex::new(HeartBeatStatus::new(message_id, initial)),
                update_lock: tokio::sync::Mutex::new(()),
                stopped: AtomicBool::new(false),
                stop: CancellationToken::new(),
                failure: CancellationToken::new(),
                updates: AtomicU64::new(0),
                error_count: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
            pool,
            task: Mutex::new(None),
        }
    }

    /// Begin recurring updates on the heartbeat pool.
    pub fn start(&self) -> Result<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(Error::Disposed(COMPONENT));
        }
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return Err(Error::AlreadyStarted(COMPONENT));
        }

        let handle = self.pool.handle()?;
        let shared = Arc::clone(&self.shared);
        let pool = Arc::clone(&self.pool);
        pool.worker_started();
        *task = Some(handle.spawn(async move {
            shared.run().await;
            pool.worker_finished();
        }));

        debug!(message_id = %self.shared.message_id, "heartbeat started");
        Ok(())
    }

    /// Stop updating. Returns only after any in-flight update has finished,
    /// and no update starts after this is called. The returned status is the
    /// final one.
    pub async fn stop(&self) -> HeartBeatStatus {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.stop.cancel();

        let _quiesced = self.shared.update_lock.lock().await;
        let status = self.status();
        debug!(
            message_id = %self.shared.message_id,
            last_heartbeat = ?status.last_heartbeat,
            updates = self.update_count(),
            "heartbeat stopped"
        );
        status
    }

    pub fn message_id(&self) -> MessageId {
        self.shared.message_id
    }

    pub fn status(&self) -> HeartBeatStatus {
        *self.shared.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Cancelled when an update fails, so the code processing the message can
    /// give up early.
    pub fn failure_token(&self) -> CancellationToken {
        self.shared.failure.clone()
    }

    pub fn update_count(&self) -> u64 {
        self.shared.updates.load(Ordering::Acquire)
    }

    pub fn error_count(&self) -> u64 {
        self.shared.error_count.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Drop for HeartBeatWorker {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.stop.cancel();
    }
}

impl Shared {
    async fn run(&self) {
        loop {
            let Some(delay) = self.schedule.next_delay(Utc::now()) else {
                debug!(message_id = %self.message_id, "heartbeat schedule exhausted");
                return;
            };

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let _updating = self.update_lock.lock().await;
            if self.stopped.load(Ordering::Acquire) {
                return;
            }

            match self.store.update(self.message_id).await {
                Ok(last_heartbeat) => {
                    self.updates.fetch_add(1, Ordering::AcqRel);
                    *self.status.lock().unwrap_or_else(|e| e.into_inner()) =
                        HeartBeatStatus::new(self.message_id, last_heartbeat);
                    let result = if last_heartbeat.is_some() {
                        "ok"
                    } else {
                        debug!(message_id = %self.message_id, "heartbeat found no claimed record");
                        "missing"
                    };
                    metrics::heartbeat_updates().add(1, &[KeyValue::new("result", result)]);
                }
                Err(e) => {
                    let errors = self.error_count.fetch_add(1, Ordering::AcqRel) + 1;
                    warn!(
                        message_id = %self.message_id,
                        errors,
                        error = %e,
                        "heartbeat update failed, freezing last value"
                    );
                    *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(e.to_string());
                    metrics::heartbeat_updates().add(1, &[KeyValue::new("result", "error")]);

                    self.stopped.store(true, Ordering::Release);
                    self.stop.cancel();
                    self.failure.cancel();
                    return;
                }
            }
        }
    }
}
