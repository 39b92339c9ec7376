//! Liveness tracking for long-running messages.
//!
//! While a message is processed its [`HeartBeatWorker`] keeps stamping it as
//! alive on the dedicated [`HeartBeatThreadPool`]. If the process dies the
//! stamps stop, and a [`ResetHeartBeat`] scan elsewhere returns the message
//! to the queue.

pub mod pool;
pub mod reset;
pub mod schedule;
pub mod worker;

pub use pool::HeartBeatThreadPool;
pub use reset::{ResetHeartBeat, ResetHeartBeatMonitor};
pub use schedule::HeartBeatSchedule;
pub use worker::HeartBeatWorker;

use crate::config::HeartBeatConfig;
use crate::error::Result;
use crate::model::ReceivedMessage;
use crate::transport::HeartBeatStore;
use std::str::FromStr;
use std::sync::Arc;

/// Creates heartbeat workers for messages as they are dequeued.
#[derive(Clone)]
pub struct HeartBeatSupport {
    store: Arc<dyn HeartBeatStore>,
    schedule: HeartBeatSchedule,
    pool: Arc<HeartBeatThreadPool>,
}

impl HeartBeatSupport {
    pub fn new(
        store: Arc<dyn HeartBeatStore>,
        schedule: HeartBeatSchedule,
        pool: Arc<HeartBeatThreadPool>,
    ) -> Self {
        Self {
            store,
            schedule,
            pool,
        }
    }

    /// Build from configuration, with a pool of its own (not yet started).
    pub fn from_config(store: Arc<dyn HeartBeatStore>, config: &HeartBeatConfig) -> Result<Self> {
        let schedule = HeartBeatSchedule::from_str(&config.schedule)?;
        Ok(Self::new(
            store,
            schedule,
            Arc::new(HeartBeatThreadPool::new(config.threads)),
        ))
    }

    pub fn pool(&self) -> &Arc<HeartBeatThreadPool> {
        &self.pool
    }

    /// Create and start a heartbeat worker for `message`.
    pub fn start_for(&self, message: &ReceivedMessage) -> Result<HeartBeatWorker> {
        let worker = HeartBeatWorker::new(
            message.id,
            message.heartbeat,
            Arc::clone(&self.store),
            self.schedule.clone(),
            Arc::clone(&self.pool),
        );
        worker.start()?;
        Ok(worker)
    }
}
