//! Back-off between empty polls.

use crate::config::QueueWaitConfig;
use crate::transport::QueueWait;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Steps through a fixed list of sleeps, repeating the last one until a
/// message is found.
///
/// Shared by every worker in a collection, so the step counter tracks how
/// long the queue as a whole has been empty.
#[derive(Debug)]
pub struct LinearBackoff {
    steps: Vec<Duration>,
    position: AtomicUsize,
}

impl LinearBackoff {
    pub fn new(config: &QueueWaitConfig) -> Self {
        Self::from_steps(config.backoff.clone())
    }

    pub fn from_steps(steps: Vec<Duration>) -> Self {
        let steps = if steps.is_empty() {
            vec![Duration::from_millis(100)]
        } else {
            steps
        };
        Self {
            steps,
            position: AtomicUsize::new(0),
        }
    }

    /// The sleep the next `wait` will use.
    pub fn current(&self) -> Duration {
        let last = self.steps.len() - 1;
        self.steps[self.position.load(Ordering::Acquire).min(last)]
    }

    fn advance(&self) -> Duration {
        let last = self.steps.len() - 1;
        let position = self
            .position
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some((p + 1).min(last)))
            .unwrap_or(last);
        self.steps[position.min(last)]
    }
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self::new(&QueueWaitConfig::default())
    }
}

#[async_trait]
impl QueueWait for LinearBackoff {
    fn reset(&self) {
        self.position.store(0, Ordering::Release);
    }

    async fn wait(&self, cancel: &CancellationToken) {
        let delay = self.advance();
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
