//! Recovery of messages whose worker stopped heartbeating.

use super::schedule::HeartBeatSchedule;
use crate::config::HeartBeatConfig;
use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::model::ResetHeartBeatOutput;
use crate::telemetry::metrics;
use crate::transport::HeartBeatStore;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COMPONENT: &str = "heartbeat reset";

/// Finds messages whose last heartbeat is older than the liveness window
/// and returns them to claimable state.
pub struct ResetHeartBeat {
    store: Arc<dyn HeartBeatStore>,
    config: HeartBeatConfig,
    lifecycle: Lifecycle,
}

impl ResetHeartBeat {
    pub fn new(store: Arc<dyn HeartBeatStore>, config: HeartBeatConfig) -> Self {
        Self {
            store,
            config,
            lifecycle: Lifecycle::new(COMPONENT),
        }
    }

    /// Run one scan.
    ///
    /// Each output carries a window rather than an instant: the reset happened
    /// somewhere between the scan starting and the store acknowledging it.
    /// Stops early, returning what was reset so far, when `cancel` fires.
    pub async fn reset(&self, cancel: &CancellationToken) -> Result<Vec<ResetHeartBeatOutput>> {
        self.lifecycle.ensure_active()?;
        if !self.config.enabled {
            return Ok(Vec::new());
        }

        let scan_start = Utc::now();
        let window = chrono::Duration::from_std(self.config.window)
            .map_err(|e| Error::Config(format!("heartbeat window out of range: {e}")))?;
        let older_than = scan_start - window;

        let expired = self
            .store
            .find_expired(older_than, self.config.reset_limit)
            .await?;
        if expired.is_empty() {
            return Ok(Vec::new());
        }
        debug!(candidates = expired.len(), %older_than, "heartbeat reset scan");

        let mut output = Vec::with_capacity(expired.len());
        for candidate in expired {
            if cancel.is_cancelled() {
                debug!(reset = output.len(), "heartbeat reset scan cancelled");
                break;
            }
            match self
                .store
                .reset(candidate.message_id, candidate.last_heartbeat)
                .await
            {
                Ok(true) => {
                    info!(
                        message_id = %candidate.message_id,
                        last_heartbeat = %candidate.last_heartbeat,
                        "message reset after heartbeat lapsed"
                    );
                    output.push(ResetHeartBeatOutput {
                        message_id: candidate.message_id,
                        headers: candidate.headers,
                        approximate_reset_start: scan_start,
                        approximate_reset_end: Utc::now(),
                    });
                }
                // Heartbeat moved on since the scan: the worker is alive after all.
                Ok(false) => {
                    debug!(message_id = %candidate.message_id, "heartbeat refreshed, reset skipped")
                }
                Err(e) => {
                    warn!(message_id = %candidate.message_id, error = %e, "heartbeat reset failed")
                }
            }
        }

        metrics::heartbeat_resets().add(output.len() as u64, &[]);
        Ok(output)
    }

    pub fn dispose(&self) {
        if self.lifecycle.begin_dispose() {
            self.lifecycle.finish_dispose();
        }
    }
}

/// Callback receiving every non-empty scan result.
pub type ResetCallback = Arc<dyn Fn(&[ResetHeartBeatOutput]) + Send + Sync>;

/// Runs [`ResetHeartBeat::reset`] on a schedule.
///
/// For hosts without their own housekeeping scheduler. Runs on whatever
/// runtime `spawn` is called from, outside the engine's pools.
pub struct ResetHeartBeatMonitor {
    reset: Arc<ResetHeartBeat>,
    schedule: HeartBeatSchedule,
    on_reset: Option<ResetCallback>,
}

impl ResetHeartBeatMonitor {
    pub fn new(reset: Arc<ResetHeartBeat>, schedule: HeartBeatSchedule) -> Self {
        Self {
            reset,
            schedule,
            on_reset: None,
        }
    }

    pub fn on_reset(
        mut self,
        callback: impl Fn(&[ResetHeartBeatOutput]) + Send + Sync + 'static,
    ) -> Self {
        self.on_reset = Some(Arc::new(callback));
        self
    }

    /// Scan until `cancel` fires or the reset scanner is disposed.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("heartbeat reset monitor started");
            loop {
                let Some(delay) = self.schedule.next_delay(Utc::now()) else {
                    break;
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                match self.reset.reset(&cancel).await {
                    Ok(output) if !output.is_empty() => {
                        if let Some(callback) = &self.on_reset {
                            callback(&output);
                        }
                    }
                    Ok(_) => {}
                    Err(Error::Disposed(_)) => break,
                    Err(e) => error!(error = %e, "heartbeat reset scan failed"),
                }
            }
            info!("heartbeat reset monitor stopped");
        })
    }
}
