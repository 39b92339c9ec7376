//! Runs one message through the handler and settles it with the transport.

use super::context::{HookKind, MessageContext};
use super::notifications::{SystemError, UserCodeError, WorkerNotifications};
use super::worker::BusyGuard;
use crate::error::BoxError;
use crate::heartbeat::{HeartBeatSupport, HeartBeatWorker};
use crate::model::ReceivedMessage;
use crate::telemetry::{metrics, work};
use crate::transport::{MessageHandler, MessageTransport};
use futures::FutureExt;
use opentelemetry::KeyValue;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info};

// ---------------------------------------------------------------------------
// In-flight tracking
// ---------------------------------------------------------------------------

/// Counts messages between dequeue and commit/rollback, wherever they run.
#[derive(Debug, Default)]
pub(crate) struct ActiveMessages {
    count: AtomicUsize,
    drained: Notify,
}

impl ActiveMessages {
    pub(crate) fn enter(self: &Arc<Self>) -> ActiveGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        ActiveGuard {
            active: Arc::clone(self),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct ActiveGuard {
    active: Arc<ActiveMessages>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.active.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.active.drained.notify_waiters();
        }
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

enum Outcome {
    Handled,
    Failed(BoxError),
    Abandoned,
}

/// A dequeued message and everything that travels with it until it is
/// committed or rolled back, wherever it ends up running.
pub(crate) struct Claim {
    pub(crate) worker_id: usize,
    pub(crate) message: ReceivedMessage,
    /// The owning worker's tokens, so terminating that worker alone also
    /// abandons its message.
    pub(crate) stop: CancellationToken,
    pub(crate) cancel: CancellationToken,
    pub(crate) heartbeat: Option<Arc<HeartBeatWorker>>,
    pub(crate) active: ActiveGuard,
    pub(crate) busy: BusyGuard,
}

pub(crate) struct MessageProcessor {
    pub(crate) transport: Arc<dyn MessageTransport>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) heartbeat: Option<HeartBeatSupport>,
    pub(crate) notifications: WorkerNotifications,
}

impl MessageProcessor {
    /// Handle the claimed message, then commit on success or roll back on
    /// failure or cancellation. The heartbeat is stopped before either, so
    /// the store never sees an update after the message is settled.
    pub(crate) async fn process(&self, claim: Claim) {
        let span = work::start_message_span(claim.worker_id, &claim.message.id);
        self.process_inner(claim, &span)
            .instrument(span.clone())
            .await;
    }

    async fn process_inner(&self, claim: Claim, span: &tracing::Span) {
        let Claim {
            worker_id,
            message,
            stop,
            cancel,
            heartbeat,
            active: _active,
            busy: _busy,
        } = claim;
        let context = MessageContext::new(
            message.id,
            worker_id,
            stop,
            cancel.clone(),
            heartbeat.clone(),
        );

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Abandoned,
            result = AssertUnwindSafe(self.handler.handle(&message, &context)).catch_unwind() => {
                match result {
                    Ok(Ok(())) => Outcome::Handled,
                    Ok(Err(e)) => Outcome::Failed(e),
                    Err(panic) => Outcome::Failed(panic_message(panic).into()),
                }
            }
        };
        metrics::processing_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &[]);

        if let Some(heartbeat) = &heartbeat {
            heartbeat.stop().await;
        }

        let label = match outcome {
            Outcome::Handled => match self.transport.commit(&message).await {
                Ok(()) => {
                    context.run_hooks(HookKind::Commit, &message);
                    "committed"
                }
                Err(e) => {
                    self.notifications.system_exception(SystemError {
                        worker_id: Some(worker_id),
                        message_id: Some(message.id),
                        error: e,
                    });
                    "error"
                }
            },
            Outcome::Failed(error) => {
                self.notifications.user_exception(UserCodeError {
                    worker_id,
                    message_id: message.id,
                    error,
                });
                self.settle_rollback(worker_id, &message, &context).await
            }
            Outcome::Abandoned => {
                info!(message_id = %message.id, "processing cancelled, rolling back");
                self.settle_rollback(worker_id, &message, &context).await
            }
        };

        context.run_cleanup(&message);
        work::record_outcome(span, label);
        metrics::message_outcomes().add(1, &[KeyValue::new("outcome", label)]);
    }

    /// Put back a message the scheduler refused, stopping its heartbeat first.
    pub(crate) async fn reject(
        &self,
        worker_id: usize,
        message: &ReceivedMessage,
        heartbeat: Option<Arc<HeartBeatWorker>>,
    ) {
        debug!(worker_id, message_id = %message.id, "no capacity, returning message");
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }
        let label = match self.transport.rollback(message).await {
            Ok(()) => "rejected",
            Err(e) => {
                self.notifications.system_exception(SystemError {
                    worker_id: Some(worker_id),
                    message_id: Some(message.id),
                    error: e,
                });
                "error"
            }
        };
        metrics::message_outcomes().add(1, &[KeyValue::new("outcome", label)]);
    }

    /// Start keeping `message` alive. Called at dequeue, so a message that
    /// waits in a work group queue is covered too.
    pub(crate) fn start_heartbeat(
        &self,
        worker_id: usize,
        message: &ReceivedMessage,
    ) -> Option<Arc<HeartBeatWorker>> {
        let support = self.heartbeat.as_ref()?;
        if !self.transport.supports_heartbeat() {
            return None;
        }
        match support.start_for(message) {
            Ok(worker) => Some(Arc::new(worker)),
            Err(e) => {
                self.notifications.system_exception(SystemError {
                    worker_id: Some(worker_id),
                    message_id: Some(message.id),
                    error: e,
                });
                None
            }
        }
    }

    async fn settle_rollback(
        &self,
        worker_id: usize,
        message: &ReceivedMessage,
        context: &MessageContext,
    ) -> &'static str {
        match self.transport.rollback(message).await {
            Ok(()) => {
                context.run_hooks(HookKind::Rollback, message);
                "rolled_back"
            }
            Err(e) => {
                self.notifications.system_exception(SystemError {
                    worker_id: Some(worker_id),
                    message_id: Some(message.id),
                    error: e,
                });
                "error"
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
