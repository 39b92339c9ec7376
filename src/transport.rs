//! Seams to the collaborators the engine consumes.
//!
//! A transport owns message storage, dequeue, commit and rollback. A handler
//! owns the user code. A heartbeat store owns liveness persistence. The
//! engine only schedules calls into them.

use crate::error::{BoxError, Result};
use crate::model::{ExpiredHeartBeat, MessageId, ReceivedMessage};
use crate::worker::MessageContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Dequeue/commit/rollback for one queue.
#[async_trait]
pub trait MessageTransport: Send + Sync + 'static {
    /// Claim the next message, or `None` if the queue is empty.
    ///
    /// Implementations should return promptly once `cancel` fires.
    async fn receive(&self, cancel: &CancellationToken) -> Result<Option<ReceivedMessage>>;

    /// Remove a successfully processed message.
    async fn commit(&self, message: &ReceivedMessage) -> Result<()>;

    /// Return a message to claimable state.
    async fn rollback(&self, message: &ReceivedMessage) -> Result<()>;

    /// Whether this transport persists heartbeats.
    fn supports_heartbeat(&self) -> bool {
        false
    }
}

/// User code run for each message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        message: &ReceivedMessage,
        context: &MessageContext,
    ) -> std::result::Result<(), BoxError>;
}

/// Back-off applied between empty dequeues.
#[async_trait]
pub trait QueueWait: Send + Sync + 'static {
    /// Called after a message was found; restarts the back-off sequence.
    fn reset(&self);

    /// Sleep for the next back-off step, returning early on cancellation.
    async fn wait(&self, cancel: &CancellationToken);
}

/// Liveness persistence.
#[async_trait]
pub trait HeartBeatStore: Send + Sync + 'static {
    /// Stamp the message as still alive. `Ok(None)` means no claimed record
    /// exists for `id` any more.
    async fn update(&self, id: MessageId) -> Result<Option<DateTime<Utc>>>;

    /// Claimed messages whose last heartbeat is older than `older_than`.
    async fn find_expired(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExpiredHeartBeat>>;

    /// Return an expired message to claimable state. Only succeeds if the
    /// heartbeat is still `expected`, so a message whose worker came back to
    /// life in the meantime is left alone.
    async fn reset(&self, id: MessageId, expected: DateTime<Utc>) -> Result<bool>;
}
