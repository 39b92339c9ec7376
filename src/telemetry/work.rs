//! Message processing span helpers.

use crate::model::MessageId;
use tracing::Span;

/// Start a span covering one message from dispatch to commit/rollback.
///
/// `message.outcome` is declared empty and filled by [`record_outcome`].
pub fn start_message_span(worker_id: usize, message_id: &MessageId) -> Span {
    tracing::info_span!(
        "message.process",
        "worker.id" = worker_id,
        "message.id" = %message_id,
        "message.outcome" = tracing::field::Empty,
    )
}

/// Record how processing ended, as a span field and an event.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("message.outcome", outcome);
    span.in_scope(|| {
        tracing::debug!(outcome = outcome, "message_outcome");
    });
}
