//! Forwarder queues.
//!
//! Every forwarder topic owns one queue (`forwarder#<forwarder-id>/<topic>`).
//! Local publishes are appended to it and the dispatch engine reads batches
//! out of it. Reading marks each returned message *inflight* so a later read
//! skips it until the message is either settled (delivery record removed) or
//! its marker is reset for redelivery. This gives at-least-once delivery for
//! QoS 1/2; QoS 0 messages are dropped from the queue as soon as they are read.
//!
//! Uses a trait-based design so the engine does not care where messages live:
//! - `MemoryQueue` - process-local storage
//! - disk-backed stores implement [`QueueStore`] the same way

mod error;
mod memory;

pub use error::{QueueError, Result};
pub use memory::MemoryQueue;

use async_trait::async_trait;

use crate::message::QueuedMessage;

/// Storage contract the forwarding engine consumes
#[async_trait]
pub trait QueueStore: Send + Sync {
    // ========================================================================
    // Producer side
    // ========================================================================

    /// Append a message to a queue
    ///
    /// Returns `false` when the queue already holds `limit` messages and the
    /// new message was discarded.
    async fn append(&self, queue_id: &str, message: QueuedMessage, limit: Option<usize>)
        -> Result<bool>;

    // ========================================================================
    // Consumer side
    // ========================================================================

    /// Read up to `max_messages` deliverable messages in queue order
    ///
    /// The batch stops before exceeding `max_bytes`, except that a non-empty
    /// queue always yields at least one message. Returned QoS 1/2 messages
    /// are marked inflight.
    async fn read(
        &self,
        queue_id: &str,
        max_messages: usize,
        max_bytes: usize,
    ) -> Result<Vec<QueuedMessage>>;

    /// Settle a delivered QoS 1/2 message so it is never redelivered
    async fn remove_delivery_record(&self, queue_id: &str, message_id: &str) -> Result<()>;

    /// Make one inflight message deliverable again
    async fn clear_inflight_marker(&self, queue_id: &str, message_id: &str) -> Result<()>;

    /// Make every inflight message of a queue deliverable again
    async fn clear_all_inflight_markers(&self, queue_id: &str) -> Result<()>;

    /// Discard a queue's messages
    ///
    /// With `purge` every message goes, inflight ones included. Without it,
    /// inflight messages are kept so their pending outcome can still settle them.
    async fn clear(&self, queue_id: &str, purge: bool) -> Result<()>;
}
