//! In-memory queue store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::error::Result;
use super::QueueStore;
use crate::message::{QoS, QueuedMessage};

#[derive(Debug)]
struct Entry {
    message: QueuedMessage,
    inflight: bool,
}

/// Process-local [`QueueStore`]
///
/// Messages survive for the lifetime of the store only.
#[derive(Default)]
pub struct MemoryQueue {
    queues: DashMap<String, VecDeque<Entry>>,
    discarded: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages held by a queue, inflight ones included
    pub fn len(&self, queue_id: &str) -> usize {
        self.queues.get(queue_id).map_or(0, |q| q.len())
    }

    /// Number of messages currently marked inflight
    pub fn inflight_len(&self, queue_id: &str) -> usize {
        self.queues
            .get(queue_id)
            .map_or(0, |q| q.iter().filter(|e| e.inflight).count())
    }

    /// Whether the store knows the queue at all
    pub fn contains_queue(&self, queue_id: &str) -> bool {
        self.queues.contains_key(queue_id)
    }

    /// Messages discarded by append limits since creation
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl QueueStore for MemoryQueue {
    async fn append(
        &self,
        queue_id: &str,
        message: QueuedMessage,
        limit: Option<usize>,
    ) -> Result<bool> {
        let mut queue = self.queues.entry(queue_id.to_string()).or_default();
        if limit.is_some_and(|limit| queue.len() >= limit) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Queue '{}': full, discarding message {}",
                queue_id, message.id
            );
            return Ok(false);
        }

        queue.push_back(Entry {
            message,
            inflight: false,
        });
        Ok(true)
    }

    async fn read(
        &self,
        queue_id: &str,
        max_messages: usize,
        max_bytes: usize,
    ) -> Result<Vec<QueuedMessage>> {
        let Some(mut queue) = self.queues.get_mut(queue_id) else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::new();
        let mut bytes = 0;
        let mut index = 0;

        while index < queue.len() && batch.len() < max_messages {
            let entry = &mut queue[index];
            if entry.inflight {
                index += 1;
                continue;
            }

            let size = entry.message.size();
            if !batch.is_empty() && bytes + size > max_bytes {
                break;
            }
            bytes += size;

            if entry.message.qos == QoS::AtMostOnce {
                // Nothing acknowledges QoS 0, so reading settles it
                if let Some(entry) = queue.remove(index) {
                    batch.push(entry.message);
                }
            } else {
                entry.inflight = true;
                batch.push(entry.message.clone());
                index += 1;
            }
        }

        trace!("Queue '{}': read {} messages", queue_id, batch.len());
        Ok(batch)
    }

    async fn remove_delivery_record(&self, queue_id: &str, message_id: &str) -> Result<()> {
        if let Some(mut queue) = self.queues.get_mut(queue_id) {
            if let Some(pos) = queue.iter().position(|e| e.message.id == message_id) {
                queue.remove(pos);
            }
        }
        Ok(())
    }

    async fn clear_inflight_marker(&self, queue_id: &str, message_id: &str) -> Result<()> {
        if let Some(mut queue) = self.queues.get_mut(queue_id) {
            if let Some(entry) = queue.iter_mut().find(|e| e.message.id == message_id) {
                entry.inflight = false;
            }
        }
        Ok(())
    }

    async fn clear_all_inflight_markers(&self, queue_id: &str) -> Result<()> {
        if let Some(mut queue) = self.queues.get_mut(queue_id) {
            queue.iter_mut().for_each(|e| e.inflight = false);
        }
        Ok(())
    }

    async fn clear(&self, queue_id: &str, purge: bool) -> Result<()> {
        if purge {
            self.queues.remove(queue_id);
        } else if let Some(mut queue) = self.queues.get_mut(queue_id) {
            queue.retain(|e| e.inflight);
        }
        debug!("Queue '{}': cleared (purge={})", queue_id, purge);
        Ok(())
    }
}
