//! Dispatch Engine
//!
//! [`MessageForwarder`] owns the forwarder to queue mapping and drives the
//! polling protocol that pulls messages out of the queue store into forwarders.
//!
//! Each forwarder topic is registered in the topic matcher as a member of the
//! shared group `forwarder#<id>`, so a local publish lands in exactly one
//! queue per forwarder. A set of *candidate* queues (believed non-empty) is
//! filled by producers and completions and drained by poll passes; polling
//! never scans queues that are known to be empty.

mod poll;

#[cfg(test)]
mod tests;

pub use poll::PollCycle;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures_util::future::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::ForwardingConfig;
use crate::forwarder::{
    self, AfterForwardFn, ForwardResult, Forwarder, ForwarderHooks, OnReconnectFn,
    ResetAllInflightMarkersFn, ResetInflightMarkerFn, FORWARDER_GROUP_PREFIX,
};
use crate::message::{MessageId, QoS, QueuedMessage};
use crate::metrics::BridgeMetrics;
use crate::queue::{QueueError, QueueStore};
use crate::topic::{SubscriptionFlags, TopicMatcher};

/// Dispatch engine errors
#[derive(Debug)]
pub enum DispatchError {
    /// A forwarder with this id is already registered
    DuplicateForwarder(String),
    /// The queue id is already owned by a forwarder
    DuplicateQueue { queue_id: String, owner: String },
    /// No forwarder with this id is registered
    UnknownForwarder(String),
    /// The queue store failed
    Queue(QueueError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateForwarder(id) => write!(f, "forwarder '{}' already registered", id),
            Self::DuplicateQueue { queue_id, owner } => {
                write!(f, "queue '{}' already owned by forwarder '{}'", queue_id, owner)
            }
            Self::UnknownForwarder(id) => write!(f, "unknown forwarder '{}'", id),
            Self::Queue(e) => write!(f, "queue error: {}", e),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Queue(e) => Some(e),
            _ => None,
        }
    }
}

impl From<QueueError> for DispatchError {
    fn from(err: QueueError) -> Self {
        Self::Queue(err)
    }
}

/// A registered forwarder and the queues it owns
struct Registration {
    forwarder: Arc<dyn Forwarder>,
    queue_ids: Vec<String>,
}

/// The dispatch engine
pub struct MessageForwarder {
    queue: Arc<dyn QueueStore>,
    matcher: Arc<dyn TopicMatcher>,
    metrics: Arc<BridgeMetrics>,
    config: ForwardingConfig,
    forwarders: DashMap<String, Registration>,
    /// queue id -> owning forwarder id
    owners: DashMap<String, String>,
    /// Queue ids believed to hold undelivered messages
    candidates: DashSet<String>,
    cycle: PollCycle,
    /// Ordered retry executor for failed passes
    retry_tx: mpsc::UnboundedSender<()>,
    id_epoch: u64,
    next_id: AtomicU64,
    this: Weak<Self>,
}

impl MessageForwarder {
    /// Create the engine; must be called within a tokio runtime
    pub fn new(
        queue: Arc<dyn QueueStore>,
        matcher: Arc<dyn TopicMatcher>,
        metrics: Arc<BridgeMetrics>,
        config: ForwardingConfig,
    ) -> Arc<Self> {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let id_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let engine = Arc::new_cyclic(|this| Self {
            queue,
            matcher,
            metrics,
            config,
            forwarders: DashMap::new(),
            owners: DashMap::new(),
            candidates: DashSet::new(),
            cycle: PollCycle::new(),
            retry_tx,
            id_epoch,
            next_id: AtomicU64::new(1),
            this: this.clone(),
        });

        tokio::spawn(Self::retry_loop(
            Arc::downgrade(&engine),
            retry_rx,
            engine.config.poll_retry_delay,
        ));

        engine
    }

    /// Runs retriggers one at a time, in order, after a delay
    async fn retry_loop(
        engine: Weak<Self>,
        mut retry_rx: mpsc::UnboundedReceiver<()>,
        delay: std::time::Duration,
    ) {
        while retry_rx.recv().await.is_some() {
            tokio::time::sleep(delay).await;
            let Some(engine) = engine.upgrade() else {
                break;
            };
            debug!("Poll cycle: retrying after read failure");
            engine.check_buffers();
        }
    }

    // ========================================================================
    // Forwarder registration
    // ========================================================================

    /// Register a forwarder, start it and trigger a poll pass
    pub fn add_forwarder(&self, forwarder: Arc<dyn Forwarder>) -> Result<(), DispatchError> {
        let id = forwarder.id().to_string();
        if self.forwarders.contains_key(&id) {
            return Err(DispatchError::DuplicateForwarder(id));
        }

        let group = forwarder::shared_group(&id);
        let queue_ids: Vec<String> = forwarder
            .topics()
            .iter()
            .map(|topic| forwarder::queue_id(&id, topic))
            .collect();

        for (i, queue_id) in queue_ids.iter().enumerate() {
            if queue_ids[..i].contains(queue_id) {
                return Err(DispatchError::DuplicateQueue {
                    queue_id: queue_id.clone(),
                    owner: id,
                });
            }
            if let Some(owner) = self.owners.get(queue_id) {
                return Err(DispatchError::DuplicateQueue {
                    queue_id: queue_id.clone(),
                    owner: owner.clone(),
                });
            }
        }

        match self.forwarders.entry(id.clone()) {
            Entry::Occupied(_) => return Err(DispatchError::DuplicateForwarder(id)),
            Entry::Vacant(entry) => {
                entry.insert(Registration {
                    forwarder: forwarder.clone(),
                    queue_ids: queue_ids.clone(),
                });
            }
        }

        let flags = SubscriptionFlags {
            qos: QoS::ExactlyOnce,
            ..Default::default()
        };
        for (topic, queue_id) in forwarder.topics().iter().zip(&queue_ids) {
            self.owners.insert(queue_id.clone(), id.clone());
            if self.matcher.add_subscriber(&id, topic, flags, Some(&group)) {
                debug!(
                    "Forwarder '{}': subscription '{}' was already registered",
                    id, topic
                );
            }
        }

        forwarder.start(self.hooks(&id));

        for queue_id in queue_ids {
            self.candidates.insert(queue_id);
        }

        info!(
            "Dispatch: added forwarder '{}' for bridge '{}' ({} queues)",
            id,
            forwarder.bridge_id(),
            forwarder.topics().len()
        );
        self.check_buffers();
        Ok(())
    }

    /// Unregister and stop a forwarder, optionally discarding its queues
    pub async fn remove_forwarder(&self, id: &str, clear_queue: bool) -> Result<(), DispatchError> {
        let Some((_, registration)) = self.forwarders.remove(id) else {
            return Err(DispatchError::UnknownForwarder(id.to_string()));
        };

        let group = forwarder::shared_group(id);
        for topic in registration.forwarder.topics() {
            self.matcher.remove_subscriber(id, topic, Some(&group));
        }
        for queue_id in &registration.queue_ids {
            self.candidates.remove(queue_id);
            self.owners.remove(queue_id);
        }

        registration.forwarder.stop();

        let mut result = Ok(());
        if clear_queue {
            for queue_id in &registration.queue_ids {
                if let Err(e) = self.queue.clear(queue_id, true).await {
                    warn!("Forwarder '{}': failed to clear queue '{}': {}", id, queue_id, e);
                    if result.is_ok() {
                        result = Err(DispatchError::Queue(e));
                    }
                }
            }
        }

        info!(
            "Dispatch: removed forwarder '{}' (queues cleared: {})",
            id, clear_queue
        );
        result
    }

    /// The hooks a forwarder reports through
    ///
    /// They hold the engine weakly so a forwarder outliving it never keeps it alive.
    fn hooks(&self, forwarder_id: &str) -> ForwarderHooks {
        let engine = self.this.clone();
        let after_forward: AfterForwardFn = Arc::new(move |result: ForwardResult| {
            if let Some(engine) = engine.upgrade() {
                engine.message_processed(result);
            }
        });

        let queue = self.queue.clone();
        let reset_inflight_marker: ResetInflightMarkerFn = Arc::new(move |queue_id: String, message_id: MessageId| {
            let queue = queue.clone();
            async move {
                if let Err(e) = queue.clear_inflight_marker(&queue_id, &message_id).await {
                    warn!(
                        "Queue '{}': failed to reset inflight marker of {}: {}",
                        queue_id, message_id, e
                    );
                }
            }
            .boxed()
        });

        let queue = self.queue.clone();
        let reset_all_inflight_markers: ResetAllInflightMarkersFn = Arc::new(move |queue_id: String| {
            let queue = queue.clone();
            async move { queue.clear_all_inflight_markers(&queue_id).await }.boxed()
        });

        let engine = self.this.clone();
        let id = forwarder_id.to_string();
        let on_reconnect: OnReconnectFn = Arc::new(move || {
            if let Some(engine) = engine.upgrade() {
                engine.forwarder_resumed(&id);
            }
        });

        ForwarderHooks {
            after_forward,
            reset_inflight_marker,
            reset_all_inflight_markers,
            on_reconnect,
        }
    }

    // ========================================================================
    // Triggers
    // ========================================================================

    /// A producer appended to `queue_id`
    pub fn message_available(&self, queue_id: &str) {
        if self.mark_candidate(queue_id) {
            self.check_buffers();
        } else {
            trace!("Dispatch: no forwarder owns queue '{}'", queue_id);
        }
    }

    /// A forwarder concluded a delivery attempt
    ///
    /// Settling the queue is asynchronous; results for forwarders that were
    /// removed meanwhile still settle their queue but trigger nothing.
    pub fn message_processed(&self, result: ForwardResult) {
        let Some(engine) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move { engine.settle(result).await });
    }

    async fn settle(&self, result: ForwardResult) {
        if result.settles_delivery() {
            if let Err(e) = self
                .queue
                .remove_delivery_record(&result.queue_id, &result.message_id)
                .await
            {
                warn!(
                    "Queue '{}': failed to remove delivery record of {}: {}",
                    result.queue_id, result.message_id, e
                );
            }
        }

        let Some(forwarder) = self.forwarder(&result.forwarder_id) else {
            trace!(
                "Dispatch: result for removed forwarder '{}' ignored",
                result.forwarder_id
            );
            return;
        };

        self.mark_candidate(&result.queue_id);
        if forwarder.network_inflight_count() < self.config.inflight_threshold {
            self.check_buffers();
        }
    }

    /// A forwarder finished its reconnect sequence
    fn forwarder_resumed(&self, forwarder_id: &str) {
        let queue_ids = match self.forwarders.get(forwarder_id) {
            Some(registration) => registration.queue_ids.clone(),
            None => return,
        };
        debug!(
            "Forwarder '{}': resumed, rescanning {} queues",
            forwarder_id,
            queue_ids.len()
        );
        for queue_id in queue_ids {
            self.candidates.insert(queue_id);
        }
        self.check_buffers();
    }

    /// Add an owned queue to the candidate set
    fn mark_candidate(&self, queue_id: &str) -> bool {
        if !self.owners.contains_key(queue_id) {
            return false;
        }
        self.candidates.insert(queue_id.to_string());
        true
    }

    /// Trigger a poll pass
    ///
    /// Starts a cycle, or asks the running one for another pass.
    pub fn check_buffers(&self) {
        if !self.cycle.try_begin() {
            trace!("Poll cycle running, rerun requested");
            return;
        }
        let Some(engine) = self.this.upgrade() else {
            self.cycle.abort();
            return;
        };
        tokio::spawn(engine.run_cycle());
    }

    // ========================================================================
    // Local ingress
    // ========================================================================

    /// Append a local publish to every forwarder queue it matches
    ///
    /// Returns the number of queues the message was stored in. Messages over a
    /// subscription's queue limit are discarded.
    pub async fn route(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        user_properties: Vec<(String, String)>,
    ) -> Result<usize, DispatchError> {
        let mut stored = Vec::new();

        for subscriber in self.matcher.matches(topic) {
            let is_forwarder = subscriber
                .shared_group
                .as_deref()
                .is_some_and(|g| g.starts_with(FORWARDER_GROUP_PREFIX));
            if !is_forwarder {
                continue;
            }
            let Some(queue_id) = subscriber.shared_queue_id() else {
                continue;
            };
            let Some(forwarder) = self
                .owners
                .get(&queue_id)
                .and_then(|owner| self.forwarder(owner.value()))
            else {
                continue;
            };

            let mut message = QueuedMessage::new(self.next_message_id(), topic, payload.clone(), qos)
                .with_retain(retain);
            message.user_properties = user_properties.clone();

            if self
                .queue
                .append(&queue_id, message, forwarder.queue_limit())
                .await?
            {
                stored.push(queue_id);
            } else {
                debug!("Queue '{}': full, discarding message on '{}'", queue_id, topic);
                self.metrics.queue_discarded(forwarder.bridge_id());
            }
        }

        let count = stored.len();
        for queue_id in &stored {
            self.mark_candidate(queue_id);
        }
        if count > 0 {
            self.check_buffers();
        }
        Ok(count)
    }

    fn next_message_id(&self) -> MessageId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.id_epoch, n)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn forwarder(&self, id: &str) -> Option<Arc<dyn Forwarder>> {
        self.forwarders.get(id).map(|r| r.forwarder.clone())
    }

    pub fn forwarder_count(&self) -> usize {
        self.forwarders.len()
    }

    /// Queue ids owned by a forwarder
    pub fn queue_ids(&self, forwarder_id: &str) -> Option<Vec<String>> {
        self.forwarders
            .get(forwarder_id)
            .map(|r| r.queue_ids.clone())
    }

    /// Forwarder owning a queue id
    pub fn queue_owner(&self, queue_id: &str) -> Option<String> {
        self.owners.get(queue_id).map(|o| o.clone())
    }

    pub fn is_candidate(&self, queue_id: &str) -> bool {
        self.candidates.contains(queue_id)
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_polling(&self) -> bool {
        self.cycle.is_running()
    }

    pub fn config(&self) -> &ForwardingConfig {
        &self.config
    }

    pub fn queue_store(&self) -> &Arc<dyn QueueStore> {
        &self.queue
    }
}
