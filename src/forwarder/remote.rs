//! Forwarder publishing to a bridge's remote connection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::transform::{ForwardPolicy, TemplateError};
use super::{queue_id, ForwardOutcome, ForwardResult, Forwarder, ForwarderHooks};
use crate::config::{ForwardingConfig, LocalSubscription};
use crate::message::{MessageId, OutboundPublish, QoS, QueuedMessage};
use crate::metrics::BridgeMetrics;
use crate::remote::{ConnectionState, RemoteConnection};

/// Where a message came from, needed to report its outcome
#[derive(Debug, Clone)]
struct Origin {
    message_id: MessageId,
    queue_id: String,
    qos: QoS,
}

/// A transformed message waiting to be published
struct Pending {
    publish: OutboundPublish,
    origin: Origin,
}

/// Saturating decrement, returning the new value
fn decrement(counter: &AtomicUsize) -> usize {
    let (Ok(prev) | Err(prev)) =
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
    prev.saturating_sub(1)
}

struct Inner {
    id: String,
    bridge_id: String,
    topics: Vec<String>,
    queue_limit: Option<usize>,
    policy: ForwardPolicy,
    connection: Arc<dyn RemoteConnection>,
    metrics: Arc<BridgeMetrics>,
    marker_reset_timeout: Duration,
    hooks: OnceLock<ForwarderHooks>,
    /// Messages held while the connection is down or resuming
    buffer: ArrayQueue<Pending>,
    /// Received messages whose outcome is not reported yet
    unresolved: AtomicUsize,
    /// Publishes awaiting an acknowledgement
    network: AtomicUsize,
    resuming: AtomicBool,
    stopped: AtomicBool,
    /// Serializes submission so publishes keep receive order
    send_lock: Mutex<()>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Forwarder for one local subscription of a bridge
pub struct RemoteForwarder {
    inner: Arc<Inner>,
}

impl RemoteForwarder {
    pub fn new(
        id: impl Into<String>,
        bridge_id: impl Into<String>,
        subscription: &LocalSubscription,
        max_hops: u32,
        connection: Arc<dyn RemoteConnection>,
        metrics: Arc<BridgeMetrics>,
        config: &ForwardingConfig,
    ) -> Result<Self, TemplateError> {
        let bridge_id = bridge_id.into();
        let policy = ForwardPolicy::outbound(&bridge_id, subscription, max_hops)?;

        Ok(Self {
            inner: Arc::new(Inner {
                id: id.into(),
                bridge_id,
                topics: subscription.filters.clone(),
                queue_limit: subscription.queue_limit,
                policy,
                connection,
                metrics,
                marker_reset_timeout: config.marker_reset_timeout,
                hooks: OnceLock::new(),
                buffer: ArrayQueue::new(config.buffer_capacity.max(1)),
                unresolved: AtomicUsize::new(0),
                network: AtomicUsize::new(0),
                resuming: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                send_lock: Mutex::new(()),
                watcher: Mutex::new(None),
            }),
        })
    }

    /// State of the underlying remote connection
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }
}

impl Drop for RemoteForwarder {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.watcher.lock().take() {
            handle.abort();
        }
    }
}

impl Inner {
    fn can_send(&self) -> bool {
        !self.resuming.load(Ordering::SeqCst)
            && self.connection.state() == ConnectionState::Connected
    }

    fn dispatch(self: &Arc<Self>, pending: Pending) {
        let _guard = self.send_lock.lock();
        // stop() may have emptied the buffer since on_message checked
        if self.stopped.load(Ordering::SeqCst) {
            debug!(
                "Forwarder '{}': stopped, releasing message {}",
                self.id, pending.origin.message_id
            );
            self.release(pending.origin);
            return;
        }
        // Anything already buffered goes first
        if self.can_send() && self.buffer.is_empty() {
            self.send(pending);
        } else {
            self.hold(pending);
        }
    }

    fn hold(self: &Arc<Self>, pending: Pending) {
        match self.buffer.push(pending) {
            Ok(()) => {
                self.metrics.buffered_inc(&self.bridge_id);
                trace!(
                    "Forwarder '{}': buffered message ({} held)",
                    self.id,
                    self.buffer.len()
                );
            }
            Err(pending) => {
                warn!(
                    "Forwarder '{}': local buffer full, releasing message {} for redelivery",
                    self.id, pending.origin.message_id
                );
                self.release(pending.origin);
            }
        }
    }

    /// Submit a publish; must be called with `send_lock` held
    fn send(self: &Arc<Self>, pending: Pending) {
        self.network.fetch_add(1, Ordering::SeqCst);
        self.metrics.inflight_inc(&self.bridge_id);

        let Pending { publish, origin } = pending;
        trace!(
            "Forwarder '{}': publishing {} as '{}'",
            self.id,
            origin.message_id,
            publish.topic
        );
        let ack = self.connection.publish(publish);

        let inner = self.clone();
        tokio::spawn(async move {
            let result = ack.await;
            decrement(&inner.network);
            inner.metrics.inflight_dec(&inner.bridge_id);

            match result {
                Ok(()) => {
                    inner.metrics.message_forwarded(&inner.bridge_id);
                    inner.complete(origin, ForwardOutcome::Delivered);
                }
                Err(e) => {
                    debug!(
                        "Forwarder '{}': publish of {} failed: {}",
                        inner.id, origin.message_id, e
                    );
                    inner.metrics.publish_failed(&inner.bridge_id);
                    inner.reset_marker(&origin).await;
                    inner.complete(origin, ForwardOutcome::Failed);
                }
            }
        });
    }

    /// Give a message back to its queue without publishing it
    fn release(self: &Arc<Self>, origin: Origin) {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.reset_marker(&origin).await;
            inner.complete(origin, ForwardOutcome::Failed);
        });
    }

    async fn reset_marker(&self, origin: &Origin) {
        if let Some(hooks) = self.hooks.get() {
            (hooks.reset_inflight_marker)(origin.queue_id.clone(), origin.message_id.clone()).await;
        }
    }

    fn complete(&self, origin: Origin, outcome: ForwardOutcome) {
        decrement(&self.unresolved);

        let Some(hooks) = self.hooks.get() else {
            error!(
                "Forwarder '{}': outcome for {} reported before start",
                self.id, origin.message_id
            );
            return;
        };

        (hooks.after_forward)(ForwardResult {
            qos: origin.qos,
            message_id: origin.message_id,
            forwarder_id: self.id.clone(),
            queue_id: origin.queue_id,
            outcome,
        });
    }

    fn drain(self: &Arc<Self>) -> usize {
        let _guard = self.send_lock.lock();
        let mut sent = 0;
        while self.connection.state() == ConnectionState::Connected {
            let Some(pending) = self.buffer.pop() else {
                break;
            };
            self.metrics.buffered_dec(&self.bridge_id);
            self.send(pending);
            sent += 1;
        }
        sent
    }

    async fn watch_connection(self: Arc<Self>, mut state_rx: watch::Receiver<ConnectionState>) {
        loop {
            let state = *state_rx.borrow_and_update();
            if state == ConnectionState::Connected {
                self.resume().await;
            }
            if state_rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Reconnect sequence: reset markers, drain the buffer, let polling resume
    async fn resume(self: &Arc<Self>) {
        let Some(hooks) = self.hooks.get().cloned() else {
            return;
        };

        self.resuming.store(true, Ordering::SeqCst);
        debug!(
            "Forwarder '{}': connected, resetting inflight markers",
            self.id
        );

        let resets = self
            .topics
            .iter()
            .map(|topic| (hooks.reset_all_inflight_markers)(queue_id(&self.id, topic)));

        match tokio::time::timeout(self.marker_reset_timeout, join_all(resets)).await {
            Ok(results) => {
                for (topic, result) in self.topics.iter().zip(results) {
                    if let Err(e) = result {
                        warn!(
                            "Forwarder '{}': failed to reset inflight markers of '{}': {}",
                            self.id, topic, e
                        );
                    }
                }
            }
            Err(_) => {
                // Stay resuming; the next Connected transition reruns the sequence
                warn!(
                    "Forwarder '{}': inflight marker reset timed out after {:?}, forcing reconnect",
                    self.id, self.marker_reset_timeout
                );
                self.metrics.marker_reset_timed_out(&self.bridge_id);
                self.connection.force_reconnect();
                return;
            }
        }

        self.resuming.store(false, Ordering::SeqCst);

        let drained = self.drain();
        if drained > 0 {
            info!(
                "Forwarder '{}': drained {} buffered messages",
                self.id, drained
            );
        }

        (hooks.on_reconnect)();
    }
}

impl Forwarder for RemoteForwarder {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn bridge_id(&self) -> &str {
        &self.inner.bridge_id
    }

    fn topics(&self) -> &[String] {
        &self.inner.topics
    }

    fn queue_limit(&self) -> Option<usize> {
        self.inner.queue_limit
    }

    fn start(&self, hooks: ForwarderHooks) {
        if self.inner.hooks.set(hooks).is_err() {
            warn!("Forwarder '{}': already started", self.inner.id);
            return;
        }

        let state_rx = self.inner.connection.watch_state();
        let handle = tokio::spawn(self.inner.clone().watch_connection(state_rx));
        *self.inner.watcher.lock() = Some(handle);

        debug!(
            "Forwarder '{}': started for {} topics",
            self.inner.id,
            self.inner.topics.len()
        );
    }

    fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = inner.watcher.lock().take() {
            handle.abort();
        }

        let _guard = inner.send_lock.lock();
        let mut released = 0;
        while let Some(pending) = inner.buffer.pop() {
            inner.metrics.buffered_dec(&inner.bridge_id);
            inner.release(pending.origin);
            released += 1;
        }

        info!(
            "Forwarder '{}': stopped ({} buffered messages released)",
            inner.id, released
        );
    }

    fn on_message(&self, message: QueuedMessage, queue_id: &str) {
        let inner = &self.inner;
        inner.unresolved.fetch_add(1, Ordering::SeqCst);

        let origin = Origin {
            message_id: message.id.clone(),
            queue_id: queue_id.to_string(),
            qos: message.qos,
        };

        if inner.stopped.load(Ordering::SeqCst) {
            debug!(
                "Forwarder '{}': stopped, releasing message {}",
                inner.id, origin.message_id
            );
            inner.release(origin);
            return;
        }

        match inner.policy.apply(
            &message.topic,
            message.payload,
            message.qos,
            message.retain,
            &message.user_properties,
        ) {
            Ok(publish) => inner.dispatch(Pending { publish, origin }),
            Err(reason) => {
                debug!(
                    "Forwarder '{}': dropping message {} on '{}' ({})",
                    inner.id, origin.message_id, message.topic, reason
                );
                inner.metrics.message_dropped(&inner.bridge_id, reason.as_str());
                inner.complete(origin, ForwardOutcome::Dropped(reason));
            }
        }
    }

    fn inflight_count(&self) -> usize {
        self.inner.unresolved.load(Ordering::SeqCst)
    }

    fn network_inflight_count(&self) -> usize {
        self.inner.network.load(Ordering::SeqCst)
    }

    fn buffered_count(&self) -> usize {
        self.inner.buffer.len()
    }

    fn is_buffer_full(&self) -> bool {
        self.inner.buffer.is_full()
    }

    fn is_paused(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst) || !self.inner.can_send()
    }

    fn drain_queue(&self) {
        let drained = self.inner.drain();
        debug!(
            "Forwarder '{}': drain sent {} messages",
            self.inner.id, drained
        );
    }
}
