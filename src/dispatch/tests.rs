//! Dispatch engine tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use super::*;
use crate::config::LocalSubscription;
use crate::forwarder::{forwarder_id, queue_id, ForwardOutcome, RemoteForwarder};
use crate::queue::MemoryQueue;
use crate::remote::{ConnectOptions, LoopbackConnection, RemoteConnection};
use crate::topic::SubscriptionStore;

// ============================================================================
// Harness
// ============================================================================

/// Forwarder that records what it receives
struct StubForwarder {
    id: String,
    topics: Vec<String>,
    queue_limit: Option<usize>,
    hooks: OnceLock<ForwarderHooks>,
    received: Mutex<Vec<(String, QueuedMessage)>>,
    auto_complete: AtomicBool,
    paused: AtomicBool,
    network: AtomicUsize,
    stopped: AtomicBool,
}

impl StubForwarder {
    fn new(id: &str, topics: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            queue_limit: None,
            hooks: OnceLock::new(),
            received: Mutex::new(Vec::new()),
            auto_complete: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            network: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    fn payloads(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .map(|(_, m)| String::from_utf8_lossy(&m.payload).into_owned())
            .collect()
    }

    fn received_count(&self) -> usize {
        self.received.lock().len()
    }

    fn hooks(&self) -> ForwarderHooks {
        self.hooks.get().cloned().expect("forwarder not started")
    }
}

impl Forwarder for StubForwarder {
    fn id(&self) -> &str {
        &self.id
    }

    fn bridge_id(&self) -> &str {
        "b1"
    }

    fn topics(&self) -> &[String] {
        &self.topics
    }

    fn queue_limit(&self) -> Option<usize> {
        self.queue_limit
    }

    fn start(&self, hooks: ForwarderHooks) {
        let _ = self.hooks.set(hooks);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn on_message(&self, message: QueuedMessage, queue_id: &str) {
        let result = ForwardResult {
            qos: message.qos,
            message_id: message.id.clone(),
            forwarder_id: self.id.clone(),
            queue_id: queue_id.to_string(),
            outcome: ForwardOutcome::Delivered,
        };
        self.received.lock().push((queue_id.to_string(), message));
        if self.auto_complete.load(Ordering::SeqCst) {
            (self.hooks().after_forward)(result);
        }
    }

    fn inflight_count(&self) -> usize {
        self.network.load(Ordering::SeqCst)
    }

    fn network_inflight_count(&self) -> usize {
        self.network.load(Ordering::SeqCst)
    }

    fn buffered_count(&self) -> usize {
        0
    }

    fn is_buffer_full(&self) -> bool {
        false
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn drain_queue(&self) {}
}

/// Queue wrapper observing reads: per-queue concurrency and injected failures
#[derive(Default)]
struct ObservedQueue {
    inner: MemoryQueue,
    active: Mutex<HashMap<String, usize>>,
    max_concurrent: AtomicUsize,
    reads: AtomicUsize,
    failures_left: AtomicUsize,
}

#[async_trait]
impl QueueStore for ObservedQueue {
    async fn append(
        &self,
        queue_id: &str,
        message: QueuedMessage,
        limit: Option<usize>,
    ) -> crate::queue::Result<bool> {
        self.inner.append(queue_id, message, limit).await
    }

    async fn read(
        &self,
        queue_id: &str,
        max_messages: usize,
        max_bytes: usize,
    ) -> crate::queue::Result<Vec<QueuedMessage>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(QueueError::Storage("injected failure".to_string()));
        }

        {
            let mut active = self.active.lock();
            let n = active.entry(queue_id.to_string()).or_default();
            *n += 1;
            self.max_concurrent.fetch_max(*n, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
        let result = self.inner.read(queue_id, max_messages, max_bytes).await;
        if let Some(n) = self.active.lock().get_mut(queue_id) {
            *n -= 1;
        }
        result
    }

    async fn remove_delivery_record(&self, queue_id: &str, message_id: &str) -> crate::queue::Result<()> {
        self.inner.remove_delivery_record(queue_id, message_id).await
    }

    async fn clear_inflight_marker(&self, queue_id: &str, message_id: &str) -> crate::queue::Result<()> {
        self.inner.clear_inflight_marker(queue_id, message_id).await
    }

    async fn clear_all_inflight_markers(&self, queue_id: &str) -> crate::queue::Result<()> {
        self.inner.clear_all_inflight_markers(queue_id).await
    }

    async fn clear(&self, queue_id: &str, purge: bool) -> crate::queue::Result<()> {
        self.inner.clear(queue_id, purge).await
    }
}

struct Harness {
    engine: Arc<MessageForwarder>,
    matcher: Arc<SubscriptionStore>,
    metrics: Arc<BridgeMetrics>,
}

fn settings() -> ForwardingConfig {
    ForwardingConfig {
        poll_retry_delay: Duration::from_millis(10),
        marker_reset_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

fn harness(queue: Arc<dyn QueueStore>, config: ForwardingConfig) -> Harness {
    let matcher = Arc::new(SubscriptionStore::new());
    let metrics = Arc::new(BridgeMetrics::new());
    let engine = MessageForwarder::new(queue, matcher.clone(), metrics.clone(), config);
    Harness {
        engine,
        matcher,
        metrics,
    }
}

async fn route(engine: &MessageForwarder, topic: &str, payload: &str) -> usize {
    engine
        .route(
            topic,
            Bytes::copy_from_slice(payload.as_bytes()),
            QoS::AtLeastOnce,
            false,
            Vec::new(),
        )
        .await
        .unwrap()
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_add_forwarder_registers_shared_subscriptions() {
    let h = harness(Arc::new(MemoryQueue::new()), settings());
    let stub = Arc::new(StubForwarder::new("b1-0", &["sensors/#", "alarms/+"]));
    h.engine.add_forwarder(stub.clone()).unwrap();

    assert_eq!(h.matcher.len(), 2);
    let matched = h.matcher.matches("alarms/fire");
    assert_eq!(matched.len(), 1);
    assert_eq!(
        matched[0].shared_queue_id().as_deref(),
        Some("forwarder#b1-0/alarms/+")
    );
    assert_eq!(
        h.engine.queue_ids("b1-0").unwrap(),
        vec!["forwarder#b1-0/sensors/#", "forwarder#b1-0/alarms/+"]
    );
    assert_eq!(
        h.engine.queue_owner("forwarder#b1-0/sensors/#").as_deref(),
        Some("b1-0")
    );
    assert!(stub.hooks.get().is_some());
}

#[tokio::test]
async fn test_duplicate_registrations_rejected() {
    let h = harness(Arc::new(MemoryQueue::new()), settings());
    h.engine
        .add_forwarder(Arc::new(StubForwarder::new("b1-0", &["a/#"])))
        .unwrap();

    let err = h
        .engine
        .add_forwarder(Arc::new(StubForwarder::new("b1-0", &["b/#"])))
        .unwrap_err();
    assert!(matches!(err, DispatchError::DuplicateForwarder(ref id) if id == "b1-0"));

    let err = h
        .engine
        .add_forwarder(Arc::new(StubForwarder::new("b1-1", &["c/#", "c/#"])))
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::DuplicateQueue { ref queue_id, .. } if queue_id == "forwarder#b1-1/c/#"
    ));
    assert_eq!(h.engine.forwarder_count(), 1);
    assert_eq!(h.matcher.len(), 1);
}

#[tokio::test]
async fn test_remove_forwarder_clears_queues() {
    let queue = Arc::new(MemoryQueue::new());
    let h = harness(queue.clone(), settings());
    let stub = Arc::new(StubForwarder::new("b1-0", &["sensors/#"]));
    stub.paused.store(true, Ordering::SeqCst);
    h.engine.add_forwarder(stub.clone()).unwrap();

    assert_eq!(route(&h.engine, "sensors/a", "v").await, 1);
    let qid = queue_id("b1-0", "sensors/#");
    assert_eq!(queue.len(&qid), 1);

    h.engine.remove_forwarder("b1-0", true).await.unwrap();
    assert!(stub.stopped.load(Ordering::SeqCst));
    assert!(h.matcher.is_empty());
    assert!(!queue.contains_queue(&qid));
    assert!(!h.engine.is_candidate(&qid));
    assert_eq!(h.engine.queue_owner(&qid), None);

    assert!(matches!(
        h.engine.remove_forwarder("b1-0", true).await,
        Err(DispatchError::UnknownForwarder(_))
    ));
}

#[tokio::test]
async fn test_remove_forwarder_retains_queues() {
    let queue = Arc::new(MemoryQueue::new());
    let h = harness(queue.clone(), settings());
    let stub = Arc::new(StubForwarder::new("b1-0", &["sensors/#"]));
    stub.paused.store(true, Ordering::SeqCst);
    h.engine.add_forwarder(stub).unwrap();
    route(&h.engine, "sensors/a", "v").await;

    h.engine.remove_forwarder("b1-0", false).await.unwrap();
    assert_eq!(queue.len(&queue_id("b1-0", "sensors/#")), 1);
}

// ============================================================================
// Polling
// ============================================================================

#[tokio::test]
async fn test_routed_messages_delivered_in_order_and_settled() {
    let queue = Arc::new(MemoryQueue::new());
    let h = harness(queue.clone(), settings());
    let stub = Arc::new(StubForwarder::new("b1-0", &["sensors/#"]));
    h.engine.add_forwarder(stub.clone()).unwrap();

    for i in 0..10 {
        assert_eq!(route(&h.engine, "sensors/a", &format!("m{}", i)).await, 1);
    }

    wait_until(|| stub.received_count() == 10).await;
    let expected: Vec<_> = (0..10).map(|i| format!("m{}", i)).collect();
    assert_eq!(stub.payloads(), expected);

    let qid = queue_id("b1-0", "sensors/#");
    wait_until(|| queue.len(&qid) == 0).await;
    wait_until(|| !h.engine.is_polling()).await;
    assert!(!h.engine.is_candidate(&qid));
}

#[tokio::test]
async fn test_forwarder_over_threshold_not_read() {
    let config = ForwardingConfig {
        inflight_threshold: 2,
        ..settings()
    };
    let h = harness(Arc::new(MemoryQueue::new()), config);
    let stub = Arc::new(StubForwarder::new("b1-0", &["sensors/#"]));
    stub.network.store(3, Ordering::SeqCst);
    h.engine.add_forwarder(stub.clone()).unwrap();

    route(&h.engine, "sensors/a", "v").await;
    wait_until(|| !h.engine.is_polling()).await;
    assert_eq!(stub.received_count(), 0);
    let qid = queue_id("b1-0", "sensors/#");
    assert!(h.engine.is_candidate(&qid));

    // A completion bringing the forwarder under the threshold resumes reading
    stub.network.store(1, Ordering::SeqCst);
    h.engine.message_processed(ForwardResult {
        qos: QoS::AtLeastOnce,
        message_id: "earlier".into(),
        forwarder_id: "b1-0".into(),
        queue_id: qid,
        outcome: ForwardOutcome::Failed,
    });
    wait_until(|| stub.received_count() == 1).await;
}

#[tokio::test]
async fn test_paused_forwarder_resumes_on_reconnect_hook() {
    let h = harness(Arc::new(MemoryQueue::new()), settings());
    let stub = Arc::new(StubForwarder::new("b1-0", &["sensors/#"]));
    stub.paused.store(true, Ordering::SeqCst);
    h.engine.add_forwarder(stub.clone()).unwrap();

    route(&h.engine, "sensors/a", "v").await;
    wait_until(|| !h.engine.is_polling()).await;
    assert_eq!(stub.received_count(), 0);

    stub.paused.store(false, Ordering::SeqCst);
    (stub.hooks().on_reconnect)();
    wait_until(|| stub.received_count() == 1).await;
}

#[tokio::test]
async fn test_single_flight_under_concurrent_triggers() {
    let queue = Arc::new(ObservedQueue::default());
    let h = harness(queue.clone(), settings());
    let stubs: Vec<_> = (0..3)
        .map(|i| Arc::new(StubForwarder::new(&forwarder_id("b1", i), &["sensors/#", "alarms/#"])))
        .collect();
    for stub in &stubs {
        h.engine.add_forwarder(stub.clone()).unwrap();
    }

    let mut tasks = Vec::new();
    for i in 0..20 {
        let engine = h.engine.clone();
        tasks.push(tokio::spawn(async move {
            let topic = if i % 2 == 0 { "sensors/t" } else { "alarms/t" };
            route(&engine, topic, &format!("m{}", i)).await;
            engine.message_available(&queue_id(&forwarder_id("b1", 0), "sensors/#"));
            engine.check_buffers();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    wait_until(|| stubs.iter().all(|s| s.received_count() == 20)).await;
    wait_until(|| !h.engine.is_polling()).await;

    // Reads of one queue never overlap, so passes never ran concurrently
    assert_eq!(queue.max_concurrent.load(Ordering::SeqCst), 1);
    for stub in &stubs {
        let mut payloads = stub.payloads();
        payloads.sort();
        payloads.dedup();
        assert_eq!(payloads.len(), 20);
    }
}

#[tokio::test]
async fn test_read_failure_retried_through_executor() {
    let queue = Arc::new(ObservedQueue::default());
    queue.failures_left.store(2, Ordering::SeqCst);
    let h = harness(queue.clone(), settings());
    let stub = Arc::new(StubForwarder::new("b1-0", &["sensors/#"]));
    h.engine.add_forwarder(stub.clone()).unwrap();

    route(&h.engine, "sensors/a", "v").await;
    wait_until(|| stub.received_count() == 1).await;

    assert_eq!(h.metrics.poll_read_failures_total.get(), 2);
    assert_eq!(queue.failures_left.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Completion
// ============================================================================

#[tokio::test]
async fn test_result_for_removed_forwarder_is_tolerated() {
    let queue = Arc::new(MemoryQueue::new());
    let h = harness(queue.clone(), settings());
    let stub = Arc::new(StubForwarder::new("b1-0", &["sensors/#"]));
    stub.auto_complete.store(false, Ordering::SeqCst);
    h.engine.add_forwarder(stub.clone()).unwrap();

    route(&h.engine, "sensors/a", "v").await;
    wait_until(|| stub.received_count() == 1).await;
    h.engine.remove_forwarder("b1-0", false).await.unwrap();

    let (qid, message) = stub.received.lock()[0].clone();
    (stub.hooks().after_forward)(ForwardResult {
        qos: message.qos,
        message_id: message.id,
        forwarder_id: "b1-0".into(),
        queue_id: qid.clone(),
        outcome: ForwardOutcome::Delivered,
    });

    // Still settled in the store, but the queue does not become a candidate again
    wait_until(|| queue.len(&qid) == 0).await;
    assert!(!h.engine.is_candidate(&qid));
}

#[tokio::test]
async fn test_failed_publish_redelivered() {
    let queue = Arc::new(MemoryQueue::new());
    let h = harness(queue.clone(), settings());
    let conn = Arc::new(LoopbackConnection::new("b1", ConnectOptions::default()));
    conn.set_auto_ack(false);
    conn.connect().await.unwrap();

    let sub = LocalSubscription::new(["sensors/#"]);
    let remote: Arc<dyn RemoteConnection> = conn.clone();
    let fwd = RemoteForwarder::new(
        forwarder_id("b1", 0),
        "b1",
        &sub,
        1,
        remote,
        h.metrics.clone(),
        h.engine.config(),
    )
    .unwrap();
    h.engine.add_forwarder(Arc::new(fwd)).unwrap();
    // Let the initial reconnect sequence finish
    tokio::time::sleep(Duration::from_millis(20)).await;

    route(&h.engine, "sensors/a", "v").await;
    wait_until(|| conn.pending_acks() == 1).await;
    conn.fail_all("server busy");

    // The marker is reset before the failure is reported, so the message is read again
    wait_until(|| conn.pending_acks() == 1 && conn.published_count() == 2).await;
    conn.ack_all();

    let qid = queue_id("b1-0", "sensors/#");
    wait_until(|| queue.len(&qid) == 0).await;
    assert_eq!(h.metrics.forwarded_total.with_label_values(&["b1"]).get(), 1);
    assert_eq!(h.metrics.publish_failures_total.with_label_values(&["b1"]).get(), 1);
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_route_respects_queue_limit() {
    let queue = Arc::new(MemoryQueue::new());
    let h = harness(queue.clone(), settings());
    let mut stub = StubForwarder::new("b1-0", &["sensors/#"]);
    stub.queue_limit = Some(2);
    stub.paused.store(true, Ordering::SeqCst);
    h.engine.add_forwarder(Arc::new(stub)).unwrap();

    assert_eq!(route(&h.engine, "sensors/a", "1").await, 1);
    assert_eq!(route(&h.engine, "sensors/a", "2").await, 1);
    assert_eq!(route(&h.engine, "sensors/a", "3").await, 0);

    assert_eq!(queue.len(&queue_id("b1-0", "sensors/#")), 2);
    assert_eq!(
        h.metrics.queue_discarded_total.with_label_values(&["b1"]).get(),
        1
    );
}

#[tokio::test]
async fn test_route_ignores_other_subscribers() {
    let h = harness(Arc::new(MemoryQueue::new()), settings());
    let stub = Arc::new(StubForwarder::new("b1-0", &["sensors/#"]));
    stub.paused.store(true, Ordering::SeqCst);
    h.engine.add_forwarder(stub).unwrap();

    let flags = SubscriptionFlags::default();
    h.matcher.add_subscriber("client-a", "sensors/#", flags, None);
    h.matcher.add_subscriber("client-b", "sensors/#", flags, Some("workers"));

    assert_eq!(route(&h.engine, "sensors/a", "v").await, 1);
    assert_eq!(route(&h.engine, "other/a", "v").await, 0);
}

#[tokio::test]
async fn test_route_preserves_message_fields() {
    let queue = Arc::new(MemoryQueue::new());
    let h = harness(queue.clone(), settings());
    let stub = Arc::new(StubForwarder::new("b1-0", &["sensors/#"]));
    stub.auto_complete.store(false, Ordering::SeqCst);
    h.engine.add_forwarder(stub.clone()).unwrap();

    h.engine
        .route(
            "sensors/a",
            Bytes::from_static(b"21.5"),
            QoS::ExactlyOnce,
            true,
            vec![("origin".to_string(), "plc".to_string())],
        )
        .await
        .unwrap();
    wait_until(|| stub.received_count() == 1).await;

    let (qid, message) = stub.received.lock()[0].clone();
    assert_eq!(qid, "forwarder#b1-0/sensors/#");
    assert_eq!(message.topic, "sensors/a");
    assert_eq!(message.qos, QoS::ExactlyOnce);
    assert!(message.retain);
    assert_eq!(
        message.user_properties,
        vec![("origin".to_string(), "plc".to_string())]
    );
}
