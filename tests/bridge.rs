//! Bridge Integration Tests
//!
//! Drive the public API end to end: configuration, bridge lifecycle, local
//! routing into persisted queues and delivery over loopback connections.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use vibemq_bridge::bridge::{BridgeService, InboundMessage};
use vibemq_bridge::config::GatewayConfig;
use vibemq_bridge::dispatch::MessageForwarder;
use vibemq_bridge::forwarder::queue_id;
use vibemq_bridge::message::{QoS, HOP_COUNT_PROPERTY};
use vibemq_bridge::metrics::BridgeMetrics;
use vibemq_bridge::queue::MemoryQueue;
use vibemq_bridge::remote::LoopbackConnector;
use vibemq_bridge::topic::SubscriptionStore;

const CONFIG: &str = r#"
[forwarding]
inflight_threshold = 4
read_batch_size = 2
poll_retry_delay = "10ms"
marker_reset_timeout = "500ms"

[[bridge]]
id = "cloud"
address = "cloud.example.com:8883"
protocol = "mqtts"
reconnect_interval = "20ms"
max_reconnect_interval = "100ms"

[[bridge.local_subscriptions]]
filters = ["sensors/#"]
destination = "edge/{bridge.id}/{#}"
excludes = ["sensors/debug/#"]
max_qos = 1

[[bridge.local_subscriptions]]
filters = ["alarms/#"]
max_qos = 2
"#;

struct Gateway {
    config: GatewayConfig,
    service: BridgeService,
    engine: Arc<MessageForwarder>,
    connector: Arc<LoopbackConnector>,
    queue: Arc<MemoryQueue>,
    matcher: Arc<SubscriptionStore>,
    metrics: Arc<BridgeMetrics>,
}

impl Gateway {
    async fn start() -> Self {
        let config = GatewayConfig::parse(CONFIG).expect("valid config");
        let queue = Arc::new(MemoryQueue::new());
        let matcher = Arc::new(SubscriptionStore::new());
        let metrics = Arc::new(BridgeMetrics::new());
        let engine = MessageForwarder::new(
            queue.clone(),
            matcher.clone(),
            metrics.clone(),
            config.forwarding.clone(),
        );
        let connector = Arc::new(LoopbackConnector::new());
        let inbound: Arc<Mutex<Vec<InboundMessage>>> = Arc::default();
        let service = BridgeService::new(
            engine.clone(),
            connector.clone(),
            Arc::new(move |message: InboundMessage| inbound.lock().push(message)),
            metrics.clone(),
        );

        service
            .update_bridges(config.bridge.clone())
            .await
            .expect("bridges start");
        wait_until(|| service.is_connected("cloud")).await;
        // Let the initial reconnect sequence settle
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            config,
            service,
            engine,
            connector,
            queue,
            matcher,
            metrics,
        }
    }

    async fn publish(&self, topic: &str, payload: &str) -> usize {
        self.publish_with(topic, payload, Vec::new()).await
    }

    async fn publish_with(
        &self,
        topic: &str,
        payload: &str,
        user_properties: Vec<(String, String)>,
    ) -> usize {
        self.engine
            .route(
                topic,
                Bytes::from(payload.to_string()),
                QoS::AtLeastOnce,
                false,
                user_properties,
            )
            .await
            .expect("route")
    }

    fn published(&self) -> Vec<(String, String)> {
        self.connector
            .connection("cloud")
            .expect("connection")
            .published()
            .into_iter()
            .map(|p| (p.topic, String::from_utf8_lossy(&p.payload).into_owned()))
            .collect()
    }
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

fn numbered(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("m{}", i)).collect()
}

#[tokio::test]
async fn test_local_publishes_reach_remote_in_order() {
    let gw = Gateway::start().await;

    for payload in numbered(10) {
        assert_eq!(gw.publish("sensors/room1/temp", &payload).await, 1);
    }
    wait_until(|| gw.published().len() == 10).await;

    let published = gw.published();
    assert!(published.iter().all(|(t, _)| t == "edge/cloud/sensors/room1/temp"));
    assert_eq!(
        published.into_iter().map(|(_, p)| p).collect::<Vec<_>>(),
        numbered(10)
    );

    // Delivered messages leave the queue
    let qid = queue_id("cloud-0", "sensors/#");
    wait_until(|| gw.queue.len(&qid) == 0).await;
    assert_eq!(
        gw.metrics.forwarded_total.with_label_values(&["cloud"]).get(),
        10
    );
}

#[tokio::test]
async fn test_excluded_and_looped_messages_not_forwarded() {
    let gw = Gateway::start().await;

    gw.publish("sensors/debug/trace", "excluded").await;
    gw.publish_with(
        "alarms/fire",
        "looped",
        vec![(HOP_COUNT_PROPERTY.to_string(), "1".to_string())],
    )
    .await;
    gw.publish("alarms/fire", "fresh").await;

    wait_until(|| gw.published().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let conn = gw.connector.connection("cloud").unwrap();
    let published = conn.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "alarms/fire");
    assert_eq!(published[0].hop_count(), 1);
    assert_eq!(
        gw.metrics.dropped_total.with_label_values(&["cloud", "loop"]).get(),
        1
    );
    assert_eq!(
        gw.metrics.dropped_total.with_label_values(&["cloud", "excluded"]).get(),
        1
    );
}

#[tokio::test]
async fn test_messages_queued_while_disconnected_drain_after_reconnect() {
    let gw = Gateway::start().await;
    let conn = gw.connector.connection("cloud").unwrap();

    // Remote refuses connections until told otherwise
    gw.connector.fail_connect_for("cloud", true);
    conn.simulate_disconnect();
    for payload in numbered(6) {
        gw.publish("sensors/room2/humidity", &payload).await;
    }
    wait_until(|| gw.service.last_error("cloud").is_some()).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(conn.published_count(), 0);
    assert_eq!(gw.queue.len(&queue_id("cloud-0", "sensors/#")), 6);

    // The bridge reconnects on its own once the remote accepts again
    gw.connector.fail_connect_for("cloud", false);
    wait_until(|| conn.published_count() == 6).await;
    wait_until(|| gw.service.last_error("cloud").is_none()).await;

    let payloads: Vec<String> = gw.published().into_iter().map(|(_, p)| p).collect();
    assert_eq!(payloads, numbered(6));
}

#[tokio::test]
async fn test_restart_keeps_undelivered_messages() {
    let gw = Gateway::start().await;
    gw.connector.fail_connect_for("cloud", true);
    gw.connector
        .connection("cloud")
        .unwrap()
        .simulate_disconnect();

    gw.publish("sensors/room3/co2", "kept").await;
    gw.publish("alarms/smoke", "also-kept").await;

    // Same topics, different connection settings
    let mut bridges = gw.config.bridge.clone();
    bridges[0].keepalive = 15;
    gw.service.update_bridges(bridges).await.unwrap();
    gw.connector.fail_connect_for("cloud", false);

    assert_eq!(gw.connector.created(), 2);
    wait_until(|| gw.published().len() == 2).await;

    let mut published = gw.published();
    published.sort();
    assert_eq!(
        published,
        vec![
            ("alarms/smoke".to_string(), "also-kept".to_string()),
            (
                "edge/cloud/sensors/room3/co2".to_string(),
                "kept".to_string()
            ),
        ]
    );
}

#[tokio::test]
async fn test_repeated_start_registers_once() {
    let gw = Gateway::start().await;
    let subscriptions = gw.matcher.len();

    gw.service.start("cloud").await.unwrap();
    gw.service.start("cloud").await.unwrap();

    assert_eq!(gw.connector.created(), 1);
    assert_eq!(gw.engine.forwarder_count(), 2);
    assert_eq!(gw.matcher.len(), subscriptions);
    assert_eq!(
        gw.service.forwarder_ids("cloud").unwrap(),
        vec!["cloud-0".to_string(), "cloud-1".to_string()]
    );
}

#[tokio::test]
async fn test_removed_bridge_discards_queues() {
    let gw = Gateway::start().await;
    gw.connector.fail_connect_for("cloud", true);
    gw.connector
        .connection("cloud")
        .unwrap()
        .simulate_disconnect();
    gw.publish("sensors/room4/temp", "dropped").await;

    gw.service.update_bridges(Vec::new()).await.unwrap();

    assert!(!gw.service.is_running("cloud"));
    assert!(gw.matcher.is_empty());
    assert!(!gw.queue.contains_queue(&queue_id("cloud-0", "sensors/#")));
    assert_eq!(gw.publish("sensors/room4/temp", "nobody").await, 0);
}
