//! Prometheus metrics for the bridge gateway
//!
//! Counters and gauges for forwarding, connection lifecycle and the poll
//! cycle. The gateway exposes [`BridgeMetrics::encode`] on its own endpoint.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// All bridge metrics in one place
#[derive(Clone)]
pub struct BridgeMetrics {
    pub registry: Registry,

    // Forwarding
    pub forwarded_total: IntCounterVec,
    pub publish_failures_total: IntCounterVec,
    pub dropped_total: IntCounterVec,
    pub inflight_messages: IntGaugeVec,
    pub buffered_messages: IntGaugeVec,

    // Bridge lifecycle
    pub bridge_started_total: IntCounterVec,
    pub connect_failures_total: IntCounterVec,
    pub marker_reset_timeouts_total: IntCounterVec,

    // Poll cycle
    pub poll_passes_total: IntCounter,
    pub poll_read_failures_total: IntCounter,
    pub queue_discarded_total: IntCounterVec,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let forwarded_total = IntCounterVec::new(
            Opts::new(
                "vibemq_bridge_forwarded_total",
                "Messages acknowledged by the remote broker",
            ),
            &["bridge"],
        )
        .unwrap();

        let publish_failures_total = IntCounterVec::new(
            Opts::new(
                "vibemq_bridge_publish_failures_total",
                "Publishes that failed and were released for redelivery",
            ),
            &["bridge"],
        )
        .unwrap();

        let dropped_total = IntCounterVec::new(
            Opts::new(
                "vibemq_bridge_dropped_total",
                "Messages dropped by forwarding policy",
            ),
            &["bridge", "reason"],
        )
        .unwrap();

        let inflight_messages = IntGaugeVec::new(
            Opts::new(
                "vibemq_bridge_inflight_messages",
                "Publishes awaiting acknowledgement from the remote broker",
            ),
            &["bridge"],
        )
        .unwrap();

        let buffered_messages = IntGaugeVec::new(
            Opts::new(
                "vibemq_bridge_buffered_messages",
                "Messages held locally while the remote connection is unavailable",
            ),
            &["bridge"],
        )
        .unwrap();

        let bridge_started_total = IntCounterVec::new(
            Opts::new(
                "vibemq_bridge_started_total",
                "Successful bridge connection starts",
            ),
            &["bridge"],
        )
        .unwrap();

        let connect_failures_total = IntCounterVec::new(
            Opts::new(
                "vibemq_bridge_connect_failures_total",
                "Failed attempts to connect to the remote broker",
            ),
            &["bridge"],
        )
        .unwrap();

        let marker_reset_timeouts_total = IntCounterVec::new(
            Opts::new(
                "vibemq_bridge_marker_reset_timeouts_total",
                "Bulk inflight-marker resets that timed out after a reconnect",
            ),
            &["bridge"],
        )
        .unwrap();

        let poll_passes_total = IntCounter::with_opts(Opts::new(
            "vibemq_bridge_poll_passes_total",
            "Poll passes over the candidate queues",
        ))
        .unwrap();

        let poll_read_failures_total = IntCounter::with_opts(Opts::new(
            "vibemq_bridge_poll_read_failures_total",
            "Queue reads that failed during a poll pass",
        ))
        .unwrap();

        let queue_discarded_total = IntCounterVec::new(
            Opts::new(
                "vibemq_bridge_queue_discarded_total",
                "Local messages discarded because a forwarder queue was full",
            ),
            &["bridge"],
        )
        .unwrap();

        registry
            .register(Box::new(forwarded_total.clone()))
            .unwrap();
        registry
            .register(Box::new(publish_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(dropped_total.clone()))
            .unwrap();
        registry
            .register(Box::new(inflight_messages.clone()))
            .unwrap();
        registry
            .register(Box::new(buffered_messages.clone()))
            .unwrap();
        registry
            .register(Box::new(bridge_started_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connect_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(marker_reset_timeouts_total.clone()))
            .unwrap();
        registry
            .register(Box::new(poll_passes_total.clone()))
            .unwrap();
        registry
            .register(Box::new(poll_read_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(queue_discarded_total.clone()))
            .unwrap();

        BridgeMetrics {
            registry,
            forwarded_total,
            publish_failures_total,
            dropped_total,
            inflight_messages,
            buffered_messages,
            bridge_started_total,
            connect_failures_total,
            marker_reset_timeouts_total,
            poll_passes_total,
            poll_read_failures_total,
            queue_discarded_total,
        }
    }

    // Forwarding helpers

    pub fn message_forwarded(&self, bridge: &str) {
        self.forwarded_total.with_label_values(&[bridge]).inc();
    }

    pub fn publish_failed(&self, bridge: &str) {
        self.publish_failures_total
            .with_label_values(&[bridge])
            .inc();
    }

    pub fn message_dropped(&self, bridge: &str, reason: &str) {
        self.dropped_total
            .with_label_values(&[bridge, reason])
            .inc();
    }

    pub fn inflight_inc(&self, bridge: &str) {
        self.inflight_messages.with_label_values(&[bridge]).inc();
    }

    pub fn inflight_dec(&self, bridge: &str) {
        self.inflight_messages.with_label_values(&[bridge]).dec();
    }

    pub fn buffered_inc(&self, bridge: &str) {
        self.buffered_messages.with_label_values(&[bridge]).inc();
    }

    pub fn buffered_dec(&self, bridge: &str) {
        self.buffered_messages.with_label_values(&[bridge]).dec();
    }

    // Lifecycle helpers

    pub fn bridge_started(&self, bridge: &str) {
        self.bridge_started_total
            .with_label_values(&[bridge])
            .inc();
    }

    pub fn connect_failed(&self, bridge: &str) {
        self.connect_failures_total
            .with_label_values(&[bridge])
            .inc();
    }

    pub fn marker_reset_timed_out(&self, bridge: &str) {
        self.marker_reset_timeouts_total
            .with_label_values(&[bridge])
            .inc();
    }

    // Poll helpers

    pub fn poll_pass(&self) {
        self.poll_passes_total.inc();
    }

    pub fn poll_read_failed(&self) {
        self.poll_read_failures_total.inc();
    }

    pub fn queue_discarded(&self, bridge: &str) {
        self.queue_discarded_total
            .with_label_values(&[bridge])
            .inc();
    }

    /// Render every metric in the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labelled_counters() {
        let metrics = BridgeMetrics::new();
        metrics.message_forwarded("b1");
        metrics.message_forwarded("b1");
        metrics.message_dropped("b1", "loop");

        assert_eq!(metrics.forwarded_total.with_label_values(&["b1"]).get(), 2);
        assert_eq!(
            metrics.dropped_total.with_label_values(&["b1", "loop"]).get(),
            1
        );
        assert_eq!(
            metrics.dropped_total.with_label_values(&["b1", "excluded"]).get(),
            0
        );
    }

    #[test]
    fn test_encode_contains_registered_metrics() {
        let metrics = BridgeMetrics::new();
        metrics.bridge_started("cloud");
        metrics.poll_pass();

        let text = metrics.encode().unwrap();
        assert!(text.contains("vibemq_bridge_started_total{bridge=\"cloud\"} 1"));
        assert!(text.contains("vibemq_bridge_poll_passes_total 1"));
    }
}
