//! Forwarding engine configuration.

use std::time::Duration;

use serde::Deserialize;

fn default_inflight_threshold() -> usize {
    64
}

fn default_read_batch_size() -> usize {
    50
}

fn default_read_batch_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_max_hops() -> u32 {
    1
}

fn default_buffer_capacity() -> usize {
    1000
}

fn default_marker_reset_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_retry_delay() -> Duration {
    Duration::from_millis(100)
}

/// Gateway-wide forwarding settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Network-inflight messages per forwarder at or below which its queues are polled
    #[serde(default = "default_inflight_threshold")]
    pub inflight_threshold: usize,

    /// Maximum messages per queue read
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,

    /// Maximum bytes per queue read (a non-empty queue always yields one message)
    #[serde(default = "default_read_batch_bytes")]
    pub read_batch_bytes: usize,

    /// Messages that already crossed this many bridges are not forwarded again
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,

    /// Messages a forwarder holds locally while its connection is down
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Bound on the bulk inflight-marker reset after a reconnect (e.g., "30s")
    #[serde(default = "default_marker_reset_timeout", with = "humantime_serde")]
    pub marker_reset_timeout: Duration,

    /// Delay before polling again after a failed queue read (e.g., "100ms")
    #[serde(default = "default_poll_retry_delay", with = "humantime_serde")]
    pub poll_retry_delay: Duration,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            inflight_threshold: default_inflight_threshold(),
            read_batch_size: default_read_batch_size(),
            read_batch_bytes: default_read_batch_bytes(),
            max_hops: default_max_hops(),
            buffer_capacity: default_buffer_capacity(),
            marker_reset_timeout: default_marker_reset_timeout(),
            poll_retry_delay: default_poll_retry_delay(),
        }
    }
}
