//! Bridge Configuration
//!
//! Configuration structures for bridge connections and their subscriptions.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;
use crate::forwarder::TopicTemplate;
use crate::message::{QoS, UserProperty};
use crate::topic::validate_topic_filter;

/// Bridge connection protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeProtocol {
    /// Plain MQTT over TCP
    #[default]
    Mqtt,
    /// MQTT over TLS
    Mqtts,
    /// MQTT over WebSocket
    Ws,
    /// MQTT over WebSocket with TLS
    Wss,
}

impl std::fmt::Display for BridgeProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeProtocol::Mqtt => write!(f, "mqtt"),
            BridgeProtocol::Mqtts => write!(f, "mqtts"),
            BridgeProtocol::Ws => write!(f, "ws"),
            BridgeProtocol::Wss => write!(f, "wss"),
        }
    }
}

impl BridgeProtocol {
    /// Get default port for this protocol
    pub fn default_port(&self) -> u16 {
        match self {
            BridgeProtocol::Mqtt => 1883,
            BridgeProtocol::Mqtts => 8883,
            BridgeProtocol::Ws => 80,
            BridgeProtocol::Wss => 443,
        }
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self, BridgeProtocol::Mqtts | BridgeProtocol::Wss)
    }
}

/// Local topics forwarded to the remote broker
///
/// Each local subscription becomes one forwarder with one queue per filter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LocalSubscription {
    /// Local topic filters to forward
    #[serde(alias = "topics")]
    pub filters: Vec<String>,

    /// Remote topic template (`{#}`, `{1}`.., `{bridge.id}`); source topic when absent
    #[serde(default)]
    pub destination: Option<String>,

    /// Topic filters that are never forwarded
    #[serde(default)]
    pub excludes: Vec<String>,

    /// User properties added to every forwarded message
    #[serde(default)]
    pub custom_user_properties: Vec<UserProperty>,

    /// Keep the retain flag of retained local messages
    #[serde(default)]
    pub preserve_retain: bool,

    /// QoS ceiling for forwarded messages
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,

    /// Maximum messages held in each of this subscription's queues
    #[serde(default)]
    pub queue_limit: Option<usize>,
}

impl LocalSubscription {
    pub fn new<I, S>(filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            filters: filters.into_iter().map(Into::into).collect(),
            destination: None,
            excludes: Vec::new(),
            custom_user_properties: Vec::new(),
            preserve_retain: false,
            max_qos: default_max_qos(),
            queue_limit: None,
        }
    }

    pub fn max_qos(&self) -> QoS {
        QoS::saturating_from_u8(self.max_qos)
    }
}

/// Remote topics pulled into the local gateway
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteSubscription {
    /// Remote topic filters to subscribe to
    #[serde(alias = "topics")]
    pub filters: Vec<String>,

    /// Local topic template; source topic when absent
    #[serde(default)]
    pub destination: Option<String>,

    #[serde(default)]
    pub custom_user_properties: Vec<UserProperty>,

    #[serde(default)]
    pub preserve_retain: bool,

    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
}

impl RemoteSubscription {
    pub fn new<I, S>(filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            filters: filters.into_iter().map(Into::into).collect(),
            destination: None,
            custom_user_properties: Vec::new(),
            preserve_retain: false,
            max_qos: default_max_qos(),
        }
    }

    pub fn max_qos(&self) -> QoS {
        QoS::saturating_from_u8(self.max_qos)
    }
}

/// Configuration for a single bridge connection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BridgeConfig {
    /// Unique identifier for this bridge
    #[serde(alias = "name")]
    pub id: String,

    /// Remote broker address (host:port or just host)
    pub address: String,

    /// Connection protocol
    #[serde(default)]
    pub protocol: BridgeProtocol,

    /// Client ID to use when connecting to remote broker
    #[serde(default)]
    pub client_id: Option<String>,

    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,

    /// Use clean start (no session persistence)
    #[serde(default = "default_true")]
    pub clean_start: bool,

    /// Connection timeout (e.g., "30s")
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// First delay between failed connection attempts
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Maximum delay between attempts (for exponential backoff)
    #[serde(default = "default_max_reconnect_interval", with = "humantime_serde")]
    pub max_reconnect_interval: Duration,

    /// Whether this bridge is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Overrides the gateway-wide hop limit for this bridge
    #[serde(default)]
    pub max_hops: Option<u32>,

    #[serde(default, alias = "local_subscription")]
    pub local_subscriptions: Vec<LocalSubscription>,

    #[serde(default, alias = "remote_subscription")]
    pub remote_subscriptions: Vec<RemoteSubscription>,
}

fn default_max_qos() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

fn default_keepalive() -> u16 {
    60
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_reconnect_interval() -> Duration {
    Duration::from_secs(60)
}

impl BridgeConfig {
    /// Bridge with defaults for everything but the identity
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            protocol: BridgeProtocol::default(),
            client_id: None,
            username: None,
            password: None,
            keepalive: default_keepalive(),
            clean_start: true,
            connect_timeout: default_connect_timeout(),
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_interval: default_max_reconnect_interval(),
            enabled: true,
            max_hops: None,
            local_subscriptions: Vec::new(),
            remote_subscriptions: Vec::new(),
        }
    }

    pub fn with_local_subscription(mut self, subscription: LocalSubscription) -> Self {
        self.local_subscriptions.push(subscription);
        self
    }

    pub fn with_remote_subscription(mut self, subscription: RemoteSubscription) -> Self {
        self.remote_subscriptions.push(subscription);
        self
    }

    /// Client ID sent to the remote broker
    pub fn effective_client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("vibemq-bridge-{}", self.id))
    }

    /// Hop limit for this bridge, falling back to the gateway-wide value
    pub fn max_hops_or(&self, default: u32) -> u32 {
        self.max_hops.unwrap_or(default)
    }

    /// Parse address into host and port
    pub fn parse_address(&self) -> (String, u16) {
        if let Some((host, port_str)) = self.address.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (self.address.clone(), self.protocol.default_port())
    }

    /// Validate the bridge definition
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Validation(format!("Bridge '{}': {}", self.id, msg)));

        if self.id.trim().is_empty() {
            return Err(ConfigError::Validation("bridge id cannot be empty".to_string()));
        }
        if self.id.contains('/') {
            return fail("id cannot contain '/'".to_string());
        }
        if self.address.trim().is_empty() {
            return fail("address cannot be empty".to_string());
        }
        if self.max_hops == Some(0) {
            return fail("max_hops must be at least 1".to_string());
        }

        for (index, sub) in self.local_subscriptions.iter().enumerate() {
            if sub.filters.is_empty() {
                return fail(format!("local subscription {} has no filters", index));
            }
            if sub.max_qos > 2 {
                return fail(format!("local subscription {}: max_qos must be 0, 1, or 2", index));
            }

            let mut seen = HashSet::new();
            for filter in &sub.filters {
                if let Err(e) = validate_topic_filter(filter) {
                    return fail(format!("invalid filter '{}': {}", filter, e));
                }
                // Each filter names a queue of this subscription's forwarder
                if !seen.insert(filter.as_str()) {
                    return fail(format!("duplicate filter '{}' would reuse a queue", filter));
                }
            }
            for exclude in &sub.excludes {
                if let Err(e) = validate_topic_filter(exclude) {
                    return fail(format!("invalid exclude '{}': {}", exclude, e));
                }
            }
            if let Some(ref destination) = sub.destination {
                if let Err(e) = TopicTemplate::parse(destination) {
                    return fail(format!("invalid destination '{}': {}", destination, e));
                }
            }
        }

        for (index, sub) in self.remote_subscriptions.iter().enumerate() {
            if sub.filters.is_empty() {
                return fail(format!("remote subscription {} has no filters", index));
            }
            if sub.max_qos > 2 {
                return fail(format!("remote subscription {}: max_qos must be 0, 1, or 2", index));
            }
            for filter in &sub.filters {
                if let Err(e) = validate_topic_filter(filter) {
                    return fail(format!("invalid filter '{}': {}", filter, e));
                }
            }
            if let Some(ref destination) = sub.destination {
                if let Err(e) = TopicTemplate::parse(destination) {
                    return fail(format!("invalid destination '{}': {}", destination, e));
                }
            }
        }

        Ok(())
    }
}
