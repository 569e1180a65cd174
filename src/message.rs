//! Message Types
//!
//! Messages read from the persisted queues and the publishes handed to the
//! remote connection, plus the user property conventions bridges put on the wire.

use std::fmt;

use bytes::Bytes;
use serde::Deserialize;

/// User property carrying the number of bridge relays a message has traversed
pub const HOP_COUNT_PROPERTY: &str = "x-vibemq-hop-count";

/// User property sent in CONNECT so the remote gateway can recognise bridge clients
pub const BRIDGE_CONNECT_MARKER: &str = "x-vibemq-bridge";

/// Identifier of a message inside one queue
pub type MessageId = String;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Clamp a configured level, treating anything above 2 as exactly-once
    pub fn saturating_from_u8(v: u8) -> Self {
        Self::from_u8(v).unwrap_or(QoS::ExactlyOnce)
    }

    /// Whether the queue keeps a delivery record for this level
    pub fn is_acknowledged(self) -> bool {
        self != QoS::AtMostOnce
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// A `name = value` user property as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserProperty {
    pub name: String,
    pub value: String,
}

impl UserProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A message stored in a forwarder queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    /// Identifier assigned when the message was appended
    pub id: MessageId,
    /// Topic the message was published on locally
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub user_properties: Vec<(String, String)>,
}

impl QueuedMessage {
    pub fn new(id: impl Into<MessageId>, topic: impl Into<String>, payload: Bytes, qos: QoS) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            payload,
            qos,
            retain: false,
            user_properties: Vec::new(),
        }
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_user_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((name.into(), value.into()));
        self
    }

    /// Approximate stored size, used for byte-bounded queue reads
    pub fn size(&self) -> usize {
        let props: usize = self
            .user_properties
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        self.topic.len() + self.payload.len() + props
    }

    /// Hop count carried by the message; missing or unparseable counts as 0
    pub fn hop_count(&self) -> u32 {
        hop_count(&self.user_properties)
    }
}

/// A publish ready to be sent to the remote broker
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub user_properties: Vec<(String, String)>,
}

impl OutboundPublish {
    pub fn hop_count(&self) -> u32 {
        hop_count(&self.user_properties)
    }
}

/// Read the hop count from a user property list
pub fn hop_count(properties: &[(String, String)]) -> u32 {
    properties
        .iter()
        .find(|(k, _)| k == HOP_COUNT_PROPERTY)
        .and_then(|(_, v)| v.trim().parse::<u32>().ok())
        .unwrap_or(0)
}

/// Replace any hop count property with `hops`
pub fn set_hop_count(properties: &mut Vec<(String, String)>, hops: u32) {
    properties.retain(|(k, _)| k != HOP_COUNT_PROPERTY);
    properties.push((HOP_COUNT_PROPERTY.to_string(), hops.to_string()));
}
