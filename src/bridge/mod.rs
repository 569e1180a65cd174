//! MQTT Bridge Module
//!
//! Relays messages between the gateway and remote MQTT brokers. Each bridge
//! owns one remote connection; every local subscription of the bridge becomes
//! a forwarder registered with the dispatch engine, and remote subscriptions
//! are mapped back into the gateway through an [`InboundHandler`].
//!
//! # Loop Prevention
//!
//! Bridges use two mechanisms to keep messages from circulating:
//! - **Hop count**: every forwarded message carries `x-vibemq-hop-count`;
//!   messages that already crossed `max_hops` bridges are dropped
//! - **no_local**: remote subscriptions never receive the bridge's own publishes
//!
//! # Example Configuration
//!
//! ```toml
//! [[bridge]]
//! id = "cloud"
//! address = "cloud.example.com:8883"
//! protocol = "mqtts"
//! client_id = "edge-bridge-01"
//!
//! [[bridge.local_subscriptions]]
//! filters = ["sensors/#"]
//! destination = "edge/{bridge.id}/{#}"
//! excludes = ["sensors/debug/#"]
//! max_qos = 1
//!
//! [[bridge.remote_subscriptions]]
//! filters = ["commands/edge-01/#"]
//! destination = "local/commands/{3}"
//! ```

mod inbound;
mod service;


pub use inbound::{InboundHandler, InboundMessage};
pub use service::{BridgeError, BridgeService, BridgeStatus};

// Re-export config types from the config module for convenience
pub use crate::config::{BridgeConfig, BridgeProtocol, LocalSubscription, RemoteSubscription};
