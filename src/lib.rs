//! VibeMQ Bridge - store-and-forward relay between the gateway and remote MQTT brokers
//!
//! Local publishes matching a bridge's subscriptions are appended to persisted
//! per-forwarder queues and pumped to the remote broker with at-least-once
//! delivery, bounded inflight windows and ordered redelivery after failures.

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod forwarder;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod remote;
pub mod topic;

pub use bridge::{BridgeError, BridgeService, BridgeStatus, InboundHandler, InboundMessage};
pub use config::{BridgeConfig, ForwardingConfig, GatewayConfig};
pub use dispatch::{DispatchError, MessageForwarder};
pub use forwarder::{ForwardOutcome, Forwarder, ForwarderHooks, RemoteForwarder};
pub use message::{QoS, QueuedMessage};
pub use metrics::BridgeMetrics;
pub use queue::{MemoryQueue, QueueError, QueueStore};
pub use remote::{LoopbackConnector, RemoteConnection, RemoteConnector, RemoteError};
pub use topic::{SubscriptionStore, TopicMatcher};
