//! Remote Connection Abstraction
//!
//! Trait for communication with the remote broker of one bridge.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::config::BridgeConfig;
use crate::message::{OutboundPublish, QoS};

/// Error type for remote connection operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Operation requires an established connection
    NotConnected,
    /// Connection to the remote broker failed or was lost
    ConnectionLost(String),
    /// Remote broker rejected the operation
    Rejected(String),
    /// Operation timed out
    Timeout,
    /// Connection was closed locally
    Closed,
    /// Other error
    Other(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::NotConnected => write!(f, "Not connected"),
            RemoteError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            RemoteError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            RemoteError::Timeout => write!(f, "Operation timed out"),
            RemoteError::Closed => write!(f, "Connection closed"),
            RemoteError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RemoteError {}

/// State of a remote connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// A message received from the remote broker
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub user_properties: Vec<(String, String)>,
}

/// A subscription to place on the remote broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSubscriptionRequest {
    pub filter: String,
    pub qos: QoS,
    /// Don't receive messages published over this same connection
    pub no_local: bool,
}

/// Callback for messages received from the remote broker
pub type InboundCallback = Arc<dyn Fn(RemotePublish) + Send + Sync>;

/// Completion of a submitted publish, resolved when the remote broker acknowledges it
pub type PublishAck = BoxFuture<'static, Result<(), RemoteError>>;

/// Everything a connector needs besides the bridge configuration
#[derive(Clone, Default)]
pub struct ConnectOptions {
    pub client_id: String,
    /// User properties sent with CONNECT
    pub user_properties: Vec<(String, String)>,
    pub subscriptions: Vec<RemoteSubscriptionRequest>,
    pub inbound: Option<InboundCallback>,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("client_id", &self.client_id)
            .field("user_properties", &self.user_properties)
            .field("subscriptions", &self.subscriptions)
            .field("inbound", &self.inbound.is_some())
            .finish()
    }
}

/// Live connection to the remote broker of one bridge
///
/// Implemented by the gateway's MQTT client and by
/// [`LoopbackConnection`](super::LoopbackConnection).
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// Get the name/identifier of this connection
    fn name(&self) -> &str;

    /// Get the current connection state
    fn state(&self) -> ConnectionState;

    /// Subscribe to state changes
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Submit a publish to the remote broker
    ///
    /// Submission happens before this returns, so publishes reach the wire in
    /// call order. The returned future resolves once the broker acknowledges
    /// the message (immediately for QoS 0).
    fn publish(&self, publish: OutboundPublish) -> PublishAck;

    /// Open the connection
    async fn connect(&self) -> Result<(), RemoteError>;

    /// Close the connection gracefully
    async fn disconnect(&self) -> Result<(), RemoteError>;

    /// Drop the current session and connect again
    fn force_reconnect(&self);
}

/// Factory for remote connections
pub trait RemoteConnector: Send + Sync {
    fn create(
        &self,
        config: &BridgeConfig,
        options: ConnectOptions,
    ) -> Result<Arc<dyn RemoteConnection>, RemoteError>;
}
