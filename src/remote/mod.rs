//! Remote Broker Communication
//!
//! The forwarding engine talks to the remote broker through [`RemoteConnection`].
//! The wire client itself lives outside this crate; implementations plug in
//! through a [`RemoteConnector`]. The [`loopback`] module provides an
//! in-process implementation.

mod connection;
pub mod loopback;

pub use connection::{
    ConnectOptions, ConnectionState, InboundCallback, PublishAck, RemoteConnection,
    RemoteConnector, RemoteError, RemotePublish, RemoteSubscriptionRequest,
};
pub use loopback::{LoopbackConnection, LoopbackConnector};
