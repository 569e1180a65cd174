//! In-process remote connection
//!
//! Records every publish instead of putting it on the wire. Acknowledgements
//! are either immediate or held until [`LoopbackConnection::ack_all`] /
//! [`LoopbackConnection::fail_all`] is called, which makes the connection
//! useful for local loopback deployments and for driving the forwarding
//! engine through connection drops in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::{self, FutureExt};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::debug;

use super::connection::{
    ConnectOptions, ConnectionState, PublishAck, RemoteConnection, RemoteConnector, RemoteError,
    RemotePublish, RemoteSubscriptionRequest,
};
use crate::config::BridgeConfig;
use crate::message::OutboundPublish;

type AckSender = oneshot::Sender<Result<(), RemoteError>>;

/// Remote connection that stays inside the process
pub struct LoopbackConnection {
    name: String,
    options: ConnectOptions,
    state_tx: watch::Sender<ConnectionState>,
    published: Mutex<Vec<OutboundPublish>>,
    pending_acks: Mutex<VecDeque<AckSender>>,
    auto_ack: AtomicBool,
    fail_connect: AtomicBool,
    connect_attempts: AtomicUsize,
    forced_reconnects: AtomicUsize,
}

impl LoopbackConnection {
    pub fn new(name: impl Into<String>, options: ConnectOptions) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            name: name.into(),
            options,
            state_tx,
            published: Mutex::new(Vec::new()),
            pending_acks: Mutex::new(VecDeque::new()),
            auto_ack: AtomicBool::new(true),
            fail_connect: AtomicBool::new(false),
            connect_attempts: AtomicUsize::new(0),
            forced_reconnects: AtomicUsize::new(0),
        }
    }

    /// Acknowledge publishes as soon as they are submitted
    pub fn set_auto_ack(&self, enabled: bool) {
        self.auto_ack.store(enabled, Ordering::SeqCst);
    }

    /// Make subsequent `connect` calls fail
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Every publish submitted so far, in submission order
    pub fn published(&self) -> Vec<OutboundPublish> {
        self.published.lock().clone()
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().len()
    }

    /// Number of publishes awaiting an acknowledgement
    pub fn pending_acks(&self) -> usize {
        self.pending_acks.lock().len()
    }

    /// Acknowledge every pending publish, returning how many were acknowledged
    pub fn ack_all(&self) -> usize {
        self.resolve_pending(|| Ok(()))
    }

    /// Fail every pending publish, returning how many were failed
    pub fn fail_all(&self, reason: &str) -> usize {
        self.resolve_pending(|| Err(RemoteError::Rejected(reason.to_string())))
    }

    fn resolve_pending<F>(&self, result: F) -> usize
    where
        F: Fn() -> Result<(), RemoteError>,
    {
        let pending: Vec<_> = self.pending_acks.lock().drain(..).collect();
        let count = pending.len();
        for ack in pending {
            let _ = ack.send(result());
        }
        count
    }

    pub fn client_id(&self) -> &str {
        &self.options.client_id
    }

    /// User properties the connection was opened with
    pub fn connect_properties(&self) -> &[(String, String)] {
        &self.options.user_properties
    }

    pub fn subscriptions(&self) -> &[RemoteSubscriptionRequest] {
        &self.options.subscriptions
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn forced_reconnects(&self) -> usize {
        self.forced_reconnects.load(Ordering::SeqCst)
    }

    /// Drop the connection as if the network went away
    pub fn simulate_disconnect(&self) {
        self.set_state(ConnectionState::Disconnected);
        self.resolve_pending(|| Err(RemoteError::ConnectionLost("connection dropped".into())));
    }

    /// Bring a dropped connection back
    pub fn simulate_reconnect(&self) {
        self.set_state(ConnectionState::Connected);
    }

    /// Hand a message from the "remote broker" to the inbound callback
    ///
    /// Returns `false` when no inbound callback was registered.
    pub fn deliver_inbound(&self, publish: RemotePublish) -> bool {
        match self.options.inbound {
            Some(ref callback) => {
                callback(publish);
                true
            }
            None => false,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        debug!("Loopback '{}': {}", self.name, state);
        self.state_tx.send_replace(state);
    }
}

#[async_trait]
impl RemoteConnection for LoopbackConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn publish(&self, publish: OutboundPublish) -> PublishAck {
        if self.state() != ConnectionState::Connected {
            return future::ready(Err(RemoteError::NotConnected)).boxed();
        }

        self.published.lock().push(publish);

        if self.auto_ack.load(Ordering::SeqCst) {
            return future::ready(Ok(())).boxed();
        }

        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().push_back(tx);
        async move {
            rx.await
                .unwrap_or_else(|_| Err(RemoteError::ConnectionLost("ack dropped".into())))
        }
        .boxed()
    }

    async fn connect(&self) -> Result<(), RemoteError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);

        if self.fail_connect.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Disconnected);
            return Err(RemoteError::ConnectionLost(format!(
                "connection to '{}' refused",
                self.name
            )));
        }

        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RemoteError> {
        self.set_state(ConnectionState::Disconnected);
        self.resolve_pending(|| Err(RemoteError::Closed));
        Ok(())
    }

    fn force_reconnect(&self) {
        self.forced_reconnects.fetch_add(1, Ordering::SeqCst);
        self.simulate_disconnect();
        if !self.fail_connect.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Connected);
        }
    }
}

/// Connector creating [`LoopbackConnection`]s, keeping the latest one per bridge
#[derive(Default)]
pub struct LoopbackConnector {
    connections: DashMap<String, Arc<LoopbackConnection>>,
    failing: DashMap<String, bool>,
    manual_ack: AtomicBool,
    created: AtomicUsize,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold acknowledgements on connections created from now on
    pub fn with_manual_ack(self) -> Self {
        self.manual_ack.store(true, Ordering::SeqCst);
        self
    }

    /// Make connections of a bridge refuse to connect (existing and future ones)
    pub fn fail_connect_for(&self, bridge_id: &str, fail: bool) {
        self.failing.insert(bridge_id.to_string(), fail);
        if let Some(conn) = self.connections.get(bridge_id) {
            conn.set_fail_connect(fail);
        }
    }

    /// Latest connection created for a bridge
    pub fn connection(&self, bridge_id: &str) -> Option<Arc<LoopbackConnection>> {
        self.connections.get(bridge_id).map(|c| c.clone())
    }

    /// Number of connections created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl RemoteConnector for LoopbackConnector {
    fn create(
        &self,
        config: &BridgeConfig,
        options: ConnectOptions,
    ) -> Result<Arc<dyn RemoteConnection>, RemoteError> {
        let conn = Arc::new(LoopbackConnection::new(config.id.clone(), options));
        conn.set_auto_ack(!self.manual_ack.load(Ordering::SeqCst));
        conn.set_fail_connect(self.failing.get(&config.id).is_some_and(|f| *f));

        self.connections.insert(config.id.clone(), conn.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(conn)
    }
}
