//! Bridge Service
//!
//! Reconciles the configured bridges against the running ones. Starting a
//! bridge creates its remote connection and one forwarder per local
//! subscription, registers the forwarders with the dispatch engine and opens
//! the connection in the background with exponential backoff. A connection
//! that drops later is opened again the same way.
//!
//! Lifecycle operations on one bridge are serialized by a per-bridge lock;
//! reconciliation additionally holds a service-wide lock. Status queries
//! never take either.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::inbound::{InboundHandler, InboundMapper};
use crate::config::{BridgeConfig, ConfigError};
use crate::dispatch::{DispatchError, MessageForwarder};
use crate::forwarder::{forwarder_id, Forwarder, RemoteForwarder, TemplateError};
use crate::message::BRIDGE_CONNECT_MARKER;
use crate::metrics::BridgeMetrics;
use crate::remote::{ConnectOptions, ConnectionState, RemoteConnection, RemoteConnector, RemoteError};

/// Bridge lifecycle errors
#[derive(Debug)]
pub enum BridgeError {
    /// No bridge with this id is configured
    UnknownBridge(String),
    /// The bridge configuration was rejected
    InvalidConfig(String),
    /// Forwarder registration failed
    Dispatch(DispatchError),
    /// The remote connection could not be created
    Remote(RemoteError),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::UnknownBridge(id) => write!(f, "unknown bridge '{}'", id),
            BridgeError::InvalidConfig(msg) => write!(f, "invalid bridge configuration: {}", msg),
            BridgeError::Dispatch(e) => write!(f, "dispatch error: {}", e),
            BridgeError::Remote(e) => write!(f, "remote error: {}", e),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Dispatch(e) => Some(e),
            BridgeError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DispatchError> for BridgeError {
    fn from(e: DispatchError) -> Self {
        BridgeError::Dispatch(e)
    }
}

impl From<RemoteError> for BridgeError {
    fn from(e: RemoteError) -> Self {
        BridgeError::Remote(e)
    }
}

impl From<ConfigError> for BridgeError {
    fn from(e: ConfigError) -> Self {
        BridgeError::InvalidConfig(e.to_string())
    }
}

impl From<TemplateError> for BridgeError {
    fn from(e: TemplateError) -> Self {
        BridgeError::InvalidConfig(e.to_string())
    }
}

/// Point-in-time status of a bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStatus {
    pub id: String,
    pub running: bool,
    pub connected: bool,
    pub last_error: Option<String>,
}

/// A started bridge
struct RunningBridge {
    config: BridgeConfig,
    connection: Arc<dyn RemoteConnection>,
    forwarder_ids: Vec<String>,
    connect_task: Mutex<Option<JoinHandle<()>>>,
}

impl RunningBridge {
    fn abort_connect(&self) {
        if let Some(task) = self.connect_task.lock().take() {
            task.abort();
        }
    }
}

/// Runs the configured bridges
pub struct BridgeService {
    engine: Arc<MessageForwarder>,
    connector: Arc<dyn RemoteConnector>,
    inbound: Arc<dyn InboundHandler>,
    metrics: Arc<BridgeMetrics>,
    /// Desired bridges by id
    configs: RwLock<AHashMap<String, BridgeConfig>>,
    running: DashMap<String, Arc<RunningBridge>>,
    last_errors: Arc<DashMap<String, String>>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    reconcile_lock: tokio::sync::Mutex<()>,
}

impl BridgeService {
    pub fn new(
        engine: Arc<MessageForwarder>,
        connector: Arc<dyn RemoteConnector>,
        inbound: Arc<dyn InboundHandler>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            engine,
            connector,
            inbound,
            metrics,
            configs: RwLock::new(AHashMap::new()),
            running: DashMap::new(),
            last_errors: Arc::new(DashMap::new()),
            locks: DashMap::new(),
            reconcile_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(id.to_string()).or_default().clone()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Add or replace the desired configuration of one bridge
    ///
    /// A running bridge keeps its current configuration until restarted.
    pub fn configure(&self, config: BridgeConfig) -> Result<(), BridgeError> {
        config.validate()?;
        debug!("Bridge '{}': configured", config.id);
        self.configs.write().insert(config.id.clone(), config);
        Ok(())
    }

    /// Replace the whole desired set and reconcile
    ///
    /// Running bridges whose configuration changed are restarted, keeping the
    /// queues of forwarders whose topics did not change.
    pub async fn update_bridges(&self, configs: Vec<BridgeConfig>) -> Result<(), BridgeError> {
        let mut desired = AHashMap::with_capacity(configs.len());
        for config in configs {
            config.validate()?;
            if desired.contains_key(&config.id) {
                return Err(BridgeError::InvalidConfig(format!(
                    "duplicate bridge id '{}'",
                    config.id
                )));
            }
            desired.insert(config.id.clone(), config);
        }

        let _reconcile = self.reconcile_lock.lock().await;

        let changed: Vec<BridgeConfig> = self
            .running
            .iter()
            .filter_map(|entry| {
                desired
                    .get(entry.key())
                    .filter(|new| new.enabled && **new != entry.value().config)
                    .cloned()
            })
            .collect();

        *self.configs.write() = desired;
        info!("Bridge service: {} bridges configured", self.configs.read().len());

        for config in changed {
            let id = config.id.clone();
            if let Err(e) = self.restart(&id, config).await {
                error!("Bridge '{}': restart failed: {}", id, e);
                self.last_errors.insert(id, e.to_string());
            }
        }

        self.reconcile_locked().await;
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start every enabled bridge that is not running and stop every running
    /// bridge that is no longer configured, discarding its queues
    pub async fn reconcile(&self) {
        let _reconcile = self.reconcile_lock.lock().await;
        self.reconcile_locked().await;
    }

    async fn reconcile_locked(&self) {
        let desired: Vec<String> = self
            .configs
            .read()
            .values()
            .filter(|c| c.enabled)
            .map(|c| c.id.clone())
            .collect();

        let stale: Vec<String> = self
            .running
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !desired.contains(id))
            .collect();

        for id in stale {
            info!("Bridge '{}': no longer configured, stopping", id);
            if let Err(e) = self.stop(&id, true, &[]).await {
                warn!("Bridge '{}': stop failed: {}", id, e);
            }
        }

        for id in desired {
            if self.running.contains_key(&id) {
                continue;
            }
            if let Err(e) = self.start(&id).await {
                error!("Bridge '{}': failed to start: {}", id, e);
                self.last_errors.insert(id, e.to_string());
            }
        }
    }

    /// Start a configured bridge
    ///
    /// A running bridge whose connection is down gets an immediate connection
    /// attempt, replacing any pending backoff; otherwise starting a running
    /// bridge is a no-op.
    pub async fn start(&self, id: &str) -> Result<(), BridgeError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.start_locked(id).await
    }

    async fn start_locked(&self, id: &str) -> Result<(), BridgeError> {
        if let Some(running) = self.running.get(id).map(|r| r.clone()) {
            if running.connection.state() == ConnectionState::Disconnected {
                info!("Bridge '{}': retrying connection", id);
                self.spawn_connect(&running);
            }
            return Ok(());
        }

        let config = self
            .configs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownBridge(id.to_string()))?;
        config.validate()?;

        let max_hops = config.max_hops_or(self.engine.config().max_hops);
        let mapper = InboundMapper::new(&config, max_hops)?;
        let options = ConnectOptions {
            client_id: config.effective_client_id(),
            user_properties: vec![(BRIDGE_CONNECT_MARKER.to_string(), "true".to_string())],
            subscriptions: mapper.subscriptions(),
            inbound: Some(mapper.into_callback(self.inbound.clone(), self.metrics.clone())),
        };
        let connection = self.connector.create(&config, options)?;

        let mut forwarder_ids = Vec::with_capacity(config.local_subscriptions.len());
        for (index, subscription) in config.local_subscriptions.iter().enumerate() {
            let fid = forwarder_id(&config.id, index);
            let registered = RemoteForwarder::new(
                fid.as_str(),
                config.id.as_str(),
                subscription,
                max_hops,
                connection.clone(),
                self.metrics.clone(),
                self.engine.config(),
            )
            .map_err(BridgeError::from)
            .and_then(|forwarder| {
                let forwarder: Arc<dyn Forwarder> = Arc::new(forwarder);
                self.engine.add_forwarder(forwarder).map_err(BridgeError::from)
            });

            if let Err(e) = registered {
                self.rollback(id, &forwarder_ids).await;
                return Err(e);
            }
            forwarder_ids.push(fid);
        }

        let running = Arc::new(RunningBridge {
            config,
            connection,
            forwarder_ids,
            connect_task: Mutex::new(None),
        });
        self.running.insert(id.to_string(), running.clone());
        self.spawn_connect(&running);

        info!(
            "Bridge '{}': starting with {} forwarders",
            id,
            running.forwarder_ids.len()
        );
        Ok(())
    }

    /// Unregister forwarders of a bridge that failed to start
    async fn rollback(&self, id: &str, forwarder_ids: &[String]) {
        if forwarder_ids.is_empty() {
            return;
        }
        warn!(
            "Bridge '{}': rolling back {} forwarders",
            id,
            forwarder_ids.len()
        );
        for fid in forwarder_ids {
            if let Err(e) = self.engine.remove_forwarder(fid, false).await {
                warn!("Forwarder '{}': rollback failed: {}", fid, e);
            }
        }
    }

    fn spawn_connect(&self, running: &Arc<RunningBridge>) {
        running.abort_connect();
        let task = tokio::spawn(connection_loop(
            running.config.clone(),
            running.connection.clone(),
            self.last_errors.clone(),
            self.metrics.clone(),
        ));
        *running.connect_task.lock() = Some(task);
    }

    /// Stop a running bridge
    ///
    /// Queues of forwarders listed in `retain` are always kept; the others
    /// are discarded when `clear_queue` is set. Stopping a bridge that is not
    /// running is a no-op.
    pub async fn stop(&self, id: &str, clear_queue: bool, retain: &[String]) -> Result<(), BridgeError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.stop_locked(id, clear_queue, retain).await
    }

    async fn stop_locked(&self, id: &str, clear_queue: bool, retain: &[String]) -> Result<(), BridgeError> {
        let Some((_, running)) = self.running.remove(id) else {
            debug!("Bridge '{}': not running", id);
            return Ok(());
        };

        running.abort_connect();
        if let Err(e) = running.connection.disconnect().await {
            warn!("Bridge '{}': disconnect failed: {}", id, e);
        }

        let mut result = Ok(());
        for fid in &running.forwarder_ids {
            let clear = clear_queue && !retain.contains(fid);
            if let Err(e) = self.engine.remove_forwarder(fid, clear).await {
                warn!("Forwarder '{}': removal failed: {}", fid, e);
                if result.is_ok() {
                    result = Err(BridgeError::from(e));
                }
            }
        }

        info!(
            "Bridge '{}': stopped (queues cleared: {}, retained: {})",
            id,
            clear_queue,
            retain.len()
        );
        result
    }

    /// Restart a bridge with a new configuration
    ///
    /// Forwarders whose topic filters are unchanged keep their queues.
    pub async fn restart(&self, id: &str, config: BridgeConfig) -> Result<(), BridgeError> {
        if config.id != id {
            return Err(BridgeError::InvalidConfig(format!(
                "bridge id '{}' does not match '{}'",
                config.id, id
            )));
        }
        config.validate()?;

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let retained = match self.running.get(id) {
            Some(running) => unchanged_forwarders(&running.config, &config),
            None => Vec::new(),
        };
        self.configs.write().insert(id.to_string(), config);

        debug!(
            "Bridge '{}': restarting, retaining queues of {:?}",
            id, retained
        );
        self.stop_locked(id, true, &retained).await?;
        self.start_locked(id).await
    }

    /// Stop every running bridge, keeping all queues
    pub async fn shutdown(&self) {
        let _reconcile = self.reconcile_lock.lock().await;
        let ids: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        info!("Bridge service: shutting down {} bridges", ids.len());
        for id in ids {
            if let Err(e) = self.stop(&id, false, &[]).await {
                warn!("Bridge '{}': stop during shutdown failed: {}", id, e);
            }
        }
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn is_running(&self, id: &str) -> bool {
        self.running.contains_key(id)
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.running
            .get(id)
            .is_some_and(|r| r.connection.state() == ConnectionState::Connected)
    }

    /// Last start or connection error of a bridge, cleared by a successful connect
    pub fn last_error(&self, id: &str) -> Option<String> {
        self.last_errors.get(id).map(|e| e.clone())
    }

    /// Forwarder ids of a running bridge
    pub fn forwarder_ids(&self, id: &str) -> Option<Vec<String>> {
        self.running.get(id).map(|r| r.forwarder_ids.clone())
    }

    /// Status of every configured or running bridge, sorted by id
    pub fn statuses(&self) -> Vec<BridgeStatus> {
        let mut ids: Vec<String> = self.configs.read().keys().cloned().collect();
        for entry in self.running.iter() {
            if !ids.contains(entry.key()) {
                ids.push(entry.key().clone());
            }
        }
        ids.sort();

        ids.into_iter()
            .map(|id| BridgeStatus {
                running: self.is_running(&id),
                connected: self.is_connected(&id),
                last_error: self.last_error(&id),
                id,
            })
            .collect()
    }
}

/// Forwarder ids whose topic filters are identical in both configurations
fn unchanged_forwarders(old: &BridgeConfig, new: &BridgeConfig) -> Vec<String> {
    new.local_subscriptions
        .iter()
        .enumerate()
        .filter(|(index, sub)| {
            old.local_subscriptions
                .get(*index)
                .is_some_and(|previous| previous.filters == sub.filters)
        })
        .map(|(index, _)| forwarder_id(&new.id, index))
        .collect()
}

/// Keep a bridge connected
///
/// Opens the connection with exponential backoff, then watches it. A drop is
/// recorded as the bridge's last error and followed by a new connection
/// attempt after `reconnect_interval`. The task runs until the bridge stops.
async fn connection_loop(
    config: BridgeConfig,
    connection: Arc<dyn RemoteConnection>,
    last_errors: Arc<DashMap<String, String>>,
    metrics: Arc<BridgeMetrics>,
) {
    let mut state_rx = connection.watch_state();

    loop {
        if connection.state() == ConnectionState::Connected {
            // The connection came back on its own
            last_errors.remove(&config.id);
        } else {
            connect_with_backoff(&config, connection.as_ref(), &last_errors, &metrics).await;
        }

        loop {
            if *state_rx.borrow_and_update() == ConnectionState::Disconnected {
                break;
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }

        let lost = RemoteError::ConnectionLost(format!("connection to {} dropped", config.address));
        warn!(
            "Bridge '{}': {}, reconnecting in {:?}",
            config.id, lost, config.reconnect_interval
        );
        last_errors.insert(config.id.clone(), lost.to_string());
        tokio::time::sleep(config.reconnect_interval).await;
    }
}

async fn connect_with_backoff(
    config: &BridgeConfig,
    connection: &dyn RemoteConnection,
    last_errors: &DashMap<String, String>,
    metrics: &BridgeMetrics,
) {
    let mut retry_interval = config.reconnect_interval;
    let max_retry = config.max_reconnect_interval.max(retry_interval);

    loop {
        debug!("Bridge '{}': connecting to {}", config.id, config.address);

        let result = match tokio::time::timeout(config.connect_timeout, connection.connect()).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        };

        match result {
            Ok(()) => {
                last_errors.remove(&config.id);
                metrics.bridge_started(&config.id);
                info!("Bridge '{}': connected to {}", config.id, config.address);
                return;
            }
            Err(e) => {
                warn!(
                    "Bridge '{}': connection failed: {}, retrying in {:?}",
                    config.id, e, retry_interval
                );
                last_errors.insert(config.id.clone(), e.to_string());
                metrics.connect_failed(&config.id);

                tokio::time::sleep(retry_interval).await;
                retry_interval = std::cmp::min(retry_interval * 2, max_retry);
            }
        }
    }
}
