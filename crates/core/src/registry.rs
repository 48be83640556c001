//! Authoritative in-memory map of live slave links.
//!
//! Lock layout: the outer `RwLock` guards the host id -> connection map
//! (register, unregister, enumerate); each [`SlaveConnection`] carries its own
//! lock for tool and heartbeat mutation. Notifications are enqueued while the
//! outer lock is held so that events for one host id keep their order.

use crate::connection::{ConnectionStatus, SlaveConnection, Transport};
use crate::error::{FleetError, FleetResult};
use crate::lifecycle::TaskHandle;
use crate::metrics::{self, MetricsCollector};
use crate::protocol::ToolDescriptor;
use crate::store::SlaveStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Liveness and notification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// How often the sweep runs
    pub heartbeat_interval: Duration,
    /// Silence after which a link is evicted
    pub heartbeat_timeout: Duration,
    /// Bounded notification queue size; overflow is dropped
    pub notification_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(120),
            notification_capacity: 10,
        }
    }
}

/// Registry event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Connected,
    Disconnected,
    ToolsUpdated,
    Response,
}

/// Immutable registry event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryNotification {
    pub host_id: String,
    pub kind: NotificationKind,
    /// Tools for `connected` and `tools_updated`; empty otherwise
    pub tools: Vec<ToolDescriptor>,
    pub at: DateTime<Utc>,
}

impl RegistryNotification {
    fn new(host_id: &str, kind: NotificationKind, tools: Vec<ToolDescriptor>) -> Self {
        Self {
            host_id: host_id.to_string(),
            kind,
            tools,
            at: Utc::now(),
        }
    }
}

/// Read model merging the persisted roster with live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveInfo {
    pub host_id: String,
    pub cert_serial: String,
    pub platform: String,
    pub version: String,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub status: ConnectionStatus,
    pub tool_count: usize,
    pub tools: Vec<ToolDescriptor>,
}

impl SlaveInfo {
    fn apply_live(&mut self, conn: &SlaveConnection) {
        self.status = conn.status();
        self.last_heartbeat = Some(conn.last_heartbeat());
        self.connected_at = Some(conn.connected_at());
        self.tools = conn.tools();
        self.tool_count = self.tools.len();
    }

    fn live_only(conn: &SlaveConnection) -> Self {
        let mut info = Self {
            host_id: conn.host_id().to_string(),
            cert_serial: conn.cert_serial().to_string(),
            platform: String::new(),
            version: String::new(),
            issued_at: None,
            expires_at: None,
            last_heartbeat: None,
            connected_at: None,
            enabled: true,
            status: ConnectionStatus::Disconnected,
            tool_count: 0,
            tools: Vec::new(),
        };
        info.apply_live(conn);
        info
    }
}

impl From<&crate::store::SlaveRecord> for SlaveInfo {
    fn from(record: &crate::store::SlaveRecord) -> Self {
        Self {
            host_id: record.host_id.clone(),
            cert_serial: record.cert_serial.clone(),
            platform: record.platform.clone(),
            version: record.version.clone(),
            issued_at: Some(record.issued_at),
            expires_at: Some(record.expires_at),
            last_heartbeat: record.last_seen,
            connected_at: None,
            enabled: record.enabled,
            status: ConnectionStatus::Disconnected,
            tool_count: 0,
            tools: Vec::new(),
        }
    }
}

/// Registry of connected slaves
pub struct Registry {
    connections: RwLock<HashMap<String, Arc<SlaveConnection>>>,
    store: Arc<dyn SlaveStore>,
    config: RegistryConfig,
    notify_tx: mpsc::Sender<RegistryNotification>,
    notify_rx: Mutex<Option<mpsc::Receiver<RegistryNotification>>>,
    dropped: AtomicU64,
    metrics: Arc<MetricsCollector>,
}

impl Registry {
    pub fn new(store: Arc<dyn SlaveStore>, config: RegistryConfig) -> Self {
        Self::with_metrics(store, config, Arc::new(MetricsCollector::new()))
    }

    pub fn with_metrics(
        store: Arc<dyn SlaveStore>,
        config: RegistryConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(config.notification_capacity.max(1));
        Self {
            connections: RwLock::new(HashMap::new()),
            store,
            config,
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            dropped: AtomicU64::new(0),
            metrics,
        }
    }

    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<SlaveConnection>>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<SlaveConnection>>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SlaveStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Register a live link for `host_id`.
    ///
    /// An existing link for the same host is closed and replaced: a new
    /// authenticated connection always wins, which is how a slave comes back
    /// after a network blip.
    pub fn register(
        &self,
        host_id: &str,
        transport: Arc<dyn Transport>,
        cert_serial: &str,
        tools: Vec<ToolDescriptor>,
    ) -> FleetResult<Arc<SlaveConnection>> {
        if host_id.trim().is_empty() {
            return Err(FleetError::Protocol("empty host id".to_string()));
        }

        let conn = Arc::new(SlaveConnection::new(host_id, transport, cert_serial, tools.clone()));
        {
            let mut connections = self.write_map();

            if let Some(previous) = connections.insert(host_id.to_string(), conn.clone()) {
                tracing::info!(
                    host_id = %host_id,
                    previous = %previous.connection_id(),
                    "Superseding existing slave connection"
                );
                previous.disconnect();
                self.metrics.increment_counter(metrics::SLAVE_SUPERSEDED);
            }

            self.metrics
                .set_gauge(metrics::SLAVES_CONNECTED, connections.len() as i64);
            self.notify(RegistryNotification::new(host_id, NotificationKind::Connected, tools));
        }

        self.metrics.increment_counter(metrics::SLAVE_REGISTRATIONS);

        if let Err(e) = self.store.update_slave_last_seen(host_id, conn.connected_at()) {
            tracing::warn!(host_id = %host_id, "Failed to update last seen: {:#}", e);
        }

        Ok(conn)
    }

    /// Remove `host_id` if present. Absent hosts are a no-op.
    pub fn unregister(&self, host_id: &str) -> bool {
        self.remove_where(host_id, |_| true)
    }

    /// Remove `host_id` only if its current link is `connection_id`.
    ///
    /// Used by a closing read loop so that a link already superseded by a
    /// reconnect never evicts its replacement.
    pub fn unregister_connection(&self, host_id: &str, connection_id: &str) -> bool {
        self.remove_where(host_id, |conn| conn.connection_id() == connection_id)
    }

    fn remove_where(&self, host_id: &str, matches: impl FnOnce(&SlaveConnection) -> bool) -> bool {
        let mut connections = self.write_map();
        let Some(conn) = connections.get(host_id) else {
            return false;
        };
        if !matches(conn) {
            return false;
        }

        if let Some(conn) = connections.remove(host_id) {
            conn.disconnect();
        }
        self.metrics
            .set_gauge(metrics::SLAVES_CONNECTED, connections.len() as i64);
        self.notify(RegistryNotification::new(
            host_id,
            NotificationKind::Disconnected,
            Vec::new(),
        ));
        tracing::info!(host_id = %host_id, "Slave unregistered");
        true
    }

    /// Replace the advertised tools of a connected slave.
    pub fn update_tools(&self, host_id: &str, tools: Vec<ToolDescriptor>) -> FleetResult<()> {
        let connections = self.read_map();
        let conn = connections
            .get(host_id)
            .ok_or_else(|| FleetError::NotConnected(host_id.to_string()))?;

        conn.update_tools(tools.clone());
        self.notify(RegistryNotification::new(
            host_id,
            NotificationKind::ToolsUpdated,
            tools,
        ));
        Ok(())
    }

    /// Record a heartbeat for a connected slave.
    pub fn update_heartbeat(&self, host_id: &str) -> FleetResult<()> {
        let conn = self
            .get_connection(host_id)
            .ok_or_else(|| FleetError::NotConnected(host_id.to_string()))?;

        let now = Utc::now();
        conn.record_heartbeat_at(now);

        if let Err(e) = self.store.update_slave_last_seen(host_id, now) {
            tracing::warn!(host_id = %host_id, "Failed to update last seen: {:#}", e);
        }
        Ok(())
    }

    /// Surface a correlated reply as a registry event.
    pub fn record_response(&self, host_id: &str) {
        self.notify(RegistryNotification::new(
            host_id,
            NotificationKind::Response,
            Vec::new(),
        ));
    }

    pub fn get_connection(&self, host_id: &str) -> Option<Arc<SlaveConnection>> {
        self.read_map().get(host_id).cloned()
    }

    /// Connected links, ordered by host id
    pub fn get_connected_slaves(&self) -> Vec<Arc<SlaveConnection>> {
        let mut slaves: Vec<_> = self
            .read_map()
            .values()
            .filter(|conn| conn.status() == ConnectionStatus::Connected)
            .cloned()
            .collect();
        slaves.sort_by(|a, b| a.host_id().cmp(b.host_id()));
        slaves
    }

    pub fn is_connected(&self, host_id: &str) -> bool {
        self.read_map()
            .get(host_id)
            .map(|conn| conn.status() == ConnectionStatus::Connected)
            .unwrap_or(false)
    }

    /// Every known slave: the persisted roster merged with live state.
    ///
    /// Hosts only in the store report `Disconnected` with their last-seen
    /// stamp; live hosts missing from the store are still listed.
    pub fn get_all_slaves(&self) -> FleetResult<Vec<SlaveInfo>> {
        let records = self.store.list_slave_servers().map_err(FleetError::Store)?;
        let connections = self.read_map();

        let mut slaves: Vec<SlaveInfo> = records
            .iter()
            .map(|record| {
                let mut info = SlaveInfo::from(record);
                if let Some(conn) = connections.get(&record.host_id) {
                    info.apply_live(conn);
                }
                info
            })
            .collect();

        for (host_id, conn) in connections.iter() {
            if !records.iter().any(|r| &r.host_id == host_id) {
                slaves.push(SlaveInfo::live_only(conn));
            }
        }

        slaves.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        Ok(slaves)
    }

    /// Roster entry for one host.
    pub fn get_slave(&self, host_id: &str) -> FleetResult<Option<SlaveInfo>> {
        let record = self.store.get_slave_server(host_id).map_err(FleetError::Store)?;
        let conn = self.get_connection(host_id);

        Ok(match (record, conn) {
            (Some(record), Some(conn)) => {
                let mut info = SlaveInfo::from(&record);
                info.apply_live(&conn);
                Some(info)
            }
            (Some(record), None) => Some(SlaveInfo::from(&record)),
            (None, Some(conn)) => Some(SlaveInfo::live_only(&conn)),
            (None, None) => None,
        })
    }

    /// Take the notification receiver. There is exactly one consumer, so this
    /// returns `None` after the first call.
    pub fn notification_receiver(&self) -> Option<mpsc::Receiver<RegistryNotification>> {
        self.notify_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Number of notifications dropped on a full queue.
    pub fn dropped_notifications(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn notify(&self, notification: RegistryNotification) {
        match self.notify_tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.metrics.increment_counter(metrics::NOTIFICATIONS_DROPPED);
                tracing::warn!(
                    host_id = %dropped.host_id,
                    kind = ?dropped.kind,
                    dropped_total = total,
                    "Registry notification queue full, dropping event"
                );
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Registry notification consumer gone");
            }
        }
    }

    /// Evict every link whose last heartbeat is older than the timeout at `now`.
    pub fn evict_stale(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));

        let mut connections = self.write_map();
        let stale: Vec<String> = connections
            .iter()
            .filter(|(_, conn)| now - conn.last_heartbeat() > timeout)
            .map(|(host_id, _)| host_id.clone())
            .collect();

        for host_id in &stale {
            if let Some(conn) = connections.remove(host_id) {
                tracing::warn!(
                    host_id = %host_id,
                    last_heartbeat = %conn.last_heartbeat(),
                    "Slave heartbeat timeout, evicting"
                );
                conn.disconnect();
                self.metrics.increment_counter(metrics::SLAVE_EVICTIONS);
                self.notify(RegistryNotification::new(
                    host_id,
                    NotificationKind::Disconnected,
                    Vec::new(),
                ));
            }
        }

        if !stale.is_empty() {
            self.metrics
                .set_gauge(metrics::SLAVES_CONNECTED, connections.len() as i64);
        }
        stale
    }

    /// Start the periodic liveness sweep. It runs until `shutdown` is cancelled.
    pub fn start_heartbeat_monitor(self: &Arc<Self>, shutdown: CancellationToken) -> TaskHandle {
        let registry = self.clone();
        let cancelled = shutdown.clone();
        let interval = self.config.heartbeat_interval;

        TaskHandle::spawn("heartbeat-monitor", shutdown, async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.evict_stale(Utc::now());
                        if !evicted.is_empty() {
                            tracing::info!("Heartbeat sweep evicted {} slave(s)", evicted.len());
                        }
                    }
                }
            }
            tracing::debug!("Heartbeat monitor stopped");
        })
    }

    /// Close and remove every live link.
    pub fn disconnect_all(&self) -> usize {
        let hosts: Vec<String> = self.read_map().keys().cloned().collect();
        hosts.iter().filter(|host| self.unregister(host)).count()
    }
}
