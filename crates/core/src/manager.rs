//! Keeps the tool-routing table in step with the registry and exposes the
//! administrative operations that span registry, store and link server.

use crate::error::{FleetError, FleetResult};
use crate::lifecycle::TaskHandle;
use crate::link::{LinkConfig, LinkServer};
use crate::pairing::PairingService;
use crate::proxy::{SlaveProxyClient, ToolProxy};
use crate::registry::{NotificationKind, Registry, RegistryNotification};
use crate::store::{RevokedCredential, SlaveStore};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Background loops started by [`Manager::start`].
pub struct ManagerHandle {
    consumer: TaskHandle,
    monitor: TaskHandle,
}

impl ManagerHandle {
    /// Wait for both loops to exit, which happens after [`Manager::stop`].
    pub async fn join(self) {
        self.consumer.join().await;
        self.monitor.join().await;
    }

    pub fn is_finished(&self) -> bool {
        self.consumer.is_finished() && self.monitor.is_finished()
    }
}

pub struct Manager {
    registry: Arc<Registry>,
    proxy: Arc<dyn ToolProxy>,
    store: Arc<dyn SlaveStore>,
    pairing: Arc<PairingService>,
    server: RwLock<Option<Arc<LinkServer>>>,
    shutdown: CancellationToken,
}

impl Manager {
    pub fn new(
        registry: Arc<Registry>,
        proxy: Arc<dyn ToolProxy>,
        store: Arc<dyn SlaveStore>,
        pairing: Arc<PairingService>,
    ) -> Self {
        Self {
            registry,
            proxy,
            store,
            pairing,
            server: RwLock::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn pairing(&self) -> &Arc<PairingService> {
        &self.pairing
    }

    pub fn proxy(&self) -> &Arc<dyn ToolProxy> {
        &self.proxy
    }

    pub fn server(&self) -> Option<Arc<LinkServer>> {
        self.server
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn attach_server(&self, server: Arc<LinkServer>) {
        *self.server.write().unwrap_or_else(PoisonError::into_inner) = Some(server);
    }

    /// Build a link server over this manager's collaborators and attach it.
    pub fn create_server(&self, config: LinkConfig) -> Arc<LinkServer> {
        let server = Arc::new(LinkServer::new(
            self.registry.clone(),
            self.proxy.clone(),
            self.pairing.clone(),
            config,
        ));
        self.attach_server(server.clone());
        server
    }

    /// Start the notification consumer and the heartbeat sweep.
    ///
    /// The consumer also reconciles the routing table with the registry once
    /// per heartbeat interval, repairing any drift left by dropped events.
    pub fn start(self: &Arc<Self>) -> FleetResult<ManagerHandle> {
        let mut notifications = self
            .registry
            .notification_receiver()
            .ok_or(FleetError::NotInitialized("notification channel"))?;

        let monitor = self
            .registry
            .start_heartbeat_monitor(self.shutdown.child_token());

        let manager = self.clone();
        let token = self.shutdown.child_token();
        let cancelled = token.clone();
        let interval = self.registry.config().heartbeat_interval;

        let consumer = TaskHandle::spawn("manager-events", token, async move {
            let mut reconcile = tokio::time::interval(interval);
            reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
            reconcile.tick().await;

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    notification = notifications.recv() => match notification {
                        Some(notification) => manager.handle_notification(notification),
                        None => break,
                    },
                    _ = reconcile.tick() => manager.reconcile(),
                }
            }
            tracing::debug!("Manager event loop stopped");
        });

        tracing::info!("Fleet manager started");
        Ok(ManagerHandle { consumer, monitor })
    }

    fn handle_notification(&self, notification: RegistryNotification) {
        let host_id = notification.host_id.as_str();
        match notification.kind {
            NotificationKind::Connected => self.route_slave(host_id),
            NotificationKind::Disconnected => {
                if let Err(e) = self.proxy.unregister_slave_client(host_id) {
                    tracing::warn!(host_id = %host_id, "Failed to unregister slave client: {}", e);
                }
            }
            NotificationKind::ToolsUpdated => match self.proxy.get_client(host_id) {
                Some(client) => {
                    client.invalidate_tool_cache();
                    tracing::debug!(host_id = %host_id, "Invalidated slave tool cache");
                }
                None => tracing::debug!(host_id = %host_id, "Tools updated for unrouted slave"),
            },
            NotificationKind::Response => {
                tracing::trace!(host_id = %host_id, "Slave response delivered");
            }
        }
    }

    /// Point the routing entry for `host_id` at its current live link.
    fn route_slave(&self, host_id: &str) {
        let Some(conn) = self.registry.get_connection(host_id) else {
            tracing::debug!(host_id = %host_id, "Slave gone before it could be routed");
            return;
        };

        let server = self
            .server()
            .map(|server| Arc::downgrade(&server))
            .unwrap_or_default();
        let client = Arc::new(SlaveProxyClient::new(conn, server));

        match self.proxy.register_slave_client(host_id, client) {
            Ok(()) => tracing::info!(host_id = %host_id, "Slave routed"),
            Err(e) => tracing::error!(host_id = %host_id, "Failed to register slave client: {}", e),
        }
    }

    /// Bring the routing table back in line with the registry.
    pub fn reconcile(&self) {
        for conn in self.registry.get_connected_slaves() {
            let routed = self
                .proxy
                .get_client(conn.host_id())
                .and_then(|client| client.connection_id().map(str::to_string));
            if routed.as_deref() != Some(conn.connection_id()) {
                tracing::info!(host_id = %conn.host_id(), "Reconcile: routing live slave");
                self.route_slave(conn.host_id());
            }
        }

        for host_id in self.proxy.slave_hosts() {
            if !self.registry.is_connected(&host_id) {
                tracing::info!(host_id = %host_id, "Reconcile: dropping route to dead slave");
                if let Err(e) = self.proxy.unregister_slave_client(&host_id) {
                    tracing::warn!(host_id = %host_id, "Failed to unregister slave client: {}", e);
                }
            }
        }
    }

    /// Revoke the credential of `host_id`.
    ///
    /// Fail-closed: the revocation entry is written first and, if that write
    /// fails, the slave is neither disconnected nor disabled. Once the entry is
    /// durable, a missing live link or a failed disable does not fail the call.
    pub fn revoke_credential(&self, host_id: &str, reason: &str) -> FleetResult<RevokedCredential> {
        let record = self
            .store
            .get_slave_server(host_id)
            .map_err(FleetError::Store)?
            .ok_or_else(|| FleetError::NotFound(format!("slave {}", host_id)))?;

        let entry = self
            .store
            .revoke_credential(host_id, &record.cert_serial, reason)
            .map_err(FleetError::Store)?;

        if !self.registry.unregister(host_id) {
            tracing::debug!(host_id = %host_id, "Revoked slave had no live link");
        }

        if let Err(e) = self.store.update_slave_enabled(host_id, false) {
            tracing::warn!(host_id = %host_id, "Failed to disable revoked slave: {:#}", e);
        }

        tracing::info!(host_id = %host_id, serial = %record.cert_serial, reason = %reason, "Credential revoked");
        Ok(entry)
    }

    pub fn list_revoked_credentials(&self) -> FleetResult<Vec<RevokedCredential>> {
        self.store
            .list_revoked_credentials()
            .map_err(FleetError::Store)
    }

    fn live_server(&self, host_id: &str) -> FleetResult<Arc<LinkServer>> {
        let server = self
            .server()
            .ok_or(FleetError::NotInitialized("link server"))?;
        if !self.registry.is_connected(host_id) {
            return Err(FleetError::NotConnected(host_id.to_string()));
        }
        Ok(server)
    }

    pub async fn restart_slave(&self, host_id: &str) -> FleetResult<()> {
        self.live_server(host_id)?
            .send_restart_command(host_id)
            .await
    }

    pub async fn upgrade_slave(&self, host_id: &str) -> FleetResult<()> {
        self.live_server(host_id)?
            .send_upgrade_command(host_id)
            .await
    }

    /// Stop the link server and the background loops.
    pub fn stop(&self) {
        if let Some(server) = self.server() {
            server.stop();
        }
        self.shutdown.cancel();
        tracing::info!("Fleet manager stopped");
    }
}
