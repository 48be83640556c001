//! Seam between the fleet core and the tool-routing layer.

use crate::connection::SlaveConnection;
use crate::error::{FleetError, FleetResult};
use crate::link::LinkServer;
use crate::protocol::{MasterToolsPayload, ToolDescriptor};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock, Weak};

/// One routable tool source: a local server or a connected slave.
#[async_trait]
pub trait ProxyClient: Send + Sync {
    fn name(&self) -> &str;

    async fn list_tools(&self) -> FleetResult<Vec<ToolDescriptor>>;

    async fn call_tool(&self, tool: &str, arguments: Value) -> FleetResult<Value>;

    fn is_connected(&self) -> bool;

    /// Drop any cached tool list so the next listing re-reads it.
    fn invalidate_tool_cache(&self) {}

    /// The slave link this client is bound to, if any.
    fn connection_id(&self) -> Option<&str> {
        None
    }
}

/// Routing table the manager keeps in sync with the registry.
#[async_trait]
pub trait ToolProxy: Send + Sync {
    /// Route calls for `host_id` to `client`, replacing any previous client.
    fn register_slave_client(&self, host_id: &str, client: Arc<dyn ProxyClient>) -> FleetResult<()>;

    /// Stop routing to `host_id`. `NotFound` when nothing was routed.
    fn unregister_slave_client(&self, host_id: &str) -> FleetResult<()>;

    fn get_client(&self, host_id: &str) -> Option<Arc<dyn ProxyClient>>;

    /// Host ids with a registered slave client.
    fn slave_hosts(&self) -> Vec<String>;

    /// Execute a master-local tool on behalf of a slave.
    async fn call_master_tool(&self, server: &str, tool: &str, arguments: Value) -> FleetResult<Value>;

    /// Master-local tools grouped by server, never including slave-hosted tools.
    async fn master_inventory(&self) -> FleetResult<MasterToolsPayload>;
}

/// Proxy client backed by a live slave link.
pub struct SlaveProxyClient {
    connection: Arc<SlaveConnection>,
    server: Weak<LinkServer>,
    cache: RwLock<Option<Vec<ToolDescriptor>>>,
}

impl SlaveProxyClient {
    pub fn new(connection: Arc<SlaveConnection>, server: Weak<LinkServer>) -> Self {
        Self {
            connection,
            server,
            cache: RwLock::new(None),
        }
    }

    pub fn connection(&self) -> &Arc<SlaveConnection> {
        &self.connection
    }

    pub fn is_cached(&self) -> bool {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

#[async_trait]
impl ProxyClient for SlaveProxyClient {
    fn name(&self) -> &str {
        self.connection.host_id()
    }

    async fn list_tools(&self) -> FleetResult<Vec<ToolDescriptor>> {
        if let Some(tools) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Ok(tools.clone());
        }

        let tools = self.connection.tools();
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(tools.clone());
        Ok(tools)
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> FleetResult<Value> {
        if !self.connection.is_connected() {
            return Err(FleetError::NotConnected(self.connection.host_id().to_string()));
        }
        let server = self
            .server
            .upgrade()
            .ok_or(FleetError::NotInitialized("link server"))?;
        server
            .send_tool_call(self.connection.host_id(), tool, arguments)
            .await
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    fn invalidate_tool_cache(&self) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn connection_id(&self) -> Option<&str> {
        Some(self.connection.connection_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelTransport;
    use serde_json::json;
    use std::time::Duration;

    fn client(
        tools: Vec<ToolDescriptor>,
    ) -> (SlaveProxyClient, tokio::sync::mpsc::Receiver<crate::protocol::Message>) {
        let (transport, rx) = ChannelTransport::new(4, Duration::from_secs(1));
        let conn = Arc::new(SlaveConnection::new("alpha", Arc::new(transport), "s", tools));
        (SlaveProxyClient::new(conn, Weak::new()), rx)
    }

    #[tokio::test]
    async fn test_cache_serves_until_invalidated() {
        let (client, _rx) = client(vec![json!({"name": "t1"})]);

        assert_eq!(client.list_tools().await.unwrap().len(), 1);
        assert!(client.is_cached());

        client
            .connection()
            .update_tools(vec![json!({"name": "t1"}), json!({"name": "t2"})]);
        assert_eq!(client.list_tools().await.unwrap().len(), 1);

        client.invalidate_tool_cache();
        assert!(!client.is_cached());
        assert_eq!(client.list_tools().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_call_without_server() {
        let (client, _rx) = client(vec![]);
        let err = client.call_tool("t1", json!({})).await.unwrap_err();
        assert!(matches!(err, FleetError::NotInitialized(_)));
    }
}
