// Tool routing across master-local servers and connected slaves

use crate::tools::ToolRegistry;
use async_trait::async_trait;
use fleetlink_core::error::{FleetError, FleetResult};
use fleetlink_core::protocol::{tool_name, MasterToolsPayload, ToolDescriptor};
use fleetlink_core::proxy::{ProxyClient, ToolProxy};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// A named set of tools served by the master process itself.
pub struct LocalServer {
    name: String,
    tools: ToolRegistry,
}

impl LocalServer {
    pub fn new(name: impl Into<String>, tools: ToolRegistry) -> Self {
        Self {
            name: name.into(),
            tools,
        }
    }

    fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .list_schemas()
            .into_iter()
            .filter_map(|schema| serde_json::to_value(schema).ok())
            .collect()
    }
}

#[async_trait]
impl ProxyClient for LocalServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> FleetResult<Vec<ToolDescriptor>> {
        Ok(self.descriptors())
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> FleetResult<Value> {
        let handler = self
            .tools
            .get(tool)
            .ok_or_else(|| FleetError::NotFound(format!("{}_{}", self.name, tool)))?;

        let result = handler
            .execute(arguments)
            .await
            .map_err(|e| FleetError::ToolFailed(format!("{:#}", e)))?;
        Ok(serde_json::to_value(result)?)
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Routing table for every tool the master can reach.
///
/// Tools are exposed as `{server}_{tool}` and tagged with `_server`. Slave
/// clients are keyed by host id and take part only while connected.
#[derive(Default)]
pub struct McpProxy {
    local: RwLock<BTreeMap<String, Arc<LocalServer>>>,
    slaves: RwLock<BTreeMap<String, Arc<dyn ProxyClient>>>,
    contexts: RwLock<BTreeMap<String, Vec<String>>>,
}

impl McpProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `tools` under `name`. Names are unique across local servers and slaves.
    pub fn add_local_server(&self, name: &str, tools: ToolRegistry) -> FleetResult<()> {
        if self.read_slaves().contains_key(name) {
            return Err(FleetError::Conflict(format!("{} is a connected slave", name)));
        }

        let mut local = self.local.write().unwrap_or_else(PoisonError::into_inner);
        if local.contains_key(name) {
            return Err(FleetError::Conflict(format!("local server {} already exists", name)));
        }

        tracing::info!(server = %name, tools = tools.len(), "Local tool server added");
        local.insert(name.to_string(), Arc::new(LocalServer::new(name, tools)));
        Ok(())
    }

    /// Map a context name to the servers visible under it.
    pub fn set_context(&self, context: &str, servers: Vec<String>) {
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(context.to_string(), servers);
    }

    pub fn contexts(&self) -> BTreeMap<String, Vec<String>> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn local_server_names(&self) -> Vec<String> {
        self.read_local().keys().cloned().collect()
    }

    fn read_local(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<LocalServer>>> {
        self.local.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_slaves(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<dyn ProxyClient>>> {
        self.slaves.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every reachable client, local servers first, filtered by context.
    fn clients(&self, context: Option<&str>) -> Vec<(String, Arc<dyn ProxyClient>)> {
        let enabled = context.and_then(|name| self.contexts().get(name).cloned());
        let visible = |name: &str| {
            enabled
                .as_ref()
                .map(|servers| servers.iter().any(|s| s == name))
                .unwrap_or(true)
        };

        let mut clients: Vec<(String, Arc<dyn ProxyClient>)> = self
            .read_local()
            .iter()
            .filter(|(name, _)| visible(name))
            .map(|(name, server)| (name.clone(), server.clone() as Arc<dyn ProxyClient>))
            .collect();

        clients.extend(
            self.read_slaves()
                .iter()
                .filter(|(name, client)| visible(name) && client.is_connected())
                .map(|(name, client)| (name.clone(), client.clone())),
        );
        clients
    }

    /// All tools, prefixed with their server name.
    pub async fn list_all_tools(&self, context: Option<&str>) -> Vec<ToolDescriptor> {
        let mut all = Vec::new();
        for (server, client) in self.clients(context) {
            match client.list_tools().await {
                Ok(tools) => all.extend(tools.iter().filter_map(|tool| prefixed(&server, tool))),
                Err(e) => tracing::warn!(server = %server, "Failed to list tools: {}", e),
            }
        }
        all
    }

    /// Call a prefixed tool name on whichever client owns it.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> FleetResult<Value> {
        let (server, client) = self
            .clients(None)
            .into_iter()
            .filter(|(server, _)| {
                name.len() > server.len() + 1
                    && name.starts_with(server.as_str())
                    && name.as_bytes()[server.len()] == b'_'
            })
            .max_by_key(|(server, _)| server.len())
            .ok_or_else(|| FleetError::NotFound(format!("tool {}", name)))?;

        let tool = &name[server.len() + 1..];
        tracing::debug!(server = %server, tool = %tool, "Routing tool call");
        client.call_tool(tool, arguments).await
    }
}

fn prefixed(server: &str, tool: &ToolDescriptor) -> Option<ToolDescriptor> {
    let name = tool_name(tool)?;
    let mut tool = tool.clone();
    if let Value::Object(fields) = &mut tool {
        fields.insert("name".to_string(), json!(format!("{}_{}", server, name)));
        fields.insert("_server".to_string(), json!(server));
    }
    Some(tool)
}

#[async_trait]
impl ToolProxy for McpProxy {
    fn register_slave_client(&self, host_id: &str, client: Arc<dyn ProxyClient>) -> FleetResult<()> {
        if self.read_local().contains_key(host_id) {
            return Err(FleetError::Conflict(format!(
                "slave {} collides with a local server",
                host_id
            )));
        }

        self.slaves
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host_id.to_string(), client);
        Ok(())
    }

    fn unregister_slave_client(&self, host_id: &str) -> FleetResult<()> {
        self.slaves
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(host_id)
            .map(|_| ())
            .ok_or_else(|| FleetError::NotFound(format!("slave client {}", host_id)))
    }

    fn get_client(&self, host_id: &str) -> Option<Arc<dyn ProxyClient>> {
        self.read_slaves().get(host_id).cloned()
    }

    fn slave_hosts(&self) -> Vec<String> {
        self.read_slaves().keys().cloned().collect()
    }

    async fn call_master_tool(&self, server: &str, tool: &str, arguments: Value) -> FleetResult<Value> {
        let local = self
            .read_local()
            .get(server)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(format!("master server {}", server)))?;
        local.call_tool(tool, arguments).await
    }

    async fn master_inventory(&self) -> FleetResult<MasterToolsPayload> {
        let servers = self
            .read_local()
            .iter()
            .map(|(name, server)| (name.clone(), server.descriptors()))
            .collect();

        Ok(MasterToolsPayload {
            servers,
            context_mappings: self.contexts(),
        })
    }
}
