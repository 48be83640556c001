// Built-in `fleet` server: roster and revocation views

use crate::protocol::{CallToolResult, ToolSchema};
use crate::tools::{json_schema_boolean, json_schema_object, Tool, ToolRegistry};
use anyhow::{Context, Result};
use fleetlink_core::connection::ConnectionStatus;
use fleetlink_core::registry::Registry;
use fleetlink_core::store::SlaveStore;
use serde::Deserialize;
use std::sync::Arc;

/// Name the fleet tools are served under
pub const FLEET_SERVER: &str = "fleet";

/// Build the `fleet` server.
pub fn fleet_server(registry: Arc<Registry>) -> ToolRegistry {
    let store = registry.store().clone();
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(SlavesListTool::new(registry)));
    tools.register(Arc::new(RevokedListTool::new(store)));
    tools
}

/// Lists known slaves with their live status
pub struct SlavesListTool {
    registry: Arc<Registry>,
}

impl SlavesListTool {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SlavesListArgs {
    #[serde(default)]
    connected_only: bool,
}

#[async_trait::async_trait]
impl Tool for SlavesListTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "slaves_list".to_string(),
            description: "List slave hosts with status, version and tool counts".to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "connected_only": json_schema_boolean("Only include connected slaves")
                }),
                vec![],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let args: SlavesListArgs = if arguments.is_null() {
            SlavesListArgs::default()
        } else {
            serde_json::from_value(arguments).context("Invalid arguments for slaves_list")?
        };

        let mut slaves = self.registry.get_all_slaves()?;
        if args.connected_only {
            slaves.retain(|s| s.status == ConnectionStatus::Connected);
        }

        Ok(CallToolResult::json(&slaves)?)
    }
}

/// Lists revoked credentials, newest first
pub struct RevokedListTool {
    store: Arc<dyn SlaveStore>,
}

impl RevokedListTool {
    pub fn new(store: Arc<dyn SlaveStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Tool for RevokedListTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "revoked_list".to_string(),
            description: "List revoked slave credentials".to_string(),
            input_schema: json_schema_object(serde_json::json!({}), vec![]),
        }
    }

    async fn execute(&self, _arguments: serde_json::Value) -> Result<CallToolResult> {
        let revoked = self.store.list_revoked_credentials()?;
        Ok(CallToolResult::json(&revoked)?)
    }
}
