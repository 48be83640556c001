//! A slave that serves one `echo` tool and reacts to master commands.
//!
//! Pair the host first, then pass the issued serial:
//!
//!   curl -X POST localhost:8080/api/slaves/pair -d '{"hostname":"echo-01"}' \
//!        -H 'content-type: application/json'
//!   FLEETLINK_SERIAL=<cert_serial> cargo run --example echo_slave

use async_trait::async_trait;
use fleetlink_sdk::{LocalTools, SdkError, SdkResult, SlaveClient, SlaveConfig, SlaveEvent, ToolDescriptor};
use serde_json::{json, Value};
use std::sync::Arc;

struct Echo;

#[async_trait]
impl LocalTools for Echo {
    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        vec![json!({
            "name": "echo",
            "description": "Return the arguments unchanged",
            "inputSchema": {"type": "object"},
        })]
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> SdkResult<Value> {
        match tool {
            "echo" => Ok(arguments),
            other => Err(SdkError::ToolFailed(format!("unknown tool: {}", other))),
        }
    }
}

#[tokio::main]
async fn main() -> SdkResult<()> {
    tracing_subscriber::fmt::init();

    let serial = std::env::var("FLEETLINK_SERIAL")
        .map_err(|_| SdkError::Config("FLEETLINK_SERIAL is not set".to_string()))?;
    let config = SlaveConfig::new("http://localhost:8080", "echo-01", serial)?;

    let mut link = SlaveClient::connect(config, Arc::new(Echo)).await?;
    println!("Registered as {} ({:?})", link.host_id(), link.connection_id());

    while let Some(event) = link.next_event().await {
        match event {
            SlaveEvent::MasterToolsUpdated { tool_count } => {
                println!("Master offers {} tools", tool_count);
                for (server, tools) in link.master_tools_for_context("default") {
                    println!("  {}: {} tools", server, tools.len());
                }
            }
            SlaveEvent::Restart => println!("Master requested a restart"),
            SlaveEvent::Upgrade => println!("Master requested an upgrade"),
            SlaveEvent::Disconnected => {
                println!("Link closed");
                break;
            }
        }
    }

    Ok(())
}
