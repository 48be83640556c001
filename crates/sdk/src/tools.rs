//! Tools a slave serves to its master.

use crate::error::SdkResult;
use async_trait::async_trait;
use fleetlink_core::ToolDescriptor;
use serde_json::Value;

/// Executor for the slave's own tools.
///
/// `list_tools` is advertised at registration; `call_tool` answers the
/// master's `tool_call` frames. A returned error is reported back to the
/// master as a failed call and does not close the link.
#[async_trait]
pub trait LocalTools: Send + Sync {
    async fn list_tools(&self) -> Vec<ToolDescriptor>;

    async fn call_tool(&self, tool: &str, arguments: Value) -> SdkResult<Value>;
}

/// A slave that serves nothing and only consumes master tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTools;

#[async_trait]
impl LocalTools for NoTools {
    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        Vec::new()
    }

    async fn call_tool(&self, tool: &str, _arguments: Value) -> SdkResult<Value> {
        Err(crate::error::SdkError::ToolFailed(format!("unknown tool: {}", tool)))
    }
}
