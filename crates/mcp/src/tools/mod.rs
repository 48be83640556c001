pub mod fleet;
mod registry;

pub use fleet::{fleet_server, RevokedListTool, SlavesListTool, FLEET_SERVER};
pub use registry::{json_schema_boolean, json_schema_object, Tool, ToolRegistry};
