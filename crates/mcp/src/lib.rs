// MCP surface of the fleet master: routes tools across local servers and
// connected slaves and serves them to agent clients

pub mod protocol;
pub mod proxy;
pub mod server;
pub mod tools;

pub use proxy::{LocalServer, McpProxy};
pub use server::McpServer;
