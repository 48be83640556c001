//! # Fleetlink SDK
//!
//! Slave-side client for a fleetlink master.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fleetlink_sdk::{NoTools, SdkResult, SlaveClient, SlaveConfig, SlaveEvent};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> SdkResult<()> {
//!     let config = SlaveConfig::new("http://master:8080", "build-01", "3f2a...")?;
//!     let mut link = SlaveClient::connect(config, Arc::new(NoTools)).await?;
//!
//!     let slaves = link
//!         .call_master_tool("fleet", "slaves_list", serde_json::json!({}))
//!         .await?;
//!     println!("{}", slaves);
//!
//!     while let Some(event) = link.next_event().await {
//!         match event {
//!             SlaveEvent::Restart => println!("restart requested"),
//!             SlaveEvent::Disconnected => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod link;
pub mod tools;

pub use config::SlaveConfig;
pub use error::{SdkError, SdkResult};
pub use link::{SlaveClient, SlaveEvent, SlaveLink};
pub use tools::{LocalTools, NoTools};

// Re-export protocol types slaves deal with
pub use fleetlink_core::protocol::MasterToolsPayload;
pub use fleetlink_core::ToolDescriptor;
