// Fleet coordination core: slave registry, liveness, link protocol and manager

pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod link;
pub mod manager;
pub mod metrics;
pub mod pairing;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod store;

pub use connection::{ChannelTransport, ConnectionStatus, SlaveConnection, Transport};
pub use error::{FleetError, FleetResult};
pub use link::{LinkConfig, LinkServer, LinkSession};
pub use manager::{Manager, ManagerHandle};
pub use pairing::PairingService;
pub use protocol::{Message, MessageType, ToolDescriptor};
pub use proxy::{ProxyClient, SlaveProxyClient, ToolProxy};
pub use registry::{NotificationKind, Registry, RegistryConfig, RegistryNotification, SlaveInfo};
pub use store::{InMemorySlaveStore, RedbSlaveStore, RevokedCredential, SlaveRecord, SlaveStore};
