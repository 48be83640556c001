use crate::error::{FleetError, FleetResult};
use crate::protocol::{Message, ToolDescriptor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;

/// Link status as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Outbound half of a slave link.
///
/// The registry only ever sends frames and closes; everything else about the
/// socket belongs to the link server.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send a frame, waiting at most the transport's write timeout.
    async fn send(&self, message: Message) -> FleetResult<()>;

    /// Close the link. Pending reads and writes unblock with an error.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Transport backed by a bounded queue drained by a per-link writer task.
pub struct ChannelTransport {
    sender: mpsc::Sender<Message>,
    closed: CancellationToken,
    write_timeout: Duration,
}

impl ChannelTransport {
    /// Create a transport and the receiving end its writer task drains.
    pub fn new(capacity: usize, write_timeout: Duration) -> (Self, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let transport = Self {
            sender,
            closed: CancellationToken::new(),
            write_timeout,
        };
        (transport, receiver)
    }

    /// Token cancelled when the transport is closed, for the reader and writer loops.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: Message) -> FleetResult<()> {
        if self.closed.is_cancelled() {
            return Err(FleetError::Transport("link closed".to_string()));
        }

        tokio::select! {
            _ = self.closed.cancelled() => Err(FleetError::Transport("link closed".to_string())),
            sent = self.sender.send_timeout(message, self.write_timeout) => match sent {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => Err(FleetError::Timeout("link write".to_string())),
                Err(SendTimeoutError::Closed(_)) => Err(FleetError::Transport("link writer gone".to_string())),
            },
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.sender.is_closed()
    }
}

#[derive(Debug)]
struct LinkState {
    tools: Vec<ToolDescriptor>,
    status: ConnectionStatus,
    last_heartbeat: DateTime<Utc>,
}

/// Mutable state of one live slave link.
///
/// Tool and heartbeat updates go through a connection-local lock so that
/// updating one slave never contends with enumerating the registry.
pub struct SlaveConnection {
    host_id: String,
    connection_id: String,
    cert_serial: String,
    connected_at: DateTime<Utc>,
    transport: std::sync::Arc<dyn Transport>,
    state: RwLock<LinkState>,
}

impl SlaveConnection {
    pub fn new(
        host_id: impl Into<String>,
        transport: std::sync::Arc<dyn Transport>,
        cert_serial: impl Into<String>,
        tools: Vec<ToolDescriptor>,
    ) -> Self {
        let now = Utc::now();
        Self {
            host_id: host_id.into(),
            connection_id: uuid::Uuid::new_v4().to_string(),
            cert_serial: cert_serial.into(),
            connected_at: now,
            transport,
            state: RwLock::new(LinkState {
                tools,
                status: ConnectionStatus::Connected,
                last_heartbeat: now,
            }),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, LinkState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, LinkState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Identifies this particular link, distinguishing it from a later reconnect of the same host.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn cert_serial(&self) -> &str {
        &self.cert_serial
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn transport(&self) -> &std::sync::Arc<dyn Transport> {
        &self.transport
    }

    /// Replace the advertised tool list.
    pub fn update_tools(&self, tools: Vec<ToolDescriptor>) {
        self.write_state().tools = tools;
    }

    /// Copy of the advertised tools; later updates do not affect it.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.read_state().tools.clone()
    }

    pub fn tool_count(&self) -> usize {
        self.read_state().tools.len()
    }

    pub fn record_heartbeat(&self) {
        self.record_heartbeat_at(Utc::now());
    }

    pub fn record_heartbeat_at(&self, at: DateTime<Utc>) {
        self.write_state().last_heartbeat = at;
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.read_state().last_heartbeat
    }

    pub fn status(&self) -> ConnectionStatus {
        self.read_state().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected && !self.transport.is_closed()
    }

    /// Mark the link dead and close its transport.
    pub(crate) fn disconnect(&self) {
        self.write_state().status = ConnectionStatus::Disconnected;
        self.transport.close();
    }

    pub async fn send(&self, message: Message) -> FleetResult<()> {
        if self.status() != ConnectionStatus::Connected {
            return Err(FleetError::NotConnected(self.host_id.clone()));
        }
        self.transport.send(message).await
    }
}

impl std::fmt::Debug for SlaveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveConnection")
            .field("host_id", &self.host_id)
            .field("connection_id", &self.connection_id)
            .field("cert_serial", &self.cert_serial)
            .field("status", &self.status())
            .finish()
    }
}
