//! Slave side of the master link.

use crate::config::SlaveConfig;
use crate::error::{SdkError, SdkResult};
use crate::tools::LocalTools;
use fleetlink_core::protocol::{
    ErrorPayload, MasterToolCallPayload, MasterToolsPayload, RegisterPayload, ToolCallPayload,
    ToolCallResponse, HOST_HEADER, SERIAL_HEADER,
};
use fleetlink_core::{Message, MessageType, ToolDescriptor};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{
    self, client::IntoClientRequest, http::HeaderValue, Message as WsMessage,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const OUTBOUND_QUEUE: usize = 64;

/// Something the master asked of this slave, or a change in the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlaveEvent {
    Restart,
    Upgrade,
    /// A new master tool inventory replaced the previous one.
    MasterToolsUpdated { tool_count: usize },
    /// The link closed. No further events follow.
    Disconnected,
}

/// Connects a slave to its master.
pub struct SlaveClient;

impl SlaveClient {
    /// Open the link, register and start heartbeating.
    ///
    /// Fails with [`SdkError::Rejected`] when the master refuses the
    /// credential or the registration.
    pub async fn connect(config: SlaveConfig, tools: Arc<dyn LocalTools>) -> SdkResult<SlaveLink> {
        let url = config.link_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SdkError::WebSocket(e.to_string()))?;
        request
            .headers_mut()
            .insert(HOST_HEADER, header_value(&config.host_id)?);
        request
            .headers_mut()
            .insert(SERIAL_HEADER, header_value(&config.cert_serial)?);

        debug!(url = %url, host_id = %config.host_id, "Connecting to master");
        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(handshake_error)?;
        let (mut write, mut read) = ws_stream.split();

        let (link, mut outbound) = SlaveLink::new(config, tools);

        let closed = link.inner.closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    frame = outbound.recv() => match frame {
                        Some(message) => match message.to_json() {
                            Ok(text) => {
                                if let Err(e) = write.send(WsMessage::Text(text)).await {
                                    warn!(error = %e, "Failed to send frame to master");
                                    break;
                                }
                            }
                            Err(e) => error!(error = %e, "Failed to encode frame"),
                        },
                        None => break,
                    },
                }
            }
            closed.cancel();
            let _ = write.close().await;
        });

        let inner = link.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.closed.cancelled() => break,
                    incoming = read.next() => match incoming {
                        Some(Ok(WsMessage::Text(text))) => match Message::from_json(&text) {
                            Ok(message) => inner.handle_frame(message),
                            Err(e) => warn!(error = %e, "Discarding frame from master"),
                        },
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "Master link read failed");
                            break;
                        }
                    },
                }
            }
            inner.shutdown();
            info!(host_id = %inner.config.host_id, "Master link closed");
        });

        if let Err(e) = link.register().await {
            link.close();
            return Err(e);
        }
        link.start_heartbeat();

        info!(host_id = %link.host_id(), "Registered with master");
        Ok(link)
    }
}

fn header_value(value: &str) -> SdkResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| SdkError::Config(format!("invalid header value: {}", e)))
}

fn handshake_error(err: tungstenite::Error) -> SdkError {
    match err {
        tungstenite::Error::Http(response) => {
            SdkError::Rejected(format!("master answered {}", response.status()))
        }
        other => SdkError::WebSocket(other.to_string()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type PendingMap = HashMap<String, oneshot::Sender<Message>>;

struct LinkInner {
    config: SlaveConfig,
    tools: Arc<dyn LocalTools>,
    outbound: mpsc::Sender<Message>,
    pending: Mutex<PendingMap>,
    master_tools: RwLock<MasterToolsPayload>,
    connection_id: RwLock<Option<String>>,
    events: Mutex<Option<mpsc::Sender<SlaveEvent>>>,
    closed: CancellationToken,
}

/// Removes a pending request when its waiter goes away.
struct PendingGuard<'a> {
    pending: &'a Mutex<PendingMap>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

impl LinkInner {
    async fn send(&self, message: Message) -> SdkResult<()> {
        if self.closed.is_cancelled() {
            return Err(SdkError::NotConnected);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| SdkError::NotConnected)
    }

    /// Send `message` with a fresh id and wait for the correlated reply.
    async fn request(&self, message: Message) -> SdkResult<Message> {
        if self.closed.is_cancelled() {
            return Err(SdkError::NotConnected);
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        self.send(message.with_id(id)).await?;

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SdkError::NotConnected),
            Err(_) => Err(SdkError::Timeout),
        }
    }

    fn handle_frame(self: &Arc<Self>, message: Message) {
        match message.message_type {
            MessageType::ToolCall => self.spawn_tool_call(message),
            MessageType::Response | MessageType::Error => self.complete_pending(message),
            MessageType::MasterTools => match message.decode_data::<MasterToolsPayload>() {
                Ok(inventory) => {
                    let tool_count = inventory.tool_count();
                    *self
                        .master_tools
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = inventory;
                    debug!(tool_count, "Master tool inventory updated");
                    self.emit(SlaveEvent::MasterToolsUpdated { tool_count });
                }
                Err(e) => warn!(error = %e, "Discarding master tool inventory"),
            },
            MessageType::Restart => self.emit(SlaveEvent::Restart),
            MessageType::Upgrade => self.emit(SlaveEvent::Upgrade),
            other => debug!(kind = %other, "Ignoring frame from master"),
        }
    }

    fn complete_pending(&self, message: Message) {
        let Some(id) = message.id.clone() else {
            if message.message_type == MessageType::Error {
                warn!(data = %message.data, "Master reported an error");
            }
            return;
        };

        match lock(&self.pending).remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(message);
            }
            None => debug!(id = %id, "Discarding uncorrelated reply"),
        }
    }

    fn spawn_tool_call(self: &Arc<Self>, message: Message) {
        let inner = self.clone();
        let Some(id) = message.id.clone() else {
            warn!("Refusing tool_call without correlation id");
            tokio::spawn(async move {
                let _ = inner
                    .send(Message::error(None, "missing correlation id"))
                    .await;
            });
            return;
        };

        tokio::spawn(async move {
            let response = match message.decode_data::<ToolCallPayload>() {
                Ok(call) => {
                    debug!(tool = %call.tool, "Executing tool for master");
                    match inner.tools.call_tool(&call.tool, call.arguments).await {
                        Ok(result) => ToolCallResponse::ok(result),
                        Err(SdkError::ToolFailed(msg)) => ToolCallResponse::failed(msg),
                        Err(e) => ToolCallResponse::failed(e.to_string()),
                    }
                }
                Err(e) => ToolCallResponse::failed(e.to_string()),
            };

            match Message::response(Some(id), response) {
                Ok(reply) => {
                    if inner.send(reply).await.is_err() {
                        debug!("Link closed before tool result could be sent");
                    }
                }
                Err(e) => error!(error = %e, "Failed to encode tool result"),
            }
        });
    }

    fn emit(&self, event: SlaveEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            if events.try_send(event.clone()).is_err() {
                warn!(event = ?event, "Slave event dropped, receiver is behind");
            }
        }
    }

    /// Close the link once: fail waiters, then signal `Disconnected`.
    fn shutdown(&self) {
        self.closed.cancel();
        lock(&self.pending).clear();
        if let Some(events) = lock(&self.events).take() {
            let _ = events.try_send(SlaveEvent::Disconnected);
        }
    }
}

/// A registered link to the master. Dropping it closes the link.
pub struct SlaveLink {
    inner: Arc<LinkInner>,
    events: mpsc::Receiver<SlaveEvent>,
}

impl SlaveLink {
    fn new(config: SlaveConfig, tools: Arc<dyn LocalTools>) -> (Self, mpsc::Receiver<Message>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (events_tx, events) = mpsc::channel(config.event_capacity.max(1));

        let inner = Arc::new(LinkInner {
            config,
            tools,
            outbound,
            pending: Mutex::new(HashMap::new()),
            master_tools: RwLock::new(MasterToolsPayload::default()),
            connection_id: RwLock::new(None),
            events: Mutex::new(Some(events_tx)),
            closed: CancellationToken::new(),
        });

        (Self { inner, events }, outbound_rx)
    }

    pub fn host_id(&self) -> &str {
        &self.inner.config.host_id
    }

    /// Connection id assigned by the master at registration.
    pub fn connection_id(&self) -> Option<String> {
        self.inner
            .connection_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.inner.shutdown();
    }

    /// Next restart/upgrade/inventory event. `None` once the link is gone.
    pub async fn next_event(&mut self) -> Option<SlaveEvent> {
        self.events.recv().await
    }

    /// The latest master tool inventory.
    pub fn master_tools(&self) -> MasterToolsPayload {
        self.inner
            .master_tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Master servers and their tools visible under `context`.
    pub fn master_tools_for_context(&self, context: &str) -> BTreeMap<String, Vec<ToolDescriptor>> {
        let inventory = self
            .inner
            .master_tools
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        inventory
            .servers_for_context(context)
            .into_iter()
            .filter_map(|name| {
                inventory
                    .servers
                    .get(name)
                    .map(|tools| (name.to_string(), tools.clone()))
            })
            .collect()
    }

    /// Invoke a tool served by the master.
    pub async fn call_master_tool(&self, server: &str, tool: &str, arguments: Value) -> SdkResult<Value> {
        let message = Message::new(
            MessageType::MasterToolCall,
            MasterToolCallPayload {
                server: server.to_string(),
                tool: tool.to_string(),
                arguments,
            },
        )?;

        let reply = self.inner.request(message).await?;
        if reply.message_type == MessageType::Error {
            let payload: ErrorPayload = reply.decode_data()?;
            return Err(SdkError::ToolFailed(payload.error));
        }

        Ok(reply.decode_data::<ToolCallResponse>()?.into_result()?)
    }

    /// Advertise a changed tool set.
    pub async fn update_tools(&self, tools: Vec<ToolDescriptor>) -> SdkResult<()> {
        let message = Message::new(MessageType::ToolUpdate, serde_json::json!({ "tools": tools }))?;
        self.inner.send(message).await
    }

    async fn register(&self) -> SdkResult<()> {
        let payload = RegisterPayload {
            hostname: self.inner.config.host_id.clone(),
            version: self.inner.config.version.clone(),
            tools: self.inner.tools.list_tools().await,
        };

        let reply = self
            .inner
            .request(Message::new(MessageType::Register, payload)?)
            .await?;
        if reply.message_type == MessageType::Error {
            let payload: ErrorPayload = reply.decode_data()?;
            return Err(SdkError::Rejected(payload.error));
        }

        let connection_id = reply
            .data
            .get("connection_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        *self
            .inner
            .connection_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = connection_id;

        Ok(())
    }

    fn start_heartbeat(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let period = inner.config.heartbeat_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = inner.closed.cancelled() => break,
                    _ = ticker.tick() => {
                        if inner.send(Message::bare(MessageType::Heartbeat)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

impl Drop for SlaveLink {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}
