//! Master side of the slave link.
//!
//! [`LinkServer`] knows nothing about sockets. A transport front end (the
//! websocket handler in `fleetlink-server`) authenticates the peer with
//! [`LinkServer::accept`], feeds every decoded frame to
//! [`LinkServer::handle_frame`] and calls [`LinkServer::link_closed`] when its
//! read loop ends.

use crate::connection::{SlaveConnection, Transport};
use crate::error::{FleetError, FleetResult};
use crate::metrics;
use crate::pairing::PairingService;
use crate::protocol::{
    ErrorPayload, MasterToolCallPayload, Message, MessageType, RegisterPayload, ToolCallPayload,
    ToolCallResponse, ToolDescriptor,
};
use crate::proxy::ToolProxy;
use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Request and write deadlines for link traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// How long a correlated request waits for its reply
    pub request_timeout: Duration,
    /// How long a single frame may wait for the writer
    pub write_timeout: Duration,
    /// Outbound frames buffered per link
    pub send_queue: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            send_queue: 64,
        }
    }
}

/// An authenticated link, before and after its `register` frame.
pub struct LinkSession {
    host_id: String,
    cert_serial: String,
    transport: Arc<dyn Transport>,
    connection_id: Option<String>,
}

impl LinkSession {
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn cert_serial(&self) -> &str {
        &self.cert_serial
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Set once the slave has registered.
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }
}

struct PendingCall {
    host_id: String,
    connection_id: String,
    reply: oneshot::Sender<Message>,
}

type PendingMap = HashMap<String, PendingCall>;

/// Removes a pending entry when the waiting caller finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<PendingMap>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// `tool_update` also accepts `{"tools": [...]}`.
#[derive(Deserialize)]
struct ToolsEnvelope {
    tools: Vec<ToolDescriptor>,
}

pub struct LinkServer {
    registry: Arc<Registry>,
    proxy: Arc<dyn ToolProxy>,
    pairing: Arc<PairingService>,
    config: LinkConfig,
    pending: Mutex<PendingMap>,
    shutdown: CancellationToken,
}

impl LinkServer {
    pub fn new(
        registry: Arc<Registry>,
        proxy: Arc<dyn ToolProxy>,
        pairing: Arc<PairingService>,
        config: LinkConfig,
    ) -> Self {
        Self {
            registry,
            proxy,
            pairing,
            config,
            pending: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Cancelled by [`LinkServer::stop`]; read loops select on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Requests still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending().len()
    }

    /// Authenticate a new link. Nothing is registered until the slave sends `register`.
    pub fn accept(
        &self,
        host_id: &str,
        cert_serial: &str,
        transport: Arc<dyn Transport>,
    ) -> FleetResult<LinkSession> {
        if self.is_stopped() {
            return Err(FleetError::Transport("link server stopped".to_string()));
        }

        if let Err(e) = self.pairing.authenticate(host_id, cert_serial) {
            tracing::warn!(host_id = %host_id, "Rejected slave link: {}", e);
            return Err(e);
        }

        tracing::debug!(host_id = %host_id, "Slave link authenticated");
        Ok(LinkSession {
            host_id: host_id.to_string(),
            cert_serial: cert_serial.to_string(),
            transport,
            connection_id: None,
        })
    }

    /// Decode and dispatch one text frame. Malformed frames are answered with `error`.
    pub async fn handle_text(self: &Arc<Self>, session: &mut LinkSession, text: &str) -> FleetResult<()> {
        match Message::from_json(text) {
            Ok(message) => self.handle_frame(session, message).await,
            Err(e) => {
                tracing::warn!(host_id = %session.host_id, "Malformed frame: {}", e);
                self.reply_error(session, None, e.to_string()).await
            }
        }
    }

    /// Dispatch one frame from `session`.
    ///
    /// Protocol faults are answered on the link and return `Ok`; an `Err` means
    /// the link itself can no longer be written and the read loop should end.
    pub async fn handle_frame(self: &Arc<Self>, session: &mut LinkSession, message: Message) -> FleetResult<()> {
        tracing::trace!(host_id = %session.host_id, kind = %message.message_type, "Link frame");

        if message.message_type.expects_reply() && message.id.is_none() {
            tracing::warn!(host_id = %session.host_id, kind = %message.message_type, "Request without correlation id");
            return self
                .reply_error(session, None, "missing correlation id".to_string())
                .await;
        }

        match message.message_type {
            MessageType::Register => self.handle_register(session, message).await,
            MessageType::Heartbeat => self.handle_heartbeat(session, message).await,
            MessageType::ToolUpdate => self.handle_tool_update(session, message).await,
            MessageType::Response | MessageType::Error => {
                self.complete_pending(session, message);
                Ok(())
            }
            MessageType::MasterToolCall => {
                if self.current_connection(session).is_none() {
                    return self
                        .reply_error(session, message.id, "not registered".to_string())
                        .await;
                }
                self.spawn_master_tool_call(session, message);
                Ok(())
            }
            other => {
                tracing::warn!(host_id = %session.host_id, kind = %other, "Unexpected frame from slave");
                self.reply_error(session, message.id, format!("unexpected message type: {}", other))
                    .await
            }
        }
    }

    async fn reply_error(&self, session: &LinkSession, id: Option<String>, error: String) -> FleetResult<()> {
        session.transport.send(Message::error(id, error)).await
    }

    /// The registry entry for this session, if it is still the live one.
    fn current_connection(&self, session: &LinkSession) -> Option<Arc<SlaveConnection>> {
        let connection_id = session.connection_id.as_deref()?;
        self.registry
            .get_connection(&session.host_id)
            .filter(|conn| conn.connection_id() == connection_id)
    }

    async fn handle_register(&self, session: &mut LinkSession, message: Message) -> FleetResult<()> {
        let payload: RegisterPayload = match message.decode_data() {
            Ok(payload) => payload,
            Err(e) => return self.reply_error(session, message.id, e.to_string()).await,
        };

        if !payload.hostname.is_empty() && payload.hostname != session.host_id {
            tracing::warn!(
                host_id = %session.host_id,
                claimed = %payload.hostname,
                "Register hostname does not match credential"
            );
            return self
                .reply_error(session, message.id, "hostname does not match credential".to_string())
                .await;
        }

        // A repeated register on the live link only refreshes its tools
        if let Some(conn) = self.current_connection(session) {
            tracing::info!(host_id = %session.host_id, tools = payload.tools.len(), "Slave re-registered on live link");
            if let Err(e) = self.registry.update_tools(&session.host_id, payload.tools) {
                return self.reply_error(session, message.id, e.to_string()).await;
            }
            self.persist_version(&session.host_id, &payload.version);
            let ack = Message::response(
                message.id,
                json!({ "status": "registered", "connection_id": conn.connection_id() }),
            )?;
            return conn.send(ack).await;
        }

        let conn = match self.registry.register(
            &session.host_id,
            session.transport.clone(),
            &session.cert_serial,
            payload.tools,
        ) {
            Ok(conn) => conn,
            Err(e) => return self.reply_error(session, message.id, e.to_string()).await,
        };
        session.connection_id = Some(conn.connection_id().to_string());

        self.persist_version(&session.host_id, &payload.version);

        tracing::info!(
            host_id = %session.host_id,
            version = %payload.version,
            tools = conn.tool_count(),
            "Slave registered"
        );

        let ack = Message::response(
            message.id,
            json!({ "status": "registered", "connection_id": conn.connection_id() }),
        )?;
        conn.send(ack).await?;

        if let Err(e) = self.push_master_tools(&session.host_id).await {
            tracing::warn!(host_id = %session.host_id, "Failed to push master tools: {}", e);
        }
        Ok(())
    }

    fn persist_version(&self, host_id: &str, version: &str) {
        if version.is_empty() {
            return;
        }
        if let Err(e) = self.registry.store().update_slave_version(host_id, version) {
            tracing::warn!(host_id = %host_id, "Failed to persist slave version: {:#}", e);
        }
    }

    async fn handle_heartbeat(&self, session: &LinkSession, message: Message) -> FleetResult<()> {
        if self.current_connection(session).is_none() {
            return self
                .reply_error(session, message.id, "not registered".to_string())
                .await;
        }

        match self.registry.update_heartbeat(&session.host_id) {
            Ok(()) => Ok(()),
            Err(e) => self.reply_error(session, message.id, e.to_string()).await,
        }
    }

    async fn handle_tool_update(&self, session: &LinkSession, message: Message) -> FleetResult<()> {
        if self.current_connection(session).is_none() {
            return self
                .reply_error(session, message.id, "not registered".to_string())
                .await;
        }

        let tools = match &message.data {
            Value::Array(tools) => tools.clone(),
            _ => match message.decode_data::<ToolsEnvelope>() {
                Ok(envelope) => envelope.tools,
                Err(e) => return self.reply_error(session, message.id, e.to_string()).await,
            },
        };

        tracing::info!(host_id = %session.host_id, tools = tools.len(), "Slave tools updated");
        match self.registry.update_tools(&session.host_id, tools) {
            Ok(()) => Ok(()),
            Err(e) => self.reply_error(session, message.id, e.to_string()).await,
        }
    }

    /// Hand a `response` or `error` frame to the caller waiting on its id.
    fn complete_pending(&self, session: &LinkSession, message: Message) {
        let Some(id) = message.id.clone() else {
            if message.message_type == MessageType::Error {
                tracing::warn!(host_id = %session.host_id, data = %message.data, "Slave reported error");
            }
            return;
        };

        let call = {
            let mut pending = self.pending();
            match pending.get(&id) {
                Some(call)
                    if call.host_id == session.host_id
                        && session.connection_id.as_deref() == Some(call.connection_id.as_str()) =>
                {
                    pending.remove(&id)
                }
                _ => None,
            }
        };

        match call {
            Some(call) => {
                self.registry.record_response(&session.host_id);
                if call.reply.send(message).is_err() {
                    tracing::debug!(id = %id, "Caller gone before reply arrived");
                }
            }
            None => {
                tracing::debug!(host_id = %session.host_id, id = %id, "Discarding late or unknown reply");
            }
        }
    }

    /// Run a master-local tool for the slave without blocking its read loop.
    fn spawn_master_tool_call(self: &Arc<Self>, session: &LinkSession, message: Message) {
        let server = self.clone();
        let transport = session.transport.clone();
        let host_id = session.host_id.clone();

        tokio::spawn(async move {
            let reply = match message.decode_data::<MasterToolCallPayload>() {
                Err(e) => Message::error(message.id.clone(), e.to_string()),
                Ok(call) => {
                    tracing::info!(
                        host_id = %host_id,
                        server = %call.server,
                        tool = %call.tool,
                        "Slave calling master tool"
                    );
                    let response = match server
                        .proxy
                        .call_master_tool(&call.server, &call.tool, call.arguments)
                        .await
                    {
                        Ok(result) => ToolCallResponse::ok(result),
                        Err(e) => ToolCallResponse::failed(e.to_string()),
                    };
                    Message::response(message.id.clone(), response)
                        .unwrap_or_else(|e| Message::error(message.id.clone(), e.to_string()))
                }
            };

            if let Err(e) = transport.send(reply).await {
                tracing::warn!(host_id = %host_id, "Failed to answer master tool call: {}", e);
            }
        });
    }

    /// Invoke `tool` on the slave and wait for its correlated reply.
    pub async fn send_tool_call(&self, host_id: &str, tool: &str, arguments: Value) -> FleetResult<Value> {
        let conn = self
            .registry
            .get_connection(host_id)
            .ok_or_else(|| FleetError::NotConnected(host_id.to_string()))?;

        let id = format!("{}-{}", host_id, uuid::Uuid::new_v4());
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending().insert(
            id.clone(),
            PendingCall {
                host_id: host_id.to_string(),
                connection_id: conn.connection_id().to_string(),
                reply: reply_tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        let request = Message::new(
            MessageType::ToolCall,
            ToolCallPayload {
                tool: tool.to_string(),
                arguments,
            },
        )?
        .with_id(id.as_str());
        conn.send(request).await?;

        let reply = tokio::select! {
            _ = self.shutdown.cancelled() => {
                return Err(FleetError::Transport("link server stopped".to_string()));
            }
            reply = tokio::time::timeout(self.config.request_timeout, reply_rx) => match reply {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => {
                    return Err(FleetError::Transport(format!("link to {} closed before reply", host_id)));
                }
                Err(_) => {
                    self.registry.metrics().increment_counter(metrics::TOOL_CALL_TIMEOUTS);
                    tracing::warn!(host_id = %host_id, tool = %tool, "Tool call timed out");
                    return Err(FleetError::Timeout(format!("tool call {} on {}", tool, host_id)));
                }
            },
        };

        match reply.message_type {
            MessageType::Error => {
                let error = reply
                    .decode_data::<ErrorPayload>()
                    .map(|payload| payload.error)
                    .unwrap_or_else(|_| reply.data.to_string());
                Err(FleetError::ToolFailed(error))
            }
            _ => reply.decode_data::<ToolCallResponse>()?.into_result(),
        }
    }

    async fn send_control(&self, host_id: &str, message_type: MessageType) -> FleetResult<()> {
        let conn = self
            .registry
            .get_connection(host_id)
            .ok_or_else(|| FleetError::NotConnected(host_id.to_string()))?;

        conn.send(Message::bare(message_type)).await?;
        tracing::info!(host_id = %host_id, command = %message_type, "Sent control command");
        Ok(())
    }

    pub async fn send_restart_command(&self, host_id: &str) -> FleetResult<()> {
        self.send_control(host_id, MessageType::Restart).await
    }

    pub async fn send_upgrade_command(&self, host_id: &str) -> FleetResult<()> {
        self.send_control(host_id, MessageType::Upgrade).await
    }

    /// Send the master's local tool inventory to one slave.
    pub async fn push_master_tools(&self, host_id: &str) -> FleetResult<()> {
        let conn = self
            .registry
            .get_connection(host_id)
            .ok_or_else(|| FleetError::NotConnected(host_id.to_string()))?;

        let inventory = self.proxy.master_inventory().await?;
        let count = inventory.tool_count();
        conn.send(Message::new(MessageType::MasterTools, &inventory)?)
            .await?;

        tracing::debug!(host_id = %host_id, tools = count, "Pushed master tools");
        Ok(())
    }

    /// Push the master inventory to every connected slave. Returns how many succeeded.
    pub async fn broadcast_master_tools(&self) -> usize {
        let mut delivered = 0;
        for conn in self.registry.get_connected_slaves() {
            match self.push_master_tools(conn.host_id()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(host_id = %conn.host_id(), "Failed to push master tools: {}", e)
                }
            }
        }
        delivered
    }

    /// A read loop ended. Only removes the registry entry if it still belongs
    /// to this link, and fails every request still waiting on it.
    pub fn link_closed(&self, host_id: &str, connection_id: &str) {
        if self.registry.unregister_connection(host_id, connection_id) {
            tracing::info!(host_id = %host_id, "Slave link closed");
        } else {
            tracing::debug!(host_id = %host_id, connection_id = %connection_id, "Closed link was already replaced");
        }

        self.pending()
            .retain(|_, call| call.connection_id != connection_id);
    }

    /// Close every live link and refuse new ones.
    pub fn stop(&self) {
        self.shutdown.cancel();
        let closed = self.registry.disconnect_all();
        self.pending().clear();
        tracing::info!("Link server stopped, closed {} link(s)", closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelTransport;
    use crate::protocol::MasterToolsPayload;
    use crate::proxy::ProxyClient;
    use crate::registry::RegistryConfig;
    use crate::store::InMemorySlaveStore;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    struct EchoProxy;

    #[async_trait]
    impl ToolProxy for EchoProxy {
        fn register_slave_client(&self, _host_id: &str, _client: Arc<dyn ProxyClient>) -> FleetResult<()> {
            Ok(())
        }

        fn unregister_slave_client(&self, _host_id: &str) -> FleetResult<()> {
            Ok(())
        }

        fn get_client(&self, _host_id: &str) -> Option<Arc<dyn ProxyClient>> {
            None
        }

        fn slave_hosts(&self) -> Vec<String> {
            Vec::new()
        }

        async fn call_master_tool(&self, server: &str, tool: &str, arguments: Value) -> FleetResult<Value> {
            if server == "local" && tool == "echo" {
                Ok(json!({ "echo": arguments }))
            } else {
                Err(FleetError::NotFound(format!("{}_{}", server, tool)))
            }
        }

        async fn master_inventory(&self) -> FleetResult<MasterToolsPayload> {
            Ok(MasterToolsPayload {
                servers: BTreeMap::from([("local".to_string(), vec![json!({"name": "echo"})])]),
                context_mappings: BTreeMap::new(),
            })
        }
    }

    struct Harness {
        server: Arc<LinkServer>,
        registry: Arc<Registry>,
        pairing: Arc<PairingService>,
    }

    fn harness(config: LinkConfig) -> Harness {
        let store = Arc::new(InMemorySlaveStore::new());
        let registry = Arc::new(Registry::new(store.clone(), RegistryConfig::default()));
        let pairing = Arc::new(PairingService::new(store));
        let server = Arc::new(LinkServer::new(
            registry.clone(),
            Arc::new(EchoProxy),
            pairing.clone(),
            config,
        ));
        Harness {
            server,
            registry,
            pairing,
        }
    }

    fn connect(h: &Harness, host: &str) -> (LinkSession, mpsc::Receiver<Message>) {
        let record = h.pairing.issue_credential(host, "linux").unwrap();
        let (transport, rx) = ChannelTransport::new(16, Duration::from_secs(1));
        let session = h
            .server
            .accept(host, &record.cert_serial, Arc::new(transport))
            .unwrap();
        (session, rx)
    }

    async fn register(
        h: &Harness,
        session: &mut LinkSession,
        rx: &mut mpsc::Receiver<Message>,
        tools: Vec<ToolDescriptor>,
    ) {
        let hostname = session.host_id().to_string();
        let frame = Message::new(
            MessageType::Register,
            RegisterPayload {
                hostname,
                version: "1.4.0".to_string(),
                tools,
            },
        )
        .unwrap()
        .with_id("reg-1");
        h.server.handle_frame(session, frame).await.unwrap();

        let ack = rx.recv().await.unwrap();
        assert_eq!(ack.message_type, MessageType::Response);
        assert_eq!(ack.id.as_deref(), Some("reg-1"));
        assert_eq!(ack.data["status"], "registered");

        let inventory = rx.recv().await.unwrap();
        assert_eq!(inventory.message_type, MessageType::MasterTools);
    }

    #[tokio::test]
    async fn test_register_acks_and_pushes_inventory() {
        let h = harness(LinkConfig::default());
        let (mut session, mut rx) = connect(&h, "alpha");

        register(&h, &mut session, &mut rx, vec![json!({"name": "t1"})]).await;

        assert!(h.registry.is_connected("alpha"));
        assert!(session.connection_id().is_some());
        let record = h.pairing.store().get_slave_server("alpha").unwrap().unwrap();
        assert_eq!(record.version, "1.4.0");
    }

    #[tokio::test]
    async fn test_accept_rejects_bad_serial() {
        let h = harness(LinkConfig::default());
        h.pairing.issue_credential("alpha", "linux").unwrap();
        let (transport, _rx) = ChannelTransport::new(4, Duration::from_secs(1));

        let err = h
            .server
            .accept("alpha", "not-the-serial", Arc::new(transport))
            .err()
            .unwrap();
        assert!(matches!(err, FleetError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_hostname_mismatch_is_refused() {
        let h = harness(LinkConfig::default());
        let (mut session, mut rx) = connect(&h, "alpha");

        let frame = Message::new(
            MessageType::Register,
            RegisterPayload {
                hostname: "mallory".to_string(),
                version: String::new(),
                tools: vec![],
            },
        )
        .unwrap()
        .with_id("reg-m");
        h.server.handle_frame(&mut session, frame).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().message_type, MessageType::Error);
        assert!(!h.registry.is_connected("alpha"));
        assert!(!h.registry.is_connected("mallory"));
    }

    #[tokio::test]
    async fn test_frames_before_register_get_error() {
        let h = harness(LinkConfig::default());
        let (mut session, mut rx) = connect(&h, "alpha");

        h.server
            .handle_frame(&mut session, Message::bare(MessageType::Heartbeat))
            .await
            .unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.message_type, MessageType::Error);
        assert_eq!(reply.data["error"], "not registered");
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames() {
        let h = harness(LinkConfig::default());
        let (mut session, mut rx) = connect(&h, "alpha");

        h.server.handle_text(&mut session, "{not json").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().message_type, MessageType::Error);

        h.server
            .handle_text(&mut session, r#"{"type":"teleport","id":"x1"}"#)
            .await
            .unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.message_type, MessageType::Error);
        assert_eq!(reply.id.as_deref(), Some("x1"));
    }

    #[tokio::test]
    async fn test_tool_update_accepts_bare_array() {
        let h = harness(LinkConfig::default());
        let (mut session, mut rx) = connect(&h, "alpha");
        register(&h, &mut session, &mut rx, vec![]).await;

        let update = Message::new(
            MessageType::ToolUpdate,
            vec![json!({"name": "t1"}), json!({"name": "t2"})],
        )
        .unwrap();
        h.server.handle_frame(&mut session, update).await.unwrap();

        assert_eq!(h.registry.get_connection("alpha").unwrap().tool_count(), 2);
    }

    #[tokio::test]
    async fn test_tool_call_round_trip() {
        let h = harness(LinkConfig::default());
        let (mut session, mut rx) = connect(&h, "alpha");
        register(&h, &mut session, &mut rx, vec![json!({"name": "t1"})]).await;

        let server = h.server.clone();
        let responder = tokio::spawn(async move {
            let call = rx.recv().await.unwrap();
            assert_eq!(call.message_type, MessageType::ToolCall);
            assert!(call.id.as_deref().unwrap().starts_with("alpha-"));

            let payload: ToolCallPayload = call.decode_data().unwrap();
            let reply = Message::response(
                call.id.clone(),
                ToolCallResponse::ok(json!({ "ran": payload.tool })),
            )
            .unwrap();
            server.handle_frame(&mut session, reply).await.unwrap();
        });

        let result = h
            .server
            .send_tool_call("alpha", "t1", json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result["ran"], "t1");
        assert_eq!(h.server.pending_calls(), 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_tool_call_failure_reply() {
        let h = harness(LinkConfig::default());
        let (mut session, mut rx) = connect(&h, "alpha");
        register(&h, &mut session, &mut rx, vec![]).await;

        let server = h.server.clone();
        let responder = tokio::spawn(async move {
            let call = rx.recv().await.unwrap();
            let reply = Message::error(call.id.clone(), "disk full");
            server.handle_frame(&mut session, reply).await.unwrap();
        });

        let err = h
            .server
            .send_tool_call("alpha", "t1", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::ToolFailed(msg) if msg == "disk full"));
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_call_times_out() {
        let h = harness(LinkConfig::default());
        let (mut session, mut rx) = connect(&h, "alpha");
        register(&h, &mut session, &mut rx, vec![]).await;

        let err = h
            .server
            .send_tool_call("alpha", "slow", json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::Timeout(_)));
        assert_eq!(h.server.pending_calls(), 0);
        assert_eq!(h.registry.metrics().counter(metrics::TOOL_CALL_TIMEOUTS), 1);

        // the late reply is discarded
        let call = rx.recv().await.unwrap();
        let late = Message::response(call.id, ToolCallResponse::ok(json!(1))).unwrap();
        h.server.handle_frame(&mut session, late).await.unwrap();
    }

    #[tokio::test]
    async fn test_tool_call_to_absent_host() {
        let h = harness(LinkConfig::default());
        let err = h
            .server
            .send_tool_call("ghost", "t1", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_master_tool_call_is_answered() {
        let h = harness(LinkConfig::default());
        let (mut session, mut rx) = connect(&h, "alpha");
        register(&h, &mut session, &mut rx, vec![]).await;

        let call = Message::new(
            MessageType::MasterToolCall,
            MasterToolCallPayload {
                server: "local".to_string(),
                tool: "echo".to_string(),
                arguments: json!({"q": "hi"}),
            },
        )
        .unwrap()
        .with_id("m-1");
        h.server.handle_frame(&mut session, call).await.unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.id.as_deref(), Some("m-1"));
        let response: ToolCallResponse = reply.decode_data().unwrap();
        assert!(response.success);
        assert_eq!(response.result.unwrap()["echo"]["q"], "hi");

        let missing = Message::new(
            MessageType::MasterToolCall,
            MasterToolCallPayload {
                server: "local".to_string(),
                tool: "nope".to_string(),
                arguments: Value::Null,
            },
        )
        .unwrap()
        .with_id("m-2");
        h.server.handle_frame(&mut session, missing).await.unwrap();

        let response: ToolCallResponse = rx.recv().await.unwrap().decode_data().unwrap();
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_superseded_link_close_keeps_replacement() {
        let h = harness(LinkConfig::default());
        let record = h.pairing.issue_credential("alpha", "linux").unwrap();

        let mut sessions = Vec::new();
        for _ in 0..2 {
            let (transport, mut rx) = ChannelTransport::new(16, Duration::from_secs(1));
            let mut session = h
                .server
                .accept("alpha", &record.cert_serial, Arc::new(transport))
                .unwrap();
            register(&h, &mut session, &mut rx, vec![]).await;
            sessions.push((session, rx));
        }

        let (old, _) = &sessions[0];
        assert!(old.transport().is_closed());
        h.server
            .link_closed("alpha", old.connection_id().unwrap());

        let (new, _) = &sessions[1];
        assert!(h.registry.is_connected("alpha"));
        assert_eq!(
            h.registry.get_connection("alpha").unwrap().connection_id(),
            new.connection_id().unwrap()
        );
    }

    #[tokio::test]
    async fn test_restart_and_upgrade_commands() {
        let h = harness(LinkConfig::default());
        let (mut session, mut rx) = connect(&h, "alpha");
        register(&h, &mut session, &mut rx, vec![]).await;

        h.server.send_restart_command("alpha").await.unwrap();
        h.server.send_upgrade_command("alpha").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().message_type, MessageType::Restart);
        assert_eq!(rx.recv().await.unwrap().message_type, MessageType::Upgrade);

        assert!(matches!(
            h.server.send_restart_command("ghost").await,
            Err(FleetError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_closes_links_and_refuses_new_ones() {
        let h = harness(LinkConfig::default());
        let (mut session, mut rx) = connect(&h, "alpha");
        register(&h, &mut session, &mut rx, vec![]).await;

        h.server.stop();

        assert!(!h.registry.is_connected("alpha"));
        assert!(session.transport().is_closed());
        let record = h.pairing.issue_credential("beta", "linux").unwrap();
        let (transport, _rx) = ChannelTransport::new(4, Duration::from_secs(1));
        assert!(h
            .server
            .accept("beta", &record.cert_serial, Arc::new(transport))
            .is_err());
    }

    #[tokio::test]
    async fn test_request_without_id_is_refused() {
        let h = harness(LinkConfig::default());
        let (mut session, mut rx) = connect(&h, "alpha");
        register(&h, &mut session, &mut rx, vec![]).await;

        let call = Message::new(
            MessageType::MasterToolCall,
            MasterToolCallPayload {
                server: "local".to_string(),
                tool: "echo".to_string(),
                arguments: json!({}),
            },
        )
        .unwrap();
        h.server.handle_frame(&mut session, call).await.unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.message_type, MessageType::Error);
        assert!(reply.id.is_none());
        assert_eq!(reply.data["error"], "missing correlation id");

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_register_without_id_is_refused() {
        let h = harness(LinkConfig::default());
        let (mut session, mut rx) = connect(&h, "alpha");

        let frame = Message::new(
            MessageType::Register,
            RegisterPayload {
                hostname: "alpha".to_string(),
                version: String::new(),
                tools: vec![],
            },
        )
        .unwrap();
        h.server.handle_frame(&mut session, frame).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().data["error"], "missing correlation id");
        assert!(!h.registry.is_connected("alpha"));
    }

    #[tokio::test]
    async fn test_reregister_on_live_link_refreshes_tools() {
        let h = harness(LinkConfig::default());
        let (mut session, mut rx) = connect(&h, "alpha");
        register(&h, &mut session, &mut rx, vec![json!({"name": "t1"})]).await;
        let connection_id = session.connection_id().unwrap().to_string();

        let again = Message::new(
            MessageType::Register,
            RegisterPayload {
                hostname: "alpha".to_string(),
                version: "1.5.0".to_string(),
                tools: vec![json!({"name": "t1"}), json!({"name": "t2"})],
            },
        )
        .unwrap()
        .with_id("reg-2");
        h.server.handle_frame(&mut session, again).await.unwrap();

        let ack = rx.recv().await.unwrap();
        assert_eq!(ack.message_type, MessageType::Response);
        assert_eq!(ack.id.as_deref(), Some("reg-2"));
        assert_eq!(ack.data["connection_id"], connection_id.as_str());

        assert!(!session.transport().is_closed());
        assert_eq!(session.connection_id(), Some(connection_id.as_str()));
        let conn = h.registry.get_connection("alpha").unwrap();
        assert_eq!(conn.connection_id(), connection_id);
        assert_eq!(conn.tool_count(), 2);
        let record = h.pairing.store().get_slave_server("alpha").unwrap().unwrap();
        assert_eq!(record.version, "1.5.0");
    }

    #[tokio::test]
    async fn test_reply_from_superseded_link_is_ignored() {
        let h = harness(LinkConfig::default());
        let record = h.pairing.issue_credential("alpha", "linux").unwrap();

        let (transport, mut old_rx) = ChannelTransport::new(16, Duration::from_secs(1));
        let mut old = h
            .server
            .accept("alpha", &record.cert_serial, Arc::new(transport))
            .unwrap();
        register(&h, &mut old, &mut old_rx, vec![]).await;

        let (transport, mut new_rx) = ChannelTransport::new(16, Duration::from_secs(1));
        let mut new = h
            .server
            .accept("alpha", &record.cert_serial, Arc::new(transport))
            .unwrap();
        register(&h, &mut new, &mut new_rx, vec![]).await;

        let server = h.server.clone();
        let call = tokio::spawn(async move { server.send_tool_call("alpha", "t1", json!({})).await });

        let frame = new_rx.recv().await.unwrap();
        assert_eq!(frame.message_type, MessageType::ToolCall);

        let stale = Message::response(frame.id.clone(), ToolCallResponse::ok(json!("stale"))).unwrap();
        h.server.handle_frame(&mut old, stale).await.unwrap();
        assert_eq!(h.server.pending_calls(), 1);

        let fresh = Message::response(frame.id, ToolCallResponse::ok(json!("fresh"))).unwrap();
        h.server.handle_frame(&mut new, fresh).await.unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!("fresh"));
        assert_eq!(h.server.pending_calls(), 0);
    }
}
