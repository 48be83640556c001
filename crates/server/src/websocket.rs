use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use fleetlink_core::protocol::{HOST_HEADER, SERIAL_HEADER};
use fleetlink_core::{ChannelTransport, LinkServer, LinkSession, Message, Transport};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::api::{ApiError, ErrorResponse};
use crate::config::AppState;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Slave link endpoint. The credential is checked before the upgrade.
pub async fn slave_connect(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let (Some(host_id), Some(cert_serial)) =
        (header(&headers, HOST_HEADER), header(&headers, SERIAL_HEADER))
    else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new("missing slave credentials")),
        )
            .into_response();
    };

    let config = state.link.config();
    let (transport, outbound) = ChannelTransport::new(config.send_queue, config.write_timeout);
    let transport = Arc::new(transport);

    let session = match state.link.accept(host_id, cert_serial, transport.clone()) {
        Ok(session) => session,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let link = state.link.clone();
    ws.on_upgrade(move |socket| run_link(socket, link, session, transport, outbound))
}

/// Pump one slave link until either side closes it.
async fn run_link(
    socket: WebSocket,
    link: Arc<LinkServer>,
    mut session: LinkSession,
    transport: Arc<ChannelTransport>,
    mut outbound: mpsc::Receiver<Message>,
) {
    let (mut sink, mut stream) = socket.split();
    let closed = transport.closed_token();
    let shutdown = link.shutdown_token();
    let host_id = session.host_id().to_string();

    tracing::info!(host_id = %host_id, "Slave link opened");

    let writer = {
        let closed = closed.clone();
        let host_id = host_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    frame = outbound.recv() => match frame {
                        Some(message) => match message.to_json() {
                            Ok(text) => {
                                if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                                    tracing::warn!(host_id = %host_id, "Slave link write failed: {}", e);
                                    break;
                                }
                            }
                            Err(e) => tracing::error!(host_id = %host_id, "Failed to encode frame: {}", e),
                        },
                        None => break,
                    },
                }
            }
            closed.cancel();
            let _ = sink.close().await;
        })
    };

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = shutdown.cancelled() => break,
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Err(e) = link.handle_text(&mut session, text.as_str()).await {
                        tracing::warn!(host_id = %host_id, "Slave link unwritable: {}", e);
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(host_id = %host_id, "Slave link read failed: {}", e);
                    break;
                }
            },
        }
    }

    if let Some(connection_id) = session.connection_id() {
        link.link_closed(&host_id, connection_id);
    }
    transport.close();
    let _ = writer.await;

    tracing::info!(host_id = %host_id, "Slave link terminated");
}

#[cfg(test)]
mod tests {
    use crate::api::create_router;
    use crate::config::{AppState, ServerConfig};
    use async_trait::async_trait;
    use fleetlink_core::InMemorySlaveStore;
    use fleetlink_sdk::{LocalTools, SdkError, SdkResult, SlaveClient, SlaveConfig, ToolDescriptor};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite;

    struct EchoTools;

    #[async_trait]
    impl LocalTools for EchoTools {
        async fn list_tools(&self) -> Vec<ToolDescriptor> {
            vec![json!({"name": "echo", "inputSchema": {"type": "object"}})]
        }

        async fn call_tool(&self, tool: &str, arguments: Value) -> SdkResult<Value> {
            match tool {
                "echo" => Ok(arguments),
                other => Err(SdkError::ToolFailed(format!("unknown tool: {}", other))),
            }
        }
    }

    async fn spawn_master() -> (SocketAddr, Arc<AppState>) {
        let state = Arc::new(
            AppState::with_store(&ServerConfig::default(), Arc::new(InMemorySlaveStore::new()))
                .unwrap(),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (addr, state)
    }

    fn slave_config(addr: SocketAddr, host: &str, serial: &str) -> SlaveConfig {
        SlaveConfig::new(&format!("http://{}", addr), host, serial).unwrap()
    }

    async fn wait_disconnected(state: &AppState, host: &str) {
        for _ in 0..100 {
            if !state.registry.is_connected(host) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} still connected", host);
    }

    fn rejection_status(err: SdkError) -> String {
        match err {
            SdkError::Rejected(msg) => msg,
            other => panic!("expected a rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slave_registers_and_answers_tool_calls() {
        let (addr, state) = spawn_master().await;
        let record = state
            .manager
            .pairing()
            .issue_credential("alpha", "linux")
            .unwrap();

        let link = SlaveClient::connect(
            slave_config(addr, "alpha", &record.cert_serial),
            Arc::new(EchoTools),
        )
        .await
        .unwrap();

        assert!(link.connection_id().is_some());
        assert!(state.registry.is_connected("alpha"));

        let result = state
            .link
            .send_tool_call("alpha", "echo", json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"text": "hi"}));

        link.close();
        wait_disconnected(&state, "alpha").await;
    }

    #[tokio::test]
    async fn test_missing_headers_are_unauthorized() {
        let (addr, state) = spawn_master().await;

        let url = format!("ws://{}/slave/connect", addr);
        match tokio_tungstenite::connect_async(url).await {
            Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
            Err(other) => panic!("unexpected handshake error: {}", other),
            Ok(_) => panic!("handshake without credentials succeeded"),
        }
        assert!(!state.registry.is_connected("alpha"));
    }

    #[tokio::test]
    async fn test_wrong_serial_is_forbidden() {
        let (addr, state) = spawn_master().await;
        state
            .manager
            .pairing()
            .issue_credential("alpha", "linux")
            .unwrap();

        let err = SlaveClient::connect(slave_config(addr, "alpha", "not-the-serial"), Arc::new(EchoTools))
            .await
            .err()
            .unwrap();
        assert!(rejection_status(err).contains("403"));
        assert!(!state.registry.is_connected("alpha"));
    }

    #[tokio::test]
    async fn test_revoked_serial_is_forbidden() {
        let (addr, state) = spawn_master().await;
        let record = state
            .manager
            .pairing()
            .issue_credential("alpha", "linux")
            .unwrap();
        state
            .manager
            .revoke_credential("alpha", "decommissioned")
            .unwrap();

        let err = SlaveClient::connect(
            slave_config(addr, "alpha", &record.cert_serial),
            Arc::new(EchoTools),
        )
        .await
        .err()
        .unwrap();
        assert!(rejection_status(err).contains("403"));
        assert!(!state.registry.is_connected("alpha"));
    }
}
