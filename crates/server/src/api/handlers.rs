use super::ApiResult;
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use fleetlink_core::metrics::MetricsSnapshot;
use fleetlink_core::{FleetError, RevokedCredential, SlaveInfo, SlaveRecord, ToolDescriptor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "fleetlink",
        "version": env!("CARGO_PKG_VERSION"),
        "slaves_connected": state.registry.get_connected_slaves().len(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListSlavesResponse {
    pub slaves: Vec<SlaveInfo>,
}

/// List every known slave with its live status
pub async fn list_slaves(State(state): State<Arc<AppState>>) -> ApiResult<Json<ListSlavesResponse>> {
    let slaves = state.registry.get_all_slaves()?;
    Ok(Json(ListSlavesResponse { slaves }))
}

/// Get a single slave
pub async fn get_slave(
    State(state): State<Arc<AppState>>,
    Path(host): Path<String>,
) -> ApiResult<Json<SlaveInfo>> {
    let slave = state
        .registry
        .get_slave(&host)?
        .ok_or_else(|| FleetError::NotFound(format!("slave {}", host)))?;
    Ok(Json(slave))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PairRequest {
    pub hostname: String,
    #[serde(default = "default_platform")]
    pub platform: String,
}

fn default_platform() -> String {
    "unknown".to_string()
}

/// Issue (or rotate) the credential of a slave
pub async fn pair_slave(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PairRequest>,
) -> ApiResult<Json<SlaveRecord>> {
    let record = state
        .manager
        .pairing()
        .issue_credential(&req.hostname, &req.platform)?;
    Ok(Json(record))
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RevokeRequest {
    #[serde(default)]
    pub reason: String,
}

/// Revoke a slave's credential and drop its link
pub async fn revoke_slave(
    State(state): State<Arc<AppState>>,
    Path(host): Path<String>,
    Json(req): Json<RevokeRequest>,
) -> ApiResult<Json<RevokedCredential>> {
    let reason = if req.reason.is_empty() {
        "revoked by operator"
    } else {
        req.reason.as_str()
    };
    let entry = state.manager.revoke_credential(&host, reason)?;
    Ok(Json(entry))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub host: String,
    pub command: String,
    pub status: String,
}

impl CommandResponse {
    fn sent(host: String, command: &str) -> Self {
        Self {
            host,
            command: command.to_string(),
            status: "sent".to_string(),
        }
    }
}

pub async fn restart_slave(
    State(state): State<Arc<AppState>>,
    Path(host): Path<String>,
) -> ApiResult<Json<CommandResponse>> {
    state.manager.restart_slave(&host).await?;
    Ok(Json(CommandResponse::sent(host, "restart")))
}

pub async fn upgrade_slave(
    State(state): State<Arc<AppState>>,
    Path(host): Path<String>,
) -> ApiResult<Json<CommandResponse>> {
    state.manager.upgrade_slave(&host).await?;
    Ok(Json(CommandResponse::sent(host, "upgrade")))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRevokedResponse {
    pub revoked: Vec<RevokedCredential>,
}

pub async fn list_revoked(State(state): State<Arc<AppState>>) -> ApiResult<Json<ListRevokedResponse>> {
    let revoked = state.manager.list_revoked_credentials()?;
    Ok(Json(ListRevokedResponse { revoked }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ToolsQuery {
    pub context: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListToolsResponse {
    pub count: usize,
    pub tools: Vec<ToolDescriptor>,
}

/// Every routable tool, optionally filtered by context
pub async fn list_tools(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ToolsQuery>,
) -> Json<ListToolsResponse> {
    let tools = state.proxy.list_all_tools(query.context.as_deref()).await;
    Json(ListToolsResponse {
        count: tools.len(),
        tools,
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    #[serde(flatten)]
    pub snapshot: MetricsSnapshot,
    pub dropped_notifications: u64,
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        snapshot: state.registry.metrics().snapshot(),
        dropped_notifications: state.registry.dropped_notifications(),
    })
}

#[cfg(test)]
mod tests {
    use crate::api::create_router;
    use crate::config::{AppState, ServerConfig};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        Router,
    };
    use fleetlink_core::{ChannelTransport, InMemorySlaveStore};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<AppState>) {
        let state = Arc::new(
            AppState::with_store(&ServerConfig::default(), Arc::new(InMemorySlaveStore::new()))
                .unwrap(),
        );
        (create_router(state.clone()), state)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _state) = app();
        let (status, body) = call(&app, "GET", "/api/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["slaves_connected"], 0);
    }

    #[tokio::test]
    async fn test_pair_then_list() {
        let (app, _state) = app();

        let (status, record) = call(
            &app,
            "POST",
            "/api/slaves/pair",
            Some(json!({"hostname": "alpha", "platform": "darwin"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["cert_serial"].as_str().unwrap().len(), 32);

        let (status, body) = call(&app, "GET", "/api/slaves", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["slaves"][0]["host_id"], "alpha");
        assert_eq!(body["slaves"][0]["status"], "disconnected");

        let (status, slave) = call(&app, "GET", "/api/slaves/alpha", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(slave["platform"], "darwin");
    }

    #[tokio::test]
    async fn test_unknown_slave_is_404() {
        let (app, _state) = app();

        let (status, body) = call(&app, "GET", "/api/slaves/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("ghost"));

        let (status, _) = call(&app, "POST", "/api/slaves/ghost/restart", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "POST", "/api/slaves/ghost/revoke", Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upgrade_connected_slave() {
        let (app, state) = app();
        let (transport, mut rx) = ChannelTransport::new(4, Duration::from_secs(1));
        state
            .registry
            .register("alpha", Arc::new(transport), "s", vec![])
            .unwrap();

        let (status, body) = call(&app, "POST", "/api/slaves/alpha/upgrade", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["command"], "upgrade");
        assert_eq!(
            rx.recv().await.unwrap().message_type,
            fleetlink_core::MessageType::Upgrade
        );
    }

    #[tokio::test]
    async fn test_revoke_flow() {
        let (app, state) = app();
        call(&app, "POST", "/api/slaves/pair", Some(json!({"hostname": "alpha"}))).await;

        let (status, entry) = call(
            &app,
            "POST",
            "/api/slaves/alpha/revoke",
            Some(json!({"reason": "decommissioned"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(entry["reason"], "decommissioned");

        let (_, body) = call(&app, "GET", "/api/revoked", None).await;
        assert_eq!(body["revoked"].as_array().unwrap().len(), 1);

        let serial = entry["cert_serial"].as_str().unwrap();
        assert!(state.manager.pairing().authenticate("alpha", serial).is_err());
    }

    #[tokio::test]
    async fn test_tools_include_fleet_server() {
        let (app, _state) = app();
        let (status, body) = call(&app, "GET", "/api/tools", None).await;

        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body["tools"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert!(names.contains(&"fleet_slaves_list"));
        assert!(names.contains(&"fleet_revoked_list"));
    }

    #[tokio::test]
    async fn test_metrics_report_drops() {
        let (app, _state) = app();
        let (status, body) = call(&app, "GET", "/api/metrics", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dropped_notifications"], 0);
        assert!(body["counters"].is_array());
    }
}
