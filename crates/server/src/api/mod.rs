use crate::config::AppState;
use crate::websocket;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fleetlink_core::FleetError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Serve `app` on `addr` until `shutdown` resolves
pub async fn serve(
    addr: &str,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Admin API and slave links on one listener
pub fn create_router(state: Arc<AppState>) -> Router {
    with_layers(admin_routes().merge(link_routes()), state)
}

/// Admin API only, used when slave links get their own port
pub fn create_admin_router(state: Arc<AppState>) -> Router {
    with_layers(admin_routes(), state)
}

pub fn create_link_router(state: Arc<AppState>) -> Router {
    with_layers(link_routes(), state)
}

fn admin_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(handlers::health_check))
        .route("/api/slaves", get(handlers::list_slaves))
        .route("/api/slaves/pair", post(handlers::pair_slave))
        .route("/api/slaves/{host}", get(handlers::get_slave))
        .route("/api/slaves/{host}/revoke", post(handlers::revoke_slave))
        .route("/api/slaves/{host}/restart", post(handlers::restart_slave))
        .route("/api/slaves/{host}/upgrade", post(handlers::upgrade_slave))
        .route("/api/revoked", get(handlers::list_revoked))
        .route("/api/tools", get(handlers::list_tools))
        .route("/api/metrics", get(handlers::metrics))
}

fn link_routes() -> Router<Arc<AppState>> {
    Router::new().route("/slave/connect", get(websocket::slave_connect))
}

fn with_layers(router: Router<Arc<AppState>>, state: Arc<AppState>) -> Router {
    router
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Custom error type for API handlers
pub struct ApiError(anyhow::Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<FleetError>() {
            Some(FleetError::NotConnected(_)) | Some(FleetError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(FleetError::NotInitialized(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Some(FleetError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Some(FleetError::Unauthorized(_)) | Some(FleetError::Revoked(_)) => StatusCode::FORBIDDEN,
            Some(FleetError::Conflict(_)) => StatusCode::CONFLICT,
            Some(FleetError::Protocol(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_msg = self.0.to_string();
        let details = self.0.chain().skip(1).map(|e| e.to_string()).collect::<Vec<_>>().join(": ");

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        if status.is_server_error() {
            tracing::error!(status = %status, "API error: {}", response.error);
        }

        (status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
