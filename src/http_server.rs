//! HTTP front door
//!
//! Serves the daemon's health and the mail tool facade on the negotiated
//! port:
//!
//! - `GET /health`: daemon, HTTP server and mail tool summary
//! - `GET /gmail/health`: mail tool liveness and counters
//! - `GET /gmail/status`: full supervisor status with in-flight requests
//! - `POST /gmail/search`: `{query, maxResults}` through `search_emails`
//! - `POST /gmail/read`: `{messageId}` through `read_email`
//! - `POST /gmail/mcp`: raw `{method, params, timeoutMs}` JSON-RPC passthrough
//!
//! Failures answer `{"success": false, "error": ..}` with a status derived
//! from the underlying error.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::mail::{MailClientError, MailMessage, MailToolClient, SearchParams};
use crate::net::PortResolution;
use crate::rpc::RpcError;
use crate::rpc::protocol::JsonRpcErrorCode;
use crate::rpc::registry::PendingInfo;
use crate::supervisor::StatusSnapshot;

// ============================================================================
// State
// ============================================================================

/// Shared by every handler
#[derive(Clone)]
pub struct AppState {
    client: MailToolClient,
    resolution: Arc<PortResolution>,
    started: Instant,
    startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(client: MailToolClient, resolution: PortResolution) -> Self {
        Self {
            client,
            resolution: Arc::new(resolution),
            started: Instant::now(),
            startup_time: Utc::now(),
        }
    }
}

/// Build the router with its middleware stack
pub fn router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    Router::new()
        .route("/health", get(health))
        .route("/gmail/health", get(mail_health))
        .route("/gmail/status", get(mail_status))
        .route("/gmail/search", post(search))
        .route("/gmail/read", post(read))
        .route("/gmail/mcp", post(passthrough))
        .layer(middleware)
        .with_state(state)
}

pub struct HttpServer {
    listener: TcpListener,
    state: AppState,
}

impl HttpServer {
    pub fn new(listener: TcpListener, resolution: PortResolution, client: MailToolClient) -> Self {
        Self {
            listener,
            state: AppState::new(client, resolution),
        }
    }

    /// Serve until `shutdown` is cancelled
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<std::io::Result<()>> {
        let port = self.state.resolution.chosen_port;
        let app = router(self.state);
        tokio::spawn(async move {
            info!("HTTP server listening on port {}", port);
            axum::serve(self.listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await?;
            info!("HTTP server stopped");
            Ok(())
        })
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failure of one HTTP request
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    BadRequest {
        code: JsonRpcErrorCode,
        message: String,
    },

    #[error("Mail tool is not running")]
    NotRunning,

    #[error(transparent)]
    Mail(#[from] MailClientError),
}

impl ApiError {
    fn invalid_params(message: &str) -> Self {
        ApiError::BadRequest {
            code: JsonRpcErrorCode::InvalidParams,
            message: message.to_string(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Mail(MailClientError::Rpc(RpcError::Timeout { .. })) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ApiError::Mail(MailClientError::Rpc(e)) if e.is_transient() => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Mail(MailClientError::Tool { .. }) => StatusCode::BAD_GATEWAY,
            ApiError::Mail(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> Option<i64> {
        match self {
            ApiError::BadRequest { code, .. } => Some(*code as i64),
            ApiError::Mail(MailClientError::Rpc(e)) => Some(e.code()),
            _ => None,
        }
    }

    fn hint(&self) -> Option<String> {
        match self {
            ApiError::NotRunning => RpcError::NotRunning.hint(),
            ApiError::Mail(MailClientError::Rpc(e)) => e.hint(),
            ApiError::Mail(MailClientError::Supervisor(e)) => e.hint(),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed ({}): {}", status, self);
        } else {
            warn!("Request rejected ({}): {}", status, self);
        }
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
            code: self.code(),
            hint: self.hint(),
        };
        (status, Json(body)).into_response()
    }
}

/// Parse a request body; an empty body means all defaults
fn parse_body<T: DeserializeOwned + Default>(body: &str) -> Result<T, ApiError> {
    if body.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(body).map_err(|e| ApiError::BadRequest {
        code: JsonRpcErrorCode::ParseError,
        message: format!("Parse error: {e}"),
    })
}

fn ensure_running(state: &AppState) -> Result<(), ApiError> {
    if state.client.is_running() {
        Ok(())
    } else {
        Err(ApiError::NotRunning)
    }
}

// ============================================================================
// Health and status
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: DateTime<Utc>,
    http_server: HttpServerHealth,
    gmail_mcp: MailToolSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpServerHealth {
    running: bool,
    port: u16,
    startup_time: DateTime<Utc>,
    /// Seconds since the server started
    uptime: u64,
    resolution: PortResolution,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MailToolSummary {
    running: bool,
    pid: Option<u32>,
    port: Option<u16>,
    request_count: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.client.supervisor().status();
    Json(HealthResponse {
        status: "ok",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
        http_server: HttpServerHealth {
            running: true,
            port: state.resolution.chosen_port,
            startup_time: state.startup_time,
            uptime: state.started.elapsed().as_secs(),
            resolution: state.resolution.as_ref().clone(),
        },
        gmail_mcp: MailToolSummary {
            running: status.running,
            pid: status.pid,
            port: status.port,
            request_count: status.request_count,
        },
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MailToolHealth {
    status: &'static str,
    running: bool,
    pid: Option<u32>,
    port: Option<u16>,
    uptime_ms: Option<u64>,
    request_count: u64,
    error_count: u64,
    last_error: Option<String>,
    restart_count: u32,
}

async fn mail_health(State(state): State<AppState>) -> Json<MailToolHealth> {
    let status = state.client.supervisor().status();
    Json(MailToolHealth {
        status: if status.running { "healthy" } else { "unhealthy" },
        running: status.running,
        pid: status.pid,
        port: status.port,
        uptime_ms: status.uptime_ms,
        request_count: status.request_count,
        error_count: status.error_count,
        last_error: status.last_error,
        restart_count: status.restart_count,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MailToolStatus {
    configured: bool,
    #[serde(flatten)]
    status: StatusSnapshot,
    pending: Vec<PendingInfo>,
}

async fn mail_status(State(state): State<AppState>) -> Json<MailToolStatus> {
    let supervisor = state.client.supervisor();
    Json(MailToolStatus {
        configured: true,
        status: supervisor.status(),
        pending: supervisor.pending_requests(),
    })
}

// ============================================================================
// Mail operations
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest {
    query: Option<String>,
    max_results: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    success: bool,
    results: Vec<MailMessage>,
    count: usize,
}

async fn search(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<SearchResponse>, ApiError> {
    let request: SearchRequest = parse_body(&body)?;
    ensure_running(&state)?;

    info!(
        "Search request: {}, max: {:?}",
        request.query.as_deref().unwrap_or("all"),
        request.max_results
    );
    let results = state
        .client
        .search_emails(&SearchParams {
            query: request.query,
            max_results: request.max_results,
        })
        .await?;

    Ok(Json(SearchResponse {
        success: true,
        count: results.len(),
        results,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadRequest {
    message_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReadResponse {
    success: bool,
    email: MailMessage,
}

async fn read(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<ReadResponse>, ApiError> {
    let request: ReadRequest = parse_body(&body)?;
    let message_id = request
        .message_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::invalid_params("messageId is required"))?;
    ensure_running(&state)?;

    info!("Read request: {}", message_id);
    let email = state.client.read_email(&message_id).await?;
    Ok(Json(ReadResponse {
        success: true,
        email,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PassthroughRequest {
    method: Option<String>,
    #[serde(default)]
    params: Value,
    timeout_ms: Option<u64>,
}

async fn passthrough(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let request: PassthroughRequest = parse_body(&body)?;
    let method = request
        .method
        .filter(|method| !method.trim().is_empty())
        .ok_or_else(|| ApiError::invalid_params("method is required"))?;
    ensure_running(&state)?;

    info!(
        "Passthrough request: {} (mail tool PID {:?})",
        method,
        state.client.supervisor().pid()
    );
    let result = state
        .client
        .send_request(
            &method,
            request.params,
            request.timeout_ms.map(Duration::from_millis),
        )
        .await?;
    Ok(Json(json!({ "success": true, "result": result })))
}
