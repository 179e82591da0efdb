//! HTTP/WebSocket surface of a background node
//!
//! Serves the approval UI boundary over REST, streams [`ApprovalView`] changes
//! over a WebSocket, and accepts remote links: a WebSocket on
//! `/v1/links/{name}` carries JSON [`Frame`]s and is handed to the background
//! node like any in-process port.
//!
//! Answering an approval over HTTP, or opening the popup link, needs the
//! configured bearer token. Without a token those routes are closed.
//!
//! ## Production Features
//!
//! - Graceful shutdown on SIGTERM/SIGINT
//! - Request timeout middleware
//! - CORS restricted to configured origins, off by default

use crate::approval::ApprovalView;
use crate::channel::ChannelAdapter;
use crate::config::RelayConfig;
use crate::envelope::Frame;
use crate::error::{ErrorPayload, RelayError};
use crate::memory::MemoryPort;
use crate::node::BackgroundNode;
use crate::types::LinkName;
use axum::{
    Json, Router,
    extract::ws::{Message, WebSocket},
    extract::{Path, State, WebSocketUpgrade},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Application state shared across handlers
pub struct AppState {
    pub node: Arc<BackgroundNode>,
    pub started_at: Instant,
    pub config: RelayConfig,
}

/// HTTP front of a [`BackgroundNode`]
pub struct RelayServer {
    state: Arc<AppState>,
}

impl RelayServer {
    pub fn new(node: Arc<BackgroundNode>, config: RelayConfig) -> Self {
        Self {
            state: Arc::new(AppState {
                node,
                started_at: Instant::now(),
                config,
            }),
        }
    }

    pub fn node(&self) -> &Arc<BackgroundNode> {
        &self.state.node
    }

    /// Build the router
    pub fn router(&self) -> Router {
        let state = Arc::clone(&self.state);
        let timeout = self.state.config.request_timeout();

        // WebSocket routes stay outside the timeout layer
        let streams = Router::new()
            .route("/v1/approval/stream", get(approval_stream))
            .route("/v1/links/:name", get(link_socket))
            .with_state(Arc::clone(&state));

        let mut router = Router::new()
            .route("/health", get(health))
            .route("/v1/approval", get(get_approval))
            .route("/v1/approval/confirm", post(confirm_approval))
            .route("/v1/approval/reject", post(reject_approval))
            .route("/v1/approval/dismiss", post(dismiss_approval))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::with_status_code(
                        StatusCode::REQUEST_TIMEOUT,
                        timeout,
                    )),
            )
            .with_state(state)
            .merge(streams);

        if let Some(cors) = cors_layer(&self.state.config) {
            router = router.layer(cors);
        }

        router
    }

    /// Serve on `addr` until Ctrl+C or SIGTERM
    pub async fn serve(self, addr: impl Into<SocketAddr>) -> anyhow::Result<()> {
        let addr = addr.into();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(address = %addr, "Starting wallet relay server");
        self.serve_with_listener(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve_with_listener<F>(
        self,
        listener: tokio::net::TcpListener,
        shutdown: F,
    ) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Shutdown signal received, closing links");
        self.state.node.shutdown();
        info!("Relay server stopped");
        Ok(())
    }
}

/// CORS for the configured origins; `None` when disabled or nothing parses
fn cors_layer(config: &RelayConfig) -> Option<CorsLayer> {
    if !config.cors_enabled {
        return None;
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring unparsable CORS origin");
                None
            }
        })
        .collect();
    if origins.is_empty() {
        warn!("CORS enabled without usable origins, leaving it off");
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
    )
}

/// Graceful shutdown signal handler
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// API error response that implements IntoResponse
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn from_relay_error(e: RelayError) -> Self {
        Self {
            status: StatusCode::from_u16(e.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: e.to_string(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Missing or invalid bearer token")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ApiResponse::<()>::error(&self.message));
        let mut response = (self.status, body).into_response();
        if self.status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer realm=\"wallet-relay\""),
            );
        }
        response
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self::from_relay_error(e)
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Confirm request
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfirmRequest {
    #[serde(default)]
    pub result: Value,
}

/// Reject request; without an error the caller gets USER_REJECT
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub error: Option<ErrorPayload>,
}

/// Outcome of an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub resolved: bool,
}

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Unwrap into the library result type
    pub fn into_result(self) -> crate::error::Result<T> {
        if self.success {
            self.data
                .ok_or_else(|| RelayError::Internal("No data in response".to_string()))
        } else {
            Err(RelayError::Internal(
                self.error.unwrap_or_else(|| "Unknown error".to_string()),
            ))
        }
    }
}

// ============================================================================
// Authentication
// ============================================================================

fn bearer_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let scheme = raw.get(..7)?;
    if !scheme.eq_ignore_ascii_case("bearer ") {
        return None;
    }
    let token = raw[7..].trim();
    (!token.is_empty()).then_some(token)
}

fn constant_time_eq(left: &str, right: &str) -> bool {
    let (left, right) = (left.as_bytes(), right.as_bytes());
    if left.len() != right.len() {
        return false;
    }
    left.iter().zip(right).fold(0_u8, |diff, (a, b)| diff | (a ^ b)) == 0
}

/// Check the bearer token of a route that can answer approvals
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.api_token.as_deref() else {
        return Err(ApiError::forbidden("Remote approval answers are disabled"));
    };
    match bearer_token_from_headers(headers) {
        Some(token) if constant_time_eq(token, expected) => Ok(()),
        _ => {
            warn!("Refusing unauthenticated approval answer");
            Err(ApiError::unauthorized())
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check (for load balancers)
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "wallet-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "content_links": state.node.content_links().len(),
        "popup_links": state.node.popup_links().len(),
        "approval_pending": state.node.broker().is_visible(),
    }))
}

async fn get_approval(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ApiResponse::success(state.node.broker().view()))
}

async fn confirm_approval(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ConfirmRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    if !state.node.broker().confirm(req.result) {
        return Err(ApiError::not_found("No pending approval"));
    }
    Ok(Json(ApiResponse::success(AnswerResponse { resolved: true })))
}

async fn reject_approval(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RejectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let error = req.error.map(RelayError::from_payload);
    if !state.node.broker().reject(error) {
        return Err(ApiError::not_found("No pending approval"));
    }
    Ok(Json(ApiResponse::success(AnswerResponse { resolved: true })))
}

/// Window closed without an answer
async fn dismiss_approval(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let resolved = state.node.broker().dismiss();
    Ok(Json(ApiResponse::success(AnswerResponse { resolved })))
}

async fn approval_stream(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_approval_stream(socket, state))
}

async fn handle_approval_stream(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut views = state.node.broker().subscribe();

    // Current view first, then every change
    let send_task = tokio::spawn(async move {
        loop {
            let view: ApprovalView = views.borrow_and_update().clone();
            if let Ok(json) = serde_json::to_string(&view)
                && sender.send(Message::Text(json.into())).await.is_err()
            {
                break;
            }
            if views.changed().await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) => break,
            Err(e) => {
                warn!(error = %e, "Approval stream error");
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
}

async fn link_socket(
    ws: WebSocketUpgrade,
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let link = LinkName::new(name);
    if !link.is_known() || link.as_str() == LinkName::INJECT_CONTENT {
        return Err(ApiError::bad_request(format!("Unknown link: {link}")));
    }
    // The popup link carries approval answers
    if link.as_str() == LinkName::BG_POPUP {
        authorize(&state, &headers)?;
    }
    Ok(ws.on_upgrade(move |socket| handle_link_socket(socket, link, state)))
}

/// Bridge a WebSocket into a port pair whose far end the node accepts
async fn handle_link_socket(socket: WebSocket, link: LinkName, state: Arc<AppState>) {
    let (local, remote) = MemoryPort::pair(link.clone());
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Frame>();
    local.on_receive(Arc::new(move |frame| {
        let _ = frames_tx.send(frame);
    }));
    state.node.accept(remote);
    info!(link = %link, "Remote link opened");

    let (mut sender, mut receiver) = socket.split();

    // Frames from the node; ends when the node drops the link
    let send_link = link.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let json = match frame.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(link = %send_link, error = %e, "Unencodable frame");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match Frame::from_json(&text) {
                Ok(frame) => {
                    if let Err(e) = local.send(frame) {
                        debug!(link = %link, error = %e, "Link closed by node");
                        break;
                    }
                }
                Err(e) => warn!(link = %link, error = %e, "Dropping undecodable frame"),
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                warn!(link = %link, error = %e, "Link socket error");
                break;
            }
            _ => {}
        }
    }

    local.disconnect();
    send_task.abort();
    info!(link = %link, "Remote link closed");
}
