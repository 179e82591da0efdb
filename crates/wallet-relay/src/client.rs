//! Client side of the relay server
//!
//! [`WebSocketConnector`] opens links to a remote background node, each one a
//! WebSocket bridged into an in-process port so a [`ConnectionManager`] can
//! drive it like any other adapter. [`ApprovalClient`] talks to the approval
//! REST endpoints and the approval stream.
//!
//! [`ConnectionManager`]: crate::connection::ConnectionManager

use crate::approval::ApprovalView;
use crate::channel::{ChannelAdapter, Connector};
use crate::envelope::Frame;
use crate::error::{ErrorPayload, INTERNAL_ERROR, RelayError, Result};
use crate::memory::MemoryPort;
use crate::types::LinkName;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Relay client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay server URL (HTTP)
    pub url: String,
    /// WebSocket URL (optional, derived from url if not set)
    pub ws_url: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Bearer token for answering approvals and opening the popup link
    pub api_token: Option<String>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            ws_url: None,
            timeout_secs: 30,
            api_token: None,
        }
    }

    /// Set WebSocket URL
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = Some(url.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    /// WebSocket handshake request carrying the bearer token when one is set
    fn ws_request(&self, url: &str) -> Result<Request> {
        let mut request = url
            .into_client_request()
            .map_err(|e| RelayError::Network(format!("{url}: {e}")))?;
        if let Some(token) = &self.api_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| RelayError::InvalidConfig(format!("api token: {e}")))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }
        Ok(request)
    }

    /// Get WebSocket URL
    pub fn get_ws_url(&self) -> String {
        self.ws_url.clone().unwrap_or_else(|| {
            self.url
                .replace("http://", "ws://")
                .replace("https://", "wss://")
        })
    }
}

/// API response structure
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T> {
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

#[derive(Debug, Deserialize)]
struct Answer {
    resolved: bool,
}

// ============================================================================
// Approval REST client
// ============================================================================

/// HTTP client for the approval UI boundary
pub struct ApprovalClient {
    config: ClientConfig,
    client: Client,
}

impl ApprovalClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RelayError::Network(e.to_string()))?;
        Ok(Self { config, client })
    }

    /// Create with default configuration
    pub fn with_url(url: impl Into<String>) -> Result<Self> {
        Self::new(ClientConfig::new(url))
    }

    /// Check server health
    pub async fn health(&self) -> Result<Value> {
        let url = format!("{}/health", self.config.url);
        self.client
            .get(&url)
            .send()
            .await
            .map_err(|e| RelayError::Network(e.to_string()))?
            .json()
            .await
            .map_err(|e| RelayError::Network(e.to_string()))
    }

    /// Current approval view
    pub async fn view(&self) -> Result<ApprovalView> {
        let url = format!("{}/v1/approval", self.config.url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RelayError::Network(e.to_string()))?;
        Self::decode::<ApprovalView>(response).await?.into_result()
    }

    /// Confirm the pending approval; `false` when nothing was pending
    pub async fn confirm(&self, result: Value) -> Result<bool> {
        self.answer("confirm", json!({ "result": result })).await
    }

    /// Reject the pending approval, with USER_REJECT unless `error` is given
    pub async fn reject(&self, error: Option<ErrorPayload>) -> Result<bool> {
        self.answer("reject", json!({ "error": error })).await
    }

    /// Report the approval window as closed
    pub async fn dismiss(&self) -> Result<bool> {
        self.answer("dismiss", json!({})).await
    }

    async fn answer(&self, verb: &str, body: Value) -> Result<bool> {
        let url = format!("{}/v1/approval/{verb}", self.config.url);
        let mut request = self.client.post(&url).json(&body);
        if let Some(token) = &self.config.api_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RelayError::Network(e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => return Ok(false),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let status = response.status();
                let reason = Self::decode::<Answer>(response)
                    .await
                    .ok()
                    .and_then(|body| body.error)
                    .unwrap_or_else(|| status.to_string());
                return Err(RelayError::Remote {
                    code: INTERNAL_ERROR,
                    message: format!("Answer refused: {reason}"),
                });
            }
            _ => {}
        }
        Ok(Self::decode::<Answer>(response).await?.into_result()?.resolved)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<ApiResponse<T>> {
        response
            .json()
            .await
            .map_err(|e| RelayError::Network(e.to_string()))
    }

    /// Stream approval views: the current one first, then every change
    pub async fn watch(&self) -> Result<mpsc::UnboundedReceiver<ApprovalView>> {
        let ws_url = format!("{}/v1/approval/stream", self.config.get_ws_url());
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| RelayError::Network(format!("WebSocket connection failed: {e}")))?;
        info!(url = %ws_url, "Connected to approval stream");

        let (tx, rx) = mpsc::unbounded_channel();
        let (_write, mut read) = ws_stream.split();

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ApprovalView>(&text) {
                        Ok(view) => {
                            if tx.send(view).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Undecodable approval view"),
                    },
                    Ok(Message::Close(_)) => {
                        info!("Approval stream closed by server");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Approval stream error");
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(rx)
    }
}

// ============================================================================
// Remote links
// ============================================================================

/// Opens links to a background node served over WebSocket
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: ClientConfig,
}

impl WebSocketConnector {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn link_url(&self, link: &LinkName) -> String {
        format!("{}/v1/links/{link}", self.config.get_ws_url())
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, link: &LinkName) -> Result<Arc<dyn ChannelAdapter>> {
        let url = self.link_url(link);
        let request = self.config.ws_request(&url)?;
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| RelayError::ChannelClosed(format!("{link}: {e}")))?;
        debug!(url = %url, "Remote link connected");

        let (mut write, mut read) = ws_stream.split();
        let (local, remote) = MemoryPort::pair(link.clone());

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Frame>();
        remote.on_receive(Arc::new(move |frame| {
            let _ = frames_tx.send(frame);
        }));

        // Frames from the local end; ends once the local end disconnects
        let write_link = link.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                let json = match frame.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(link = %write_link, error = %e, "Unencodable frame");
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        let read_link = link.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Frame::from_json(&text) {
                        Ok(frame) => {
                            if remote.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(link = %read_link, error = %e, "Dropping undecodable frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        warn!(link = %read_link, error = %e, "Remote link error");
                        break;
                    }
                    _ => {}
                }
            }
            remote.disconnect();
            writer.abort();
            debug!(link = %read_link, "Remote link closed");
        });

        Ok(local)
    }
}
