//! Caller-side request/response correlation
//!
//! A [`MessageTransport`] stamps each outgoing request with a fresh message id,
//! registers a pending call under it before sending, and completes that call
//! when an envelope with the same id comes back. Events are fire-and-forget in
//! both directions and never occupy a pending slot.

use crate::connection::LinkState;
use crate::envelope::{Envelope, new_message_id};
use crate::error::{RelayError, Result};
use crate::router::{LocalHandler, Outbound, ReplyTo};
use crate::types::{Context, MessageType};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 256;

/// Pending-call table for one context
pub struct MessageTransport {
    context: Context,
    outbound: Arc<dyn Outbound>,
    pending: DashMap<String, oneshot::Sender<Result<Value>>>,
    events: broadcast::Sender<Envelope>,
    response_timeout: Duration,
}

impl MessageTransport {
    pub fn new(context: Context, outbound: Arc<dyn Outbound>, response_timeout: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            context,
            outbound,
            pending: DashMap::new(),
            events,
            response_timeout,
        })
    }

    pub fn context(&self) -> Context {
        self.context
    }

    /// Send a REQUEST and wait for its response
    pub async fn request(&self, action: impl Into<String>, data: Value, to: Context) -> Result<Value> {
        self.call(Envelope::request(action, data, self.context, to)).await
    }

    /// Send an APPROVE envelope and wait for the human's answer
    pub async fn approve(&self, action: impl Into<String>, data: Value, to: Context) -> Result<Value> {
        self.call(Envelope::approve(action, data, self.context, to)).await
    }

    /// Send any request-shaped envelope and wait for the correlated response.
    ///
    /// A message id is assigned when the envelope has none.
    pub async fn call(&self, mut envelope: Envelope) -> Result<Value> {
        if !envelope.kind.expects_response() {
            return Err(RelayError::MalformedEnvelope(format!(
                "{}: events have no response",
                envelope.action
            )));
        }

        let message_id = match envelope.message_id() {
            Some(id) => id.to_string(),
            None => {
                let id = new_message_id();
                envelope = envelope.with_message_id(id.clone());
                id
            }
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(message_id.clone(), tx);
        debug!(context = %self.context, message_id = %message_id, action = %envelope.action, "Sending request");

        if let Err(e) = self.outbound.deliver(envelope).await {
            self.pending.remove(&message_id);
            return Err(e);
        }

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RelayError::ChannelClosed("Connection lost".to_string())),
            Err(_) => {
                self.pending.remove(&message_id);
                warn!(context = %self.context, message_id = %message_id, "Request timed out");
                Err(RelayError::ResponseTimeout {
                    message_id,
                    timeout_ms: self.response_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send an EVENT
    pub async fn emit(&self, action: impl Into<String>, data: Value, to: Context) -> Result<()> {
        self.outbound
            .deliver(Envelope::event(action, data, self.context, to))
            .await
    }

    /// Inbound events
    pub fn subscribe_events(&self) -> broadcast::Receiver<Envelope> {
        self.events.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Complete the pending call matching `envelope`'s message id
    pub fn resolve(&self, envelope: Envelope) -> bool {
        let Some(message_id) = envelope.message_id().map(str::to_string) else {
            return false;
        };
        match self.pending.remove(&message_id) {
            Some((_, tx)) => {
                let _ = tx.send(envelope.into_result());
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding call
    pub fn fail_pending(&self, reason: &str) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(RelayError::ChannelClosed(reason.to_string())));
            }
        }
    }

    /// Fail outstanding calls whenever the link drops after being connected
    pub fn watch_link(self: &Arc<Self>, mut state: watch::Receiver<LinkState>) -> JoinHandle<()> {
        let transport = Arc::downgrade(self);
        let mut was_connected = state.borrow_and_update().is_connected();
        tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let now = *state.borrow_and_update();
                if was_connected && now == LinkState::Disconnected {
                    let Some(transport) = transport.upgrade() else {
                        return;
                    };
                    transport.fail_pending("Connection lost");
                }
                was_connected = now.is_connected();
            }
        })
    }
}

#[async_trait]
impl LocalHandler for MessageTransport {
    async fn handle(&self, envelope: Envelope, _reply: ReplyTo) -> Option<Envelope> {
        match envelope.kind {
            MessageType::Event => {
                let _ = self.events.send(envelope);
            }
            MessageType::Request | MessageType::Approve => {
                let action = envelope.action.clone();
                if !self.resolve(envelope) {
                    debug!(context = %self.context, action = %action, "Response without pending call");
                }
            }
        }
        None
    }
}
