//! Background-side handlers
//!
//! [`WalletService`] adapts the wallet core to the router. [`ApprovalGate`]
//! drives the approval broker from envelopes: requests that need consent are
//! shown and answered once the human decides, while the popup reads and answers
//! the pending request through `GET_APPROVE_DATA`, `APPROVE_RESPONSE` and
//! `REJECT_RESPONSE`. Those three are honoured only on the `BG_POPUP` link;
//! what an envelope claims in `metadata.from` is never enough.

use crate::approval::{ApprovalBroker, ApprovalRequest};
use crate::authorization::OriginAuthorizer;
use crate::envelope::Envelope;
use crate::error::{ErrorPayload, RelayError};
use crate::router::{LocalHandler, ReplyTo};
use crate::types::{Context, LinkName, MessageType, actions};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Boundary to the privileged wallet logic
#[async_trait]
pub trait WalletCore: Send + Sync {
    async fn call(&self, action: &str, data: Value) -> std::result::Result<Value, ErrorPayload>;

    /// Readiness signal for cores that load asynchronously; `None` means
    /// always ready
    fn readiness(&self) -> Option<watch::Receiver<bool>> {
        None
    }
}

/// Local handler backed by a [`WalletCore`]
pub struct WalletService {
    context: Context,
    core: Arc<dyn WalletCore>,
}

impl WalletService {
    pub fn new(context: Context, core: Arc<dyn WalletCore>) -> Self {
        Self { context, core }
    }
}

#[async_trait]
impl LocalHandler for WalletService {
    async fn handle(&self, envelope: Envelope, _reply: ReplyTo) -> Option<Envelope> {
        let outcome = self
            .core
            .call(&envelope.action, envelope.data.clone())
            .await;

        if envelope.kind == MessageType::Event {
            if let Err(e) = outcome {
                debug!(action = %envelope.action, code = e.code, "Event handler failed");
            }
            return None;
        }

        Some(match outcome {
            Ok(data) => envelope.reply(self.context, data),
            Err(error) => {
                debug!(action = %envelope.action, code = error.code, "Wallet call failed");
                envelope.reply_error(self.context, error)
            }
        })
    }
}

/// Wallet core answering from a fixed table
pub struct StaticWallet {
    responses: DashMap<String, Value>,
    locked: bool,
    ready: watch::Sender<bool>,
}

impl Default for StaticWallet {
    fn default() -> Self {
        Self {
            responses: DashMap::new(),
            locked: false,
            ready: watch::channel(true).0,
        }
    }
}

impl StaticWallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wallet that is still loading until [`StaticWallet::mark_ready`]
    pub fn loading() -> Self {
        let wallet = Self::default();
        wallet.ready.send_replace(false);
        wallet
    }

    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
        info!("Wallet core ready");
    }

    pub fn with_response(self, action: impl Into<String>, value: Value) -> Self {
        self.responses.insert(action.into(), value);
        self
    }

    /// Wallet with nothing loaded; every call fails with "No wallet"
    pub fn locked() -> Self {
        Self {
            locked: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl WalletCore for StaticWallet {
    async fn call(&self, action: &str, _data: Value) -> std::result::Result<Value, ErrorPayload> {
        if self.locked {
            return Err(ErrorPayload::no_wallet());
        }
        self.responses
            .get(action)
            .map(|v| v.value().clone())
            .ok_or_else(|| ErrorPayload::method_not_found(action))
    }

    fn readiness(&self) -> Option<watch::Receiver<bool>> {
        Some(self.ready.subscribe())
    }
}

/// Approval-domain handler hosted in the background
pub struct ApprovalGate {
    context: Context,
    broker: Arc<ApprovalBroker>,
    ttl: Duration,
    authorizer: Option<Arc<OriginAuthorizer>>,
}

impl ApprovalGate {
    pub fn new(broker: Arc<ApprovalBroker>, ttl: Duration) -> Self {
        Self {
            context: Context::Background,
            broker,
            ttl,
            authorizer: None,
        }
    }

    /// Grant the requesting origin access when `REQUEST_ACCOUNTS` is approved
    pub fn with_authorizer(mut self, authorizer: Arc<OriginAuthorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn broker(&self) -> &Arc<ApprovalBroker> {
        &self.broker
    }

    fn show_and_answer(&self, envelope: Envelope, reply: ReplyTo) {
        let request = ApprovalRequest::from_envelope(&envelope).with_ttl_secs(self.ttl.as_secs() as i64);
        let handle = self.broker.show(request);
        let id = handle.id().to_string();
        info!(approval_id = %id, action = %envelope.action, "Awaiting approval");

        let broker = Arc::clone(&self.broker);
        let authorizer = self.authorizer.clone();
        let context = self.context;
        let ttl = self.ttl;
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(ttl, handle.wait()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    broker.expire(&id);
                    Err(RelayError::ApprovalExpired(id.clone()))
                }
            };

            if outcome.is_ok()
                && envelope.action == actions::REQUEST_ACCOUNTS
                && let Some(authorizer) = authorizer
                && let Some(origin) = envelope.metadata.as_ref().and_then(|m| m.origin.as_deref())
                && let Err(e) = authorizer.grant(origin).await
            {
                warn!(approval_id = %id, origin, error = %e, "Origin grant not saved");
            }

            if !envelope.kind.expects_response() {
                return;
            }
            let response = match outcome {
                Ok(data) => envelope.reply(context, data),
                Err(e) => envelope.reply_error(context, e.to_payload()),
            };
            if let Err(e) = reply.send(response).await {
                warn!(approval_id = %id, error = %e, "Approval outcome undeliverable");
            }
        });
    }
}

#[async_trait]
impl LocalHandler for ApprovalGate {
    async fn handle(&self, envelope: Envelope, reply: ReplyTo) -> Option<Envelope> {
        let from_popup = reply.link().map(LinkName::as_str) == Some(LinkName::BG_POPUP)
            && envelope.from() == Some(Context::Popup);

        match envelope.action.as_str() {
            actions::GET_APPROVE_DATA if from_popup => {
                let current = self.broker.current_request();
                Some(envelope.reply(self.context, json!(current)))
            }
            actions::APPROVE_RESPONSE if from_popup => {
                let resolved = self.broker.confirm(envelope.data.clone());
                Some(envelope.reply(self.context, json!({ "resolved": resolved })))
            }
            actions::REJECT_RESPONSE if from_popup => {
                let error = serde_json::from_value::<ErrorPayload>(envelope.data.clone())
                    .ok()
                    .map(RelayError::from_payload);
                let resolved = self.broker.reject(error);
                Some(envelope.reply(self.context, json!({ "resolved": resolved })))
            }
            actions::APPROVE_RESPONSE | actions::REJECT_RESPONSE => {
                warn!(
                    link = ?reply.link().map(LinkName::as_str),
                    from = ?envelope.from(),
                    action = %envelope.action,
                    "Approval answer from outside the popup"
                );
                envelope.kind.expects_response().then(|| {
                    envelope.reply_error(
                        self.context,
                        ErrorPayload::new(crate::error::INVALID_REQUEST, "Only the popup may answer approvals"),
                    )
                })
            }
            _ => {
                self.show_and_answer(envelope, reply);
                None
            }
        }
    }
}
