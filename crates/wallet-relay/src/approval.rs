//! Human approval gating
//!
//! The [`ApprovalBroker`] holds at most one pending request. Showing a new
//! request replaces the current one; the replaced caller is never resolved.
//! The UI observes the broker through [`ApprovalBroker::subscribe`] and answers
//! with [`ApprovalBroker::confirm`] or [`ApprovalBroker::reject`].

use crate::envelope::{Envelope, Metadata};
use crate::error::{RelayError, Result};
use crate::types::actions;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

/// Prefix of generated approval ids
pub const APPROVAL_ID_PREFIX: &str = "approve_";

const DEFAULT_TTL_SECS: i64 = 300;

/// Request shown to the human
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Unique approval id, assigned on show when empty
    #[serde(default)]
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            action: action.into(),
            data,
            metadata: None,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(DEFAULT_TTL_SECS),
        }
    }

    /// Request describing an inbound envelope
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let mut request = Self::new(envelope.action.clone(), envelope.data.clone());
        request.metadata = envelope.metadata.clone();
        request
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set expiration time
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Set expiration duration
    pub fn with_ttl_secs(mut self, ttl_secs: i64) -> Self {
        self.expires_at = self.created_at + chrono::Duration::seconds(ttl_secs);
        self
    }

    pub fn origin(&self) -> Option<&str> {
        self.metadata.as_ref()?.origin.as_deref()
    }

    /// Check if the request has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Get time remaining in seconds (0 if expired)
    pub fn time_remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// What the UI renders
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalView {
    pub current_request: Option<ApprovalRequest>,
    pub is_visible: bool,
}

/// Caller side of a shown request
pub struct ApprovalHandle {
    id: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl ApprovalHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the human. Never completes if the request was replaced or
    /// hidden without an answer.
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => std::future::pending().await,
        }
    }
}

struct Pending {
    request: ApprovalRequest,
    responder: oneshot::Sender<Result<Value>>,
}

/// Single-slot approval broker
pub struct ApprovalBroker {
    slot: Mutex<Option<Pending>>,
    view: watch::Sender<ApprovalView>,
}

impl Default for ApprovalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalBroker {
    pub fn new() -> Self {
        let (view, _) = watch::channel(ApprovalView::default());
        Self {
            slot: Mutex::new(None),
            view,
        }
    }

    /// Make `request` the pending request and return its handle
    pub fn show(&self, mut request: ApprovalRequest) -> ApprovalHandle {
        if request.id.is_empty() {
            request.id = format!("{}{}", APPROVAL_ID_PREFIX, uuid::Uuid::new_v4().simple());
        }
        let (responder, rx) = oneshot::channel();
        let id = request.id.clone();

        let mut slot = self.slot.lock();
        if let Some(previous) = slot.take() {
            debug!(
                previous = %previous.request.id,
                replacement = %id,
                "Replacing pending approval"
            );
        }
        self.view.send_replace(ApprovalView {
            current_request: Some(request.clone()),
            is_visible: true,
        });
        *slot = Some(Pending { request, responder });
        info!(approval_id = %id, "Approval shown");

        ApprovalHandle { id, rx }
    }

    /// Resolve the pending request. Returns `false` when nothing is pending.
    pub fn confirm(&self, result: Value) -> bool {
        match self.take() {
            Some(pending) => {
                info!(approval_id = %pending.request.id, "Approval confirmed");
                let _ = pending.responder.send(Ok(result));
                true
            }
            None => false,
        }
    }

    /// Reject the pending request, with "User rejected" unless an error is given.
    /// Returns `false` when nothing is pending.
    pub fn reject(&self, error: Option<RelayError>) -> bool {
        match self.take() {
            Some(pending) => {
                let error = error.unwrap_or(RelayError::UserRejected);
                info!(approval_id = %pending.request.id, error = %error, "Approval rejected");
                let _ = pending.responder.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Clear the pending request without answering it
    pub fn hide(&self) {
        if let Some(pending) = self.take() {
            debug!(approval_id = %pending.request.id, "Approval hidden");
        }
    }

    /// The approval window was closed
    pub fn dismiss(&self) -> bool {
        self.reject(None)
    }

    /// Reject the pending request if it is `id`
    pub fn expire(&self, id: &str) -> bool {
        let mut slot = self.slot.lock();
        if slot.as_ref().map(|p| p.request.id.as_str()) != Some(id) {
            return false;
        }
        let pending = slot.take();
        self.view.send_replace(ApprovalView::default());
        drop(slot);

        match pending {
            Some(pending) => {
                info!(approval_id = %id, "Approval expired");
                let _ = pending
                    .responder
                    .send(Err(RelayError::ApprovalExpired(id.to_string())));
                true
            }
            None => false,
        }
    }

    pub fn current_request(&self) -> Option<ApprovalRequest> {
        self.slot.lock().as_ref().map(|p| p.request.clone())
    }

    pub fn is_visible(&self) -> bool {
        self.view.borrow().is_visible
    }

    pub fn view(&self) -> ApprovalView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ApprovalView> {
        self.view.subscribe()
    }

    fn take(&self) -> Option<Pending> {
        let mut slot = self.slot.lock();
        let pending = slot.take();
        if pending.is_some() {
            self.view.send_replace(ApprovalView::default());
        }
        pending
    }
}

/// Actions that require human consent
#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    actions: HashSet<String>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        let defaults = [
            actions::REQUEST_ACCOUNTS,
            actions::SWITCH_NETWORK,
            actions::SEND_BITCOIN,
            actions::SIGN_MESSAGE,
            actions::SIGN_PSBT,
            actions::SIGN_PSBTS,
            actions::SEND_INSCRIPTION,
            actions::SPLIT_ASSET,
            actions::LOCK_UTXO,
            actions::UNLOCK_UTXO,
            actions::UNLOCK_UTXO_SATSNET,
            actions::LOCK_TO_CHANNEL,
            actions::UNLOCK_FROM_CHANNEL,
            actions::BATCH_SEND_ASSETS_SATSNET,
            actions::DEPLOY_CONTRACT_REMOTE,
            actions::INVOKE_CONTRACT_SATSNET,
        ];
        Self {
            actions: defaults.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl ApprovalPolicy {
    /// Policy that gates nothing
    pub fn empty() -> Self {
        Self {
            actions: HashSet::new(),
        }
    }

    pub fn add(&mut self, action: impl Into<String>) {
        self.actions.insert(action.into());
    }

    pub fn remove(&mut self, action: &str) -> bool {
        self.actions.remove(action)
    }

    pub fn requires_approval(&self, action: &str) -> bool {
        self.actions.contains(action)
    }
}
