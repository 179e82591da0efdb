//! Envelope and link frames
//!
//! An [`Envelope`] is the addressed unit exchanged between contexts. Links
//! carry [`Frame`]s, which are either envelopes or the control messages used by
//! the handshake and keep-alive sub-protocols.

use crate::error::{ErrorPayload, RelayError, Result};
use crate::types::{Context, MessageType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix of generated message ids
pub const MESSAGE_ID_PREFIX: &str = "msg_";

/// Generate a fresh correlation id
pub fn new_message_id() -> String {
    format!("{}{}", MESSAGE_ID_PREFIX, uuid::Uuid::new_v4().simple())
}

/// Addressing and correlation data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub from: Context,
    pub to: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl Metadata {
    pub fn new(from: Context, to: Context) -> Self {
        Self {
            from,
            to,
            window_id: None,
            message_id: None,
            origin: None,
        }
    }

    /// Same correlation data with the addresses swapped
    pub fn reversed(&self) -> Self {
        Self {
            from: self.to,
            to: self.from,
            ..self.clone()
        }
    }
}

/// Addressed message exchanged between contexts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub action: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Envelope {
    fn new(kind: MessageType, action: impl Into<String>, data: Value, from: Context, to: Context) -> Self {
        Self {
            kind,
            action: action.into(),
            data,
            metadata: Some(Metadata::new(from, to)),
            error: None,
        }
    }

    /// REQUEST envelope
    pub fn request(action: impl Into<String>, data: Value, from: Context, to: Context) -> Self {
        Self::new(MessageType::Request, action, data, from, to)
    }

    /// EVENT envelope
    pub fn event(action: impl Into<String>, data: Value, from: Context, to: Context) -> Self {
        Self::new(MessageType::Event, action, data, from, to)
    }

    /// APPROVE envelope
    pub fn approve(action: impl Into<String>, data: Value, from: Context, to: Context) -> Self {
        Self::new(MessageType::Approve, action, data, from, to)
    }

    pub fn with_window_id(mut self, window_id: i64) -> Self {
        if let Some(meta) = self.metadata.as_mut() {
            meta.window_id = Some(window_id);
        }
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        if let Some(meta) = self.metadata.as_mut() {
            meta.message_id = Some(message_id.into());
        }
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        if let Some(meta) = self.metadata.as_mut() {
            meta.origin = Some(origin.into());
        }
        self
    }

    pub fn from(&self) -> Option<Context> {
        self.metadata.as_ref().map(|m| m.from)
    }

    pub fn to(&self) -> Option<Context> {
        self.metadata.as_ref().map(|m| m.to)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.metadata.as_ref()?.message_id.as_deref()
    }

    /// Check the addressing invariants
    pub fn validate(&self) -> Result<&Metadata> {
        let meta = self
            .metadata
            .as_ref()
            .ok_or_else(|| RelayError::MalformedEnvelope(format!("{}: missing metadata", self.action)))?;

        if meta.from == meta.to {
            return Err(RelayError::MalformedEnvelope(format!(
                "{}: from and to are both {}",
                self.action, meta.from
            )));
        }

        if self.action.is_empty() {
            return Err(RelayError::MalformedEnvelope("empty action".to_string()));
        }

        Ok(meta)
    }

    /// Successful response sent back toward the originator.
    ///
    /// `from` is the context producing the response; correlation data is kept.
    pub fn reply(&self, from: Context, data: Value) -> Envelope {
        let metadata = self.metadata.as_ref().map(|m| Metadata {
            from,
            ..m.reversed()
        });
        Envelope {
            kind: self.kind,
            action: self.action.clone(),
            data,
            metadata,
            error: None,
        }
    }

    /// Failed response sent back toward the originator
    pub fn reply_error(&self, from: Context, error: ErrorPayload) -> Envelope {
        let mut reply = self.reply(from, Value::Null);
        reply.error = Some(error);
        reply
    }

    /// Outcome carried by a response envelope
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(payload) => Err(RelayError::from_payload(payload)),
            None => Ok(self.data),
        }
    }
}

/// Heartbeat direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Beat {
    Ping,
    Pong,
}

/// Link-level control messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Control {
    /// Handshake check
    ConnectionCheck,
    /// Handshake acknowledgement
    ConnectionReady,
    /// Keep-alive ping (no payload) or reply (`PONG`)
    KeepAlive {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Beat>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
}

impl Control {
    pub fn ping() -> Self {
        Control::KeepAlive {
            payload: None,
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
        }
    }

    pub fn pong() -> Self {
        Control::KeepAlive {
            payload: Some(Beat::Pong),
            timestamp: None,
        }
    }

    pub fn is_pong(&self) -> bool {
        matches!(
            self,
            Control::KeepAlive {
                payload: Some(Beat::Pong),
                ..
            }
        )
    }
}

/// What a link carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Control(Control),
    Envelope(Envelope),
}

impl Frame {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Frame> {
        serde_json::from_str(raw).map_err(|e| RelayError::MalformedEnvelope(e.to_string()))
    }
}

impl From<Envelope> for Frame {
    fn from(envelope: Envelope) -> Self {
        Frame::Envelope(envelope)
    }
}

impl From<Control> for Frame {
    fn from(control: Control) -> Self {
        Frame::Control(control)
    }
}
