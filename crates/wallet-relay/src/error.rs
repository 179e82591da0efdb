//! Error types for the relay

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire code: no wallet is loaded
pub const NO_WALLET: i64 = 0;
/// Wire code: the user declined the request
pub const USER_REJECT: i64 = 1;
/// Wire code: the approval window timed out
pub const APPROVAL_EXPIRED: i64 = 2;
/// Wire code: the envelope could not be delivered
pub const DELIVERY_FAILED: i64 = 3;
/// Wire code: the request was malformed
pub const INVALID_REQUEST: i64 = -32600;
/// Wire code: no handler recognizes the action
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Wire code: internal failure
pub const INTERNAL_ERROR: i64 = -32603;

/// Relay errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// Send on a link that has been torn down
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// No handshake acknowledgement within the bound
    #[error("Handshake timed out on {link} after {timeout_ms}ms")]
    HandshakeTimeout { link: String, timeout_ms: u64 },

    /// Reconnect-and-resend failed
    #[error("Delivery failed on {link}: {reason}")]
    DeliveryFailed { link: String, reason: String },

    /// The human declined
    #[error("User rejected")]
    UserRejected,

    /// The approval window expired before anyone responded
    #[error("Approval expired: {0}")]
    ApprovalExpired(String),

    /// Envelope failed validation
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// No correlated response in time
    #[error("No response to {message_id} within {timeout_ms}ms")]
    ResponseTimeout { message_id: String, timeout_ms: u64 },

    /// Error reported by the far side
    #[error("{message} (code {code})")]
    Remote { code: i64, message: String },

    /// Persistence failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Wire code carried in an [`ErrorPayload`]
    pub fn code(&self) -> i64 {
        match self {
            RelayError::UserRejected => USER_REJECT,
            RelayError::ApprovalExpired(_) => APPROVAL_EXPIRED,
            RelayError::ChannelClosed(_)
            | RelayError::HandshakeTimeout { .. }
            | RelayError::DeliveryFailed { .. } => DELIVERY_FAILED,
            RelayError::MalformedEnvelope(_) | RelayError::Serialization(_) => INVALID_REQUEST,
            RelayError::Remote { code, .. } => *code,
            RelayError::ResponseTimeout { .. }
            | RelayError::Storage(_)
            | RelayError::Network(_)
            | RelayError::InvalidConfig(_)
            | RelayError::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::MalformedEnvelope(_) | RelayError::Serialization(_) => 400,
            RelayError::UserRejected => 403,
            RelayError::ApprovalExpired(_) => 410,
            RelayError::HandshakeTimeout { .. } | RelayError::ResponseTimeout { .. } => 504,
            RelayError::ChannelClosed(_)
            | RelayError::DeliveryFailed { .. }
            | RelayError::Network(_) => 503,
            RelayError::Remote { .. } => 502,
            RelayError::InvalidConfig(_) | RelayError::Storage(_) | RelayError::Internal(_) => 500,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::ChannelClosed(_)
                | RelayError::HandshakeTimeout { .. }
                | RelayError::ResponseTimeout { .. }
                | RelayError::Network(_)
        )
    }

    /// Rebuild an error from its wire form
    pub fn from_payload(payload: ErrorPayload) -> Self {
        match payload.code {
            USER_REJECT => RelayError::UserRejected,
            APPROVAL_EXPIRED => RelayError::ApprovalExpired(payload.message),
            DELIVERY_FAILED => {
                let detail = payload
                    .message
                    .strip_prefix("Delivery failed on ")
                    .and_then(|rest| rest.split_once(": "));
                match detail {
                    Some((link, reason)) => RelayError::DeliveryFailed {
                        link: link.to_string(),
                        reason: reason.to_string(),
                    },
                    None => RelayError::DeliveryFailed {
                        link: String::new(),
                        reason: payload.message,
                    },
                }
            }
            code => RelayError::Remote {
                code,
                message: payload.message,
            },
        }
    }

    /// Wire form of this error
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::from(self)
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Storage(err.to_string())
    }
}

/// Error as carried inside an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i64,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn user_reject() -> Self {
        Self::new(USER_REJECT, "User rejected")
    }

    pub fn no_wallet() -> Self {
        Self::new(NO_WALLET, "No wallet")
    }

    pub fn method_not_found(action: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {action}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

impl From<&RelayError> for ErrorPayload {
    fn from(err: &RelayError) -> Self {
        match err {
            RelayError::Remote { code, message } => Self::new(*code, message.clone()),
            other => Self::new(other.code(), other.to_string()),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, RelayError>;
