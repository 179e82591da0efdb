//! Core types shared across the relay

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Isolated execution context taking part in the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Context {
    /// Script running inside the web page
    Injected,
    /// Content script bridging page and extension
    Content,
    /// Privileged background service
    Background,
    /// Popup UI where the human approves
    Popup,
}

impl Context {
    /// All contexts
    pub const ALL: [Context; 4] = [
        Context::Injected,
        Context::Content,
        Context::Background,
        Context::Popup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Context::Injected => "INJECTED",
            Context::Content => "CONTENT",
            Context::Background => "BACKGROUND",
            Context::Popup => "POPUP",
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Expects exactly one response
    Request,
    /// Fire-and-forget
    Event,
    /// Needs human consent before a response is produced
    Approve,
}

impl MessageType {
    /// Whether a caller is awaiting a response
    pub fn expects_response(&self) -> bool {
        !matches!(self, MessageType::Event)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Request => "REQUEST",
            MessageType::Event => "EVENT",
            MessageType::Approve => "APPROVE",
        };
        f.write_str(s)
    }
}

/// Name of a duplex link between two contexts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkName(String);

impl LinkName {
    /// page <-> content, same-process broadcast channel
    pub const INJECT_CONTENT: &'static str = "INJECT_CONTENT";
    /// content <-> background
    pub const CONTENT_BG: &'static str = "CONTENT_BG";
    /// popup <-> background
    pub const BG_POPUP: &'static str = "BG_POPUP";
    /// keep-alive only
    pub const KEEP_ALIVE_INTERVAL: &'static str = "KEEP_ALIVE_INTERVAL";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn inject_content() -> Self {
        Self::new(Self::INJECT_CONTENT)
    }

    pub fn content_bg() -> Self {
        Self::new(Self::CONTENT_BG)
    }

    pub fn bg_popup() -> Self {
        Self::new(Self::BG_POPUP)
    }

    pub fn keep_alive() -> Self {
        Self::new(Self::KEEP_ALIVE_INTERVAL)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is one of the fixed link names
    pub fn is_known(&self) -> bool {
        matches!(
            self.0.as_str(),
            Self::INJECT_CONTENT | Self::CONTENT_BG | Self::BG_POPUP | Self::KEEP_ALIVE_INTERVAL
        )
    }
}

impl fmt::Display for LinkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LinkName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Action identifiers understood by the wallet
pub mod actions {
    pub const REQUEST_ACCOUNTS: &str = "REQUEST_ACCOUNTS";
    pub const GET_ACCOUNTS: &str = "GET_ACCOUNTS";
    pub const GET_CURRENT_ACCOUNT: &str = "GET_CURRENT_ACCOUNT";
    pub const SWITCH_ACCOUNT: &str = "SWITCH_ACCOUNT";
    pub const GET_PUBLIC_KEY: &str = "GET_PUBLIC_KEY";
    pub const GET_BALANCE: &str = "GET_BALANCE";
    pub const GET_NETWORK: &str = "GET_NETWORK";
    pub const SWITCH_NETWORK: &str = "SWITCH_NETWORK";
    pub const GET_UTXOS: &str = "GET_UTXOS";
    pub const GET_INSCRIPTIONS: &str = "GET_INSCRIPTIONS";
    pub const GET_ASSET_BALANCE: &str = "GET_ASSET_BALANCE";
    pub const GET_TRANSACTION_HISTORY: &str = "GET_TRANSACTION_HISTORY";
    pub const ESTIMATE_FEE: &str = "ESTIMATE_FEE";

    pub const SEND_BITCOIN: &str = "SEND_BITCOIN";
    pub const SEND_INSCRIPTION: &str = "SEND_INSCRIPTION";
    pub const SIGN_MESSAGE: &str = "SIGN_MESSAGE";
    pub const SIGN_PSBT: &str = "SIGN_PSBT";
    pub const SIGN_PSBTS: &str = "SIGN_PSBTS";
    pub const PUSH_TX: &str = "PUSH_TX";
    pub const PUSH_PSBT: &str = "PUSH_PSBT";
    pub const FINALIZE_PSBT: &str = "FINALIZE_PSBT";
    pub const TRANSFER_ASSET: &str = "TRANSFER_ASSET";
    pub const SPLIT_ASSET: &str = "SPLIT_ASSET";
    pub const BATCH_SEND_ASSETS_SATSNET: &str = "BATCH_SEND_ASSETS_SATSNET";

    pub const LOCK_UTXO: &str = "LOCK_UTXO";
    pub const LOCK_UTXO_SATSNET: &str = "LOCK_UTXO_SATSNET";
    pub const UNLOCK_UTXO: &str = "UNLOCK_UTXO";
    pub const UNLOCK_UTXO_SATSNET: &str = "UNLOCK_UTXO_SATSNET";
    pub const GET_LOCKED_UTXOS: &str = "GET_LOCKED_UTXOS";
    pub const LOCK_TO_CHANNEL: &str = "LOCK_TO_CHANNEL";
    pub const UNLOCK_FROM_CHANNEL: &str = "UNLOCK_FROM_CHANNEL";

    pub const DEPLOY_CONTRACT_REMOTE: &str = "DEPLOY_CONTRACT_REMOTE";
    pub const INVOKE_CONTRACT_SATSNET: &str = "INVOKE_CONTRACT_SATSNET";
    pub const GET_CONTRACT_INFO: &str = "GET_CONTRACT_INFO";
    pub const GET_SUPPORTED_CONTRACTS: &str = "GET_SUPPORTED_CONTRACTS";

    pub const REGISTER_AS_REFERRER: &str = "REGISTER_AS_REFERRER";
    pub const BIND_REFERRER_FOR_SERVER: &str = "BIND_REFERRER_FOR_SERVER";

    pub const GET_APPROVE_DATA: &str = "GET_APPROVE_DATA";
    pub const GET_APPROVE_DATA_RESPONSE: &str = "GET_APPROVE_DATA_RESPONSE";
    pub const APPROVE_RESPONSE: &str = "APPROVE_RESPONSE";
    pub const REJECT_RESPONSE: &str = "REJECT_RESPONSE";

    pub const ACCOUNTS_CHANGED: &str = "accountsChanged";
    pub const NETWORK_CHANGED: &str = "networkChanged";
    pub const ENV_CHANGED: &str = "ENV_CHANGED";
    pub const APPROVAL_REQUESTED: &str = "APPROVAL_REQUESTED";

    /// Every action the default registry recognizes
    pub const ALL: &[&str] = &[
        REQUEST_ACCOUNTS,
        GET_ACCOUNTS,
        GET_CURRENT_ACCOUNT,
        SWITCH_ACCOUNT,
        GET_PUBLIC_KEY,
        GET_BALANCE,
        GET_NETWORK,
        SWITCH_NETWORK,
        GET_UTXOS,
        GET_INSCRIPTIONS,
        GET_ASSET_BALANCE,
        GET_TRANSACTION_HISTORY,
        ESTIMATE_FEE,
        SEND_BITCOIN,
        SEND_INSCRIPTION,
        SIGN_MESSAGE,
        SIGN_PSBT,
        SIGN_PSBTS,
        PUSH_TX,
        PUSH_PSBT,
        FINALIZE_PSBT,
        TRANSFER_ASSET,
        SPLIT_ASSET,
        BATCH_SEND_ASSETS_SATSNET,
        LOCK_UTXO,
        LOCK_UTXO_SATSNET,
        UNLOCK_UTXO,
        UNLOCK_UTXO_SATSNET,
        GET_LOCKED_UTXOS,
        LOCK_TO_CHANNEL,
        UNLOCK_FROM_CHANNEL,
        DEPLOY_CONTRACT_REMOTE,
        INVOKE_CONTRACT_SATSNET,
        GET_CONTRACT_INFO,
        GET_SUPPORTED_CONTRACTS,
        REGISTER_AS_REFERRER,
        BIND_REFERRER_FOR_SERVER,
        GET_APPROVE_DATA,
        GET_APPROVE_DATA_RESPONSE,
        APPROVE_RESPONSE,
        REJECT_RESPONSE,
        ACCOUNTS_CHANGED,
        NETWORK_CHANGED,
        ENV_CHANGED,
        APPROVAL_REQUESTED,
    ];
}

/// Set of recognized action names
#[derive(Debug, Clone)]
pub struct ActionRegistry {
    actions: HashSet<String>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self {
            actions: actions::ALL.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl ActionRegistry {
    /// Empty registry
    pub fn empty() -> Self {
        Self {
            actions: HashSet::new(),
        }
    }

    /// Register an additional action
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.actions.insert(action.into());
        self
    }

    pub fn register(&mut self, action: impl Into<String>) {
        self.actions.insert(action.into());
    }

    pub fn contains(&self, action: &str) -> bool {
        self.actions.contains(action)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
