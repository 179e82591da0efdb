//! # Wallet Relay
//!
//! Message relay and approval gating between the isolated contexts of a
//! browser wallet extension: the injected page script, the content script,
//! the background service and the popup UI.
//!
//! ## Features
//!
//! - **Envelopes**: addressed REQUEST / EVENT / APPROVE messages with
//!   correlation metadata
//! - **Links**: channel adapters with a handshake, lazy reconnect and a
//!   keep-alive beacon for the ephemeral background host
//! - **Routing**: per-context routers that forward, gate or handle locally
//! - **Approvals**: a single-slot broker that holds a caller until the human
//!   answers; only the popup link may answer
//! - **Page access**: origin grants and a wallet-presence check for everything
//!   a page sends
//! - **Remote links**: an axum server and a WebSocket connector (features
//!   `server` and `client`)
//!
//! ## Message Flow
//!
//! ```text
//! Page ──INJECT_CONTENT──► Content ──CONTENT_BG──► Background ──► Wallet core
//!  ▲                                                  │
//!  │                                                  ▼
//!  │                                           Approval broker ◄──BG_POPUP── Popup
//!  └──────────────── response (same messageId) ───────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wallet_relay::{BackgroundNode, BroadcastHub, ContentNode, MemoryRuntime, PageNode, RelayConfig};
//!
//! let config = RelayConfig::default();
//! let runtime = MemoryRuntime::new();
//! let hub = BroadcastHub::new();
//!
//! let background = BackgroundNode::start(runtime.clone(), wallet_core, &config);
//! let _content = ContentNode::start(runtime.clone(), &hub, &config).await;
//! let page = PageNode::start(&hub, &config).await?;
//!
//! let balance = page.request("GET_BALANCE", serde_json::Value::Null).await?;
//! ```

pub mod approval;
pub mod authorization;
pub mod channel;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod keepalive;
pub mod memory;
pub mod node;
pub mod router;
pub mod service;
pub mod storage;
pub mod transport;
pub mod types;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "client")]
pub mod client;

pub use approval::{ApprovalBroker, ApprovalHandle, ApprovalPolicy, ApprovalRequest, ApprovalView};
pub use authorization::{AuthorizationPolicy, OriginAuthorizer, PageGate};
pub use channel::{ChannelAdapter, Connector};
pub use config::{KeepAliveConfig, LinkConfig, RelayConfig, RetryConfig};
pub use connection::{ConnectionManager, LinkState};
pub use envelope::{Control, Envelope, Frame, Metadata};
pub use error::{ErrorPayload, RelayError, Result};
pub use keepalive::{KeepAliveBeacon, KeepAliveSession};
pub use memory::{BroadcastHub, MemoryPort, MemoryRuntime};
pub use node::{BackgroundNode, ContentNode, PageNode, PopupNode};
pub use router::{
    AcceptedLink, Admission, Dispatch, Inbound, LinkPolicy, LocalHandler, Outbound, ReplyTo, Router,
};
pub use service::{ApprovalGate, StaticWallet, WalletCore, WalletService};
pub use storage::{FileStore, KeyValueStore, MemoryStore, SessionStatus, WalletStorage};
pub use transport::MessageTransport;
pub use types::{ActionRegistry, Context, LinkName, MessageType, actions};

#[cfg(feature = "server")]
pub use server::RelayServer;

#[cfg(feature = "client")]
pub use client::{ApprovalClient, ClientConfig, WebSocketConnector};
