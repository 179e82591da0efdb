//! Integration tests module
//!
//! End-to-end flows across contexts:
//! - Request/response and events through every hop
//! - Link loss and recovery
//! - Page access control and answer authority
//! - Remote links over the server

pub mod link_recovery_test;
pub mod relay_flow_test;
#[cfg(all(feature = "server", feature = "client"))]
pub mod remote_link_test;
