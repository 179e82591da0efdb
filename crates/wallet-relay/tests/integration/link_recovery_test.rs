//! Integration tests for link loss and recovery
//!
//! These tests verify:
//! - A handshake timeout fails `connect()` and the next send tries afresh
//! - Unanswered keep-alive pings tear the link down
//! - The next send after a loss reconnects exactly once
//! - The keep-alive session reconnects with backoff
//! - A send that fails on a connected link reconnects and resends once

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wallet_relay::envelope::{Control, Frame};
use wallet_relay::keepalive;
use wallet_relay::memory::PortListener;
use wallet_relay::channel::{DisconnectHandler, FrameHandler};
use wallet_relay::{
    ChannelAdapter, ConnectionManager, Connector, Context, Envelope, KeepAliveConfig,
    KeepAliveSession, LinkConfig, LinkName, LinkState, MemoryRuntime, RelayConfig, RelayError,
    RetryConfig,
};

/// Host that completes handshakes and records envelopes but never answers pings
fn spawn_deaf_host(mut listener: PortListener) -> (Arc<Mutex<usize>>, mpsc::UnboundedReceiver<Envelope>) {
    let accepted = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&accepted);
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut held: Vec<Arc<dyn ChannelAdapter>> = Vec::new();
        while let Some(adapter) = listener.accept().await {
            *counter.lock() += 1;
            let weak = Arc::downgrade(&adapter);
            let tx = tx.clone();
            adapter.on_receive(Arc::new(move |frame| {
                let Some(adapter) = weak.upgrade() else {
                    return;
                };
                match frame {
                    Frame::Control(Control::ConnectionCheck) => {
                        let _ = adapter.send(Frame::Control(Control::ConnectionReady));
                    }
                    Frame::Envelope(envelope) => {
                        let _ = tx.send(envelope);
                    }
                    Frame::Control(_) => {}
                }
            }));
            held.push(adapter);
        }
    });

    (accepted, rx)
}

/// Host that accepts every port and never answers anything
fn spawn_silent_host(mut listener: PortListener) {
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some(adapter) = listener.accept().await {
            held.push(adapter);
        }
    });
}

/// Port that completes handshakes but refuses to carry envelopes
struct FlakyPort {
    inner: Arc<dyn ChannelAdapter>,
}

impl ChannelAdapter for FlakyPort {
    fn link(&self) -> &LinkName {
        self.inner.link()
    }

    fn send(&self, frame: Frame) -> wallet_relay::Result<()> {
        match frame {
            Frame::Envelope(_) => Err(RelayError::ChannelClosed(format!("{}: port stalled", self.link()))),
            control => self.inner.send(control),
        }
    }

    fn on_receive(&self, handler: FrameHandler) {
        self.inner.on_receive(handler)
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        self.inner.on_disconnect(handler)
    }

    fn disconnect(&self) {
        self.inner.disconnect()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

/// Connector whose first `flaky` ports stall on envelope sends
struct FlakyConnector {
    runtime: MemoryRuntime,
    flaky: usize,
    opens: Mutex<usize>,
}

impl FlakyConnector {
    fn new(runtime: MemoryRuntime, flaky: usize) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            flaky,
            opens: Mutex::new(0),
        })
    }

    fn opens(&self) -> usize {
        *self.opens.lock()
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn open(&self, link: &LinkName) -> wallet_relay::Result<Arc<dyn ChannelAdapter>> {
        let inner = self.runtime.open(link).await?;
        let opened = {
            let mut opens = self.opens.lock();
            *opens += 1;
            *opens
        };
        if opened <= self.flaky {
            Ok(Arc::new(FlakyPort { inner }))
        } else {
            Ok(inner)
        }
    }
}

fn envelope() -> Envelope {
    Envelope::request("GET_BALANCE", json!({}), Context::Content, Context::Background)
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_then_fresh_attempt() {
    let runtime = MemoryRuntime::new();
    spawn_silent_host(runtime.listen(LinkName::content_bg()));
    let manager = ConnectionManager::new(
        LinkName::content_bg(),
        Arc::new(runtime),
        LinkConfig::default().with_handshake_timeout(Duration::from_secs(5)),
        None,
    );

    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, RelayError::HandshakeTimeout { timeout_ms: 5000, .. }));
    assert!(err.is_retryable());
    assert_eq!(manager.state(), LinkState::Disconnected);

    let err = manager.send(envelope()).await.unwrap_err();
    assert!(matches!(err, RelayError::DeliveryFailed { .. }));
    assert_eq!(manager.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_loss_then_single_reconnect() {
    let runtime = MemoryRuntime::new();
    let (accepted, mut received) = spawn_deaf_host(runtime.listen(LinkName::content_bg()));
    let manager = ConnectionManager::new(
        LinkName::content_bg(),
        Arc::new(runtime),
        LinkConfig::default().with_keep_alive(KeepAliveConfig {
            interval_ms: 1000,
            max_missed: 2,
        }),
        None,
    );

    manager.connect().await.unwrap();
    assert_eq!(manager.state(), LinkState::Connected);

    let mut states = manager.subscribe_state();
    states.wait_for(|s| *s == LinkState::Disconnected).await.unwrap();
    assert_eq!(manager.connect_attempts(), 1);

    manager.send(envelope()).await.unwrap();
    assert_eq!(manager.state(), LinkState::Connected);
    assert_eq!(manager.connect_attempts(), 2);
    assert_eq!(*accepted.lock(), 2);
    assert_eq!(received.recv().await.unwrap(), envelope());
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_session_reconnects_with_backoff() {
    let runtime = MemoryRuntime::new();
    let mut listener = runtime.listen(LinkName::keep_alive());

    // First port is dropped by the host shortly after the handshake
    let (dropped_tx, dropped_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let Some(first) = listener.accept().await else {
            return;
        };
        keepalive::respond(Arc::clone(&first));
        tokio::time::sleep(Duration::from_millis(500)).await;
        first.disconnect();
        let _ = dropped_tx.send(());

        let mut held = Vec::new();
        while let Some(adapter) = listener.accept().await {
            keepalive::respond(Arc::clone(&adapter));
            held.push(adapter);
        }
    });

    let config = RelayConfig {
        reconnect: RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        },
        ..RelayConfig::default().with_keep_alive(KeepAliveConfig {
            interval_ms: 20_000,
            max_missed: 2,
        })
    };
    let session = KeepAliveSession::start(Arc::new(runtime), &config).await.unwrap();
    assert_eq!(session.state(), LinkState::Connected);

    dropped_rx.await.unwrap();
    let mut states = session.manager().subscribe_state();
    states.wait_for(|s| *s == LinkState::Disconnected).await.unwrap();
    states.wait_for(|s| *s == LinkState::Connected).await.unwrap();

    assert_eq!(session.manager().connect_attempts(), 2);
    assert!(session.is_supervised());
    session.close();
    assert_eq!(session.state(), LinkState::Disconnected);
}

#[tokio::test]
async fn test_send_failure_on_connected_link_resends_once() {
    let runtime = MemoryRuntime::new();
    let (accepted, mut received) = spawn_deaf_host(runtime.listen(LinkName::content_bg()));
    let connector = FlakyConnector::new(runtime, 1);
    let manager = ConnectionManager::new(
        LinkName::content_bg(),
        connector.clone(),
        LinkConfig::default(),
        None,
    );

    manager.connect().await.unwrap();
    assert_eq!(manager.state(), LinkState::Connected);

    manager.send(envelope()).await.unwrap();
    assert_eq!(connector.opens(), 2);
    assert_eq!(manager.connect_attempts(), 2);
    assert_eq!(*accepted.lock(), 2);
    assert_eq!(manager.state(), LinkState::Connected);

    let delivered = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.action, "GET_BALANCE");
    assert!(received.try_recv().is_err());
}

#[tokio::test]
async fn test_send_failure_after_resend_is_delivery_failed() {
    let runtime = MemoryRuntime::new();
    let (_accepted, mut received) = spawn_deaf_host(runtime.listen(LinkName::content_bg()));
    let connector = FlakyConnector::new(runtime, usize::MAX);
    let manager = ConnectionManager::new(
        LinkName::content_bg(),
        connector.clone(),
        LinkConfig::default(),
        None,
    );

    manager.connect().await.unwrap();

    match manager.send(envelope()).await {
        Err(RelayError::DeliveryFailed { link, reason }) => {
            assert_eq!(link, LinkName::CONTENT_BG);
            assert!(reason.contains("port stalled"));
        }
        other => panic!("expected DeliveryFailed, got {other:?}"),
    }
    // One reconnect, never a second
    assert_eq!(connector.opens(), 2);
    assert_eq!(manager.connect_attempts(), 2);
    assert!(received.try_recv().is_err());
}
