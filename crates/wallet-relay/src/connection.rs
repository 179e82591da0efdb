//! Connection manager
//!
//! Owns one named link from the connecting side. The link moves through
//! `Disconnected -> Connecting -> Handshaking -> Connected` and drops back to
//! `Disconnected` on teardown, on remote disconnect, on keep-alive loss and on a
//! failed send. Reconnection is lazy: the next [`ConnectionManager::send`]
//! starts a fresh attempt.

use crate::channel::{ChannelAdapter, Connector};
use crate::config::LinkConfig;
use crate::envelope::{Control, Envelope, Frame};
use crate::error::{RelayError, Result};
use crate::keepalive::{self, KeepAliveBeacon};
use crate::router::{Inbound, Outbound};
use crate::types::LinkName;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Link lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

struct ActiveLink {
    generation: u64,
    adapter: Arc<dyn ChannelAdapter>,
    beacon: Option<KeepAliveBeacon>,
}

type ReadySlot = Arc<Mutex<Option<oneshot::Sender<()>>>>;

enum SendFailure {
    Connect(RelayError),
    Stale { generation: u64, error: RelayError },
}

/// Connecting side of one link
pub struct ConnectionManager {
    link: LinkName,
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    state: watch::Sender<LinkState>,
    active: Mutex<Option<ActiveLink>>,
    connect_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    attempts: AtomicU64,
    me: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Create a manager. Inbound envelopes are pushed to `inbound` tagged with
    /// this manager as the return path; without a sink they are dropped.
    pub fn new(
        link: LinkName,
        connector: Arc<dyn Connector>,
        config: LinkConfig,
        inbound: Option<mpsc::UnboundedSender<Inbound>>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Arc::new_cyclic(|me| Self {
            link,
            config,
            connector,
            inbound,
            state,
            active: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            me: me.clone(),
        })
    }

    pub fn link(&self) -> &LinkName {
        &self.link
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Number of connect attempts made so far
    pub fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Unanswered keep-alive pings on the current link
    pub fn missed_pongs(&self) -> Option<u32> {
        let active = self.active.lock();
        active.as_ref()?.beacon.as_ref().map(|b| b.outstanding())
    }

    /// Establish the link if it is not already connected.
    ///
    /// Concurrent callers share one attempt.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(LinkState::Connecting);
        debug!(link = %self.link, attempt, "Connecting");

        let adapter = match self.connector.open(&self.link).await {
            Ok(adapter) => adapter,
            Err(e) => {
                self.state.send_replace(LinkState::Disconnected);
                warn!(link = %self.link, error = %e, "Connect failed");
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (ready_tx, ready_rx) = oneshot::channel();
        let ready: ReadySlot = Arc::new(Mutex::new(Some(ready_tx)));

        adapter.on_receive(self.frame_handler(generation, &adapter, Arc::clone(&ready)));
        adapter.on_disconnect(self.disconnect_handler(generation, ready));

        *self.active.lock() = Some(ActiveLink {
            generation,
            adapter: Arc::clone(&adapter),
            beacon: None,
        });
        self.state.send_replace(LinkState::Handshaking);

        if let Err(e) = adapter.send(Frame::Control(Control::ConnectionCheck)) {
            self.release(Some(generation));
            return Err(e);
        }

        match tokio::time::timeout(self.config.handshake_timeout, ready_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.release(Some(generation));
                return Err(RelayError::ChannelClosed(format!(
                    "{}: remote disconnected during handshake",
                    self.link
                )));
            }
            Err(_) => {
                self.release(Some(generation));
                warn!(link = %self.link, "Handshake timed out");
                return Err(RelayError::HandshakeTimeout {
                    link: self.link.to_string(),
                    timeout_ms: self.config.handshake_timeout.as_millis() as u64,
                });
            }
        }

        let beacon = self.config.keep_alive.clone().map(|config| {
            let me = self.me.clone();
            KeepAliveBeacon::start(Arc::clone(&adapter), config, move |err| {
                if let Some(manager) = me.upgrade() {
                    debug!(link = %manager.link, error = %err, "Releasing link after keep-alive loss");
                    manager.release(Some(generation));
                }
            })
        });

        let mut active = self.active.lock();
        match active.as_mut() {
            Some(link) if link.generation == generation => {
                link.beacon = beacon;
                self.state.send_replace(LinkState::Connected);
                info!(link = %self.link, attempt, "Link connected");
                Ok(())
            }
            _ => Err(RelayError::ChannelClosed(format!(
                "{}: link lost after handshake",
                self.link
            ))),
        }
    }

    /// Send an envelope, connecting lazily.
    ///
    /// A send that fails on a connected link triggers exactly one
    /// reconnect-and-resend; if that fails too the caller gets
    /// [`RelayError::DeliveryFailed`].
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        let frame = Frame::Envelope(envelope);
        let (generation, error) = match self.send_once(frame.clone()).await {
            Ok(()) => return Ok(()),
            Err(SendFailure::Connect(e)) => return Err(self.delivery_failed(e)),
            Err(SendFailure::Stale { generation, error }) => (generation, error),
        };

        warn!(link = %self.link, error = %error, "Send failed on connected link, reconnecting once");
        self.release(Some(generation));

        match self.send_once(frame).await {
            Ok(()) => Ok(()),
            Err(SendFailure::Connect(e)) | Err(SendFailure::Stale { error: e, .. }) => {
                Err(self.delivery_failed(e))
            }
        }
    }

    /// Tear the link down. The next send reconnects.
    pub fn disconnect(&self) {
        self.release(None);
        info!(link = %self.link, "Link disconnected");
    }

    async fn send_once(&self, frame: Frame) -> std::result::Result<(), SendFailure> {
        self.connect().await.map_err(SendFailure::Connect)?;

        let current = self
            .active
            .lock()
            .as_ref()
            .map(|link| (link.generation, Arc::clone(&link.adapter)));
        let Some((generation, adapter)) = current else {
            return Err(SendFailure::Connect(RelayError::ChannelClosed(
                self.link.to_string(),
            )));
        };

        adapter
            .send(frame)
            .map_err(|error| SendFailure::Stale { generation, error })
    }

    fn delivery_failed(&self, error: RelayError) -> RelayError {
        RelayError::DeliveryFailed {
            link: self.link.to_string(),
            reason: error.to_string(),
        }
    }

    /// Drop the active adapter. With `Some(generation)` only that generation
    /// is released, so late callbacks from a replaced adapter are ignored.
    fn release(&self, generation: Option<u64>) {
        let taken = {
            let mut active = self.active.lock();
            let matches = match (active.as_ref(), generation) {
                (Some(link), Some(g)) => link.generation == g,
                (None, Some(_)) => false,
                (_, None) => true,
            };
            if !matches {
                return;
            }
            self.state.send_replace(LinkState::Disconnected);
            active.take()
        };

        if let Some(link) = taken {
            if let Some(beacon) = &link.beacon {
                beacon.stop();
            }
            link.adapter.disconnect();
        }
    }

    fn on_pong(&self, generation: u64) {
        let active = self.active.lock();
        if let Some(link) = active.as_ref()
            && link.generation == generation
            && let Some(beacon) = &link.beacon
        {
            beacon.record_pong();
        }
    }

    fn frame_handler(
        &self,
        generation: u64,
        adapter: &Arc<dyn ChannelAdapter>,
        ready: ReadySlot,
    ) -> crate::channel::FrameHandler {
        let me = self.me.clone();
        let adapter = Arc::downgrade(adapter);
        Arc::new(move |frame| {
            let (Some(manager), Some(adapter)) = (me.upgrade(), adapter.upgrade()) else {
                return;
            };
            match frame {
                Frame::Control(Control::ConnectionReady) => {
                    if let Some(tx) = ready.lock().take() {
                        let _ = tx.send(());
                    }
                }
                Frame::Control(Control::ConnectionCheck) => {
                    if let Err(e) = adapter.send(Frame::Control(Control::ConnectionReady)) {
                        debug!(link = %manager.link, error = %e, "Ready reply failed");
                        manager.release(Some(generation));
                    }
                }
                Frame::Control(control) if control.is_pong() => manager.on_pong(generation),
                Frame::Control(control) => {
                    if let Err(e) = keepalive::answer(adapter.as_ref(), &control) {
                        debug!(link = %manager.link, error = %e, "Pong reply failed");
                        manager.release(Some(generation));
                    }
                }
                Frame::Envelope(envelope) => match &manager.inbound {
                    Some(tx) => {
                        let via: Arc<dyn Outbound> = manager.clone();
                        if tx.send(Inbound::new(envelope).via(via)).is_err() {
                            debug!(link = %manager.link, "Inbound sink closed");
                        }
                    }
                    None => {
                        debug!(link = %manager.link, action = %envelope.action, "No inbound sink, dropping envelope");
                    }
                },
            }
        })
    }

    fn disconnect_handler(
        &self,
        generation: u64,
        ready: ReadySlot,
    ) -> crate::channel::DisconnectHandler {
        let me = self.me.clone();
        Box::new(move || {
            ready.lock().take();
            if let Some(manager) = me.upgrade() {
                info!(link = %manager.link, "Remote end disconnected");
                manager.release(Some(generation));
            }
        })
    }
}

#[async_trait]
impl Outbound for ConnectionManager {
    fn link(&self) -> &LinkName {
        &self.link
    }

    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.send(envelope).await
    }
}
