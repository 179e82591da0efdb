//! In-process channel adapters
//!
//! [`MemoryRuntime`] stands in for the extension runtime's port API: a context
//! listens on a link name and other contexts connect to it, each connection
//! yielding a pair of [`MemoryPort`]s. [`BroadcastHub`] stands in for the
//! same-origin broadcast channel used between the page and the content script.

use crate::channel::{ChannelAdapter, Connector, DisconnectHandler, FrameHandler, HandlerSet};
use crate::envelope::Frame;
use crate::error::{RelayError, Result};
use crate::types::LinkName;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const NO_RECEIVER: &str = "Could not establish connection. Receiving end does not exist.";

// ============================================================================
// Port pairs
// ============================================================================

/// One end of an in-process duplex port
pub struct MemoryPort {
    link: LinkName,
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    handlers: Arc<HandlerSet>,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryPort {
    /// Create both ends of a port. Must be called inside a tokio runtime.
    pub fn pair(link: LinkName) -> (Arc<MemoryPort>, Arc<MemoryPort>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Self::spawn(link.clone(), a_tx, b_rx);
        let b = Self::spawn(link, b_tx, a_rx);
        (a, b)
    }

    fn spawn(
        link: LinkName,
        tx: mpsc::UnboundedSender<Frame>,
        rx: mpsc::UnboundedReceiver<Frame>,
    ) -> Arc<MemoryPort> {
        let handlers = HandlerSet::new();
        let connected = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(pump(
            link.clone(),
            rx,
            Arc::clone(&handlers),
            Arc::clone(&connected),
        ));

        Arc::new(MemoryPort {
            link,
            tx: Mutex::new(Some(tx)),
            handlers,
            connected,
            reader: Mutex::new(Some(reader)),
        })
    }
}

async fn pump(
    link: LinkName,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    handlers: Arc<HandlerSet>,
    connected: Arc<AtomicBool>,
) {
    let mut backlog = VecDeque::new();
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => backlog.push_back(frame),
                None => {
                    handlers.deliver(&mut backlog);
                    connected.store(false, Ordering::SeqCst);
                    debug!(link = %link, "Remote end disconnected");
                    handlers.fire_disconnect();
                    return;
                }
            },
            _ = handlers.registered() => {}
        }
        handlers.deliver(&mut backlog);
    }
}

impl ChannelAdapter for MemoryPort {
    fn link(&self) -> &LinkName {
        &self.link
    }

    fn send(&self, frame: Frame) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RelayError::ChannelClosed(self.link.to_string()));
        }
        let tx = self.tx.lock();
        let tx = tx
            .as_ref()
            .ok_or_else(|| RelayError::ChannelClosed(self.link.to_string()))?;
        tx.send(frame)
            .map_err(|_| RelayError::ChannelClosed(self.link.to_string()))
    }

    fn on_receive(&self, handler: FrameHandler) {
        self.handlers.add_receiver(handler);
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        self.handlers.add_disconnect(handler);
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.tx.lock().take();
        self.handlers.clear();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.tx.lock().is_some()
    }
}

impl Drop for MemoryPort {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Accepts incoming connections on one link name
pub struct PortListener {
    link: LinkName,
    rx: mpsc::UnboundedReceiver<Arc<dyn ChannelAdapter>>,
}

impl PortListener {
    pub fn link(&self) -> &LinkName {
        &self.link
    }

    /// Next connected port, or `None` once the runtime stopped listening
    pub async fn accept(&mut self) -> Option<Arc<dyn ChannelAdapter>> {
        self.rx.recv().await
    }
}

/// In-process registry of listening links
#[derive(Clone, Default)]
pub struct MemoryRuntime {
    listeners: Arc<DashMap<LinkName, mpsc::UnboundedSender<Arc<dyn ChannelAdapter>>>>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting connections on `link`, replacing any previous listener
    pub fn listen(&self, link: LinkName) -> PortListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(link.clone(), tx);
        PortListener { link, rx }
    }

    /// Stop accepting connections on `link`
    pub fn unlisten(&self, link: &LinkName) {
        self.listeners.remove(link);
    }

    pub fn is_listening(&self, link: &LinkName) -> bool {
        self.listeners
            .get(link)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Connect to a listening link and return the local end
    pub fn connect(&self, link: &LinkName) -> Result<Arc<MemoryPort>> {
        let listener = self
            .listeners
            .get(link)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RelayError::ChannelClosed(format!("{link}: {NO_RECEIVER}")))?;

        let (local, remote) = MemoryPort::pair(link.clone());
        if listener.send(remote as Arc<dyn ChannelAdapter>).is_err() {
            self.listeners.remove(link);
            local.disconnect();
            return Err(RelayError::ChannelClosed(format!("{link}: {NO_RECEIVER}")));
        }
        debug!(link = %link, "Port connected");
        Ok(local)
    }
}

#[async_trait]
impl Connector for MemoryRuntime {
    async fn open(&self, link: &LinkName) -> Result<Arc<dyn ChannelAdapter>> {
        let port = self.connect(link)?;
        Ok(port)
    }
}

// ============================================================================
// Broadcast channel
// ============================================================================

const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Named same-process broadcast channels
#[derive(Clone)]
pub struct BroadcastHub {
    channels: Arc<DashMap<LinkName, broadcast::Sender<(u64, Frame)>>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity,
        }
    }

    /// Join the channel named `link`. Every member receives the frames posted
    /// by every other member.
    pub fn join(&self, link: LinkName) -> Arc<BroadcastPort> {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        let tx = self
            .channels
            .entry(link.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        let rx = tx.subscribe();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let handlers = HandlerSet::new();
        let reader = tokio::spawn(broadcast_pump(link.clone(), id, rx, Arc::clone(&handlers)));

        Arc::new(BroadcastPort {
            link,
            id,
            tx,
            handlers,
            connected: AtomicBool::new(true),
            reader: Mutex::new(Some(reader)),
        })
    }
}

impl BroadcastHub {
    /// Channels with at least one member as of the last join
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl Connector for BroadcastHub {
    async fn open(&self, link: &LinkName) -> Result<Arc<dyn ChannelAdapter>> {
        let port = self.join(link.clone());
        Ok(port)
    }
}

/// Member of a broadcast channel
pub struct BroadcastPort {
    link: LinkName,
    id: u64,
    tx: broadcast::Sender<(u64, Frame)>,
    handlers: Arc<HandlerSet>,
    connected: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

async fn broadcast_pump(
    link: LinkName,
    id: u64,
    mut rx: broadcast::Receiver<(u64, Frame)>,
    handlers: Arc<HandlerSet>,
) {
    let mut backlog = VecDeque::new();
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Ok((sender, frame)) if sender != id => backlog.push_back(frame),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(link = %link, skipped, "Broadcast receiver lagged");
                }
                // The port holds a sender, so this only follows its own drop
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = handlers.registered() => {}
        }
        handlers.deliver(&mut backlog);
    }
}

impl ChannelAdapter for BroadcastPort {
    fn link(&self) -> &LinkName {
        &self.link
    }

    fn send(&self, frame: Frame) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RelayError::ChannelClosed(self.link.to_string()));
        }
        self.tx
            .send((self.id, frame))
            .map(|_| ())
            .map_err(|_| RelayError::ChannelClosed(self.link.to_string()))
    }

    fn on_receive(&self, handler: FrameHandler) {
        self.handlers.add_receiver(handler);
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        self.handlers.add_disconnect(handler);
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.handlers.clear();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for BroadcastPort {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}
