//! Channel adapter abstraction
//!
//! A [`ChannelAdapter`] wraps one end of a duplex primitive (a runtime port, a
//! broadcast channel, a WebSocket) behind a uniform send / receive / disconnect
//! surface. A [`Connector`] opens fresh adapters for a named link and is what the
//! connection manager uses on every connect attempt.

use crate::envelope::Frame;
use crate::error::Result;
use crate::types::LinkName;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Callback invoked for every inbound frame
pub type FrameHandler = Arc<dyn Fn(Frame) + Send + Sync>;

/// Callback invoked once when the remote end goes away
pub type DisconnectHandler = Box<dyn FnOnce() + Send>;

/// One end of a duplex link
pub trait ChannelAdapter: Send + Sync {
    /// Link this adapter belongs to
    fn link(&self) -> &LinkName;

    /// Post a frame to the remote end.
    ///
    /// Fails with [`RelayError::ChannelClosed`](crate::RelayError::ChannelClosed)
    /// once the adapter is disconnected or the remote end is gone.
    fn send(&self, frame: Frame) -> Result<()>;

    /// Register a receive handler. Frames that arrived before the first
    /// handler are delivered to it in order.
    fn on_receive(&self, handler: FrameHandler);

    /// Register a handler for remote disconnection
    fn on_disconnect(&self, handler: DisconnectHandler);

    /// Tear down this end and unregister every handler
    fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// Opens adapters for a named link
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, link: &LinkName) -> Result<Arc<dyn ChannelAdapter>>;
}

#[derive(Default)]
struct HandlerState {
    receivers: Vec<FrameHandler>,
    on_disconnect: Vec<DisconnectHandler>,
    closed: bool,
}

/// Handler registry shared by adapter implementations.
///
/// Only the adapter's reader task calls [`HandlerSet::deliver`], so frames reach
/// handlers in arrival order. No lock is held while a handler runs.
#[derive(Default)]
pub struct HandlerSet {
    state: Mutex<HandlerState>,
    registered: Notify,
}

impl HandlerSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_receiver(&self, handler: FrameHandler) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.receivers.push(handler);
        }
        self.registered.notify_one();
    }

    pub fn add_disconnect(&self, handler: DisconnectHandler) {
        let mut state = self.state.lock();
        if !state.closed {
            state.on_disconnect.push(handler);
        }
    }

    /// Resolves after a receive handler has been registered
    pub async fn registered(&self) {
        self.registered.notified().await;
    }

    pub fn has_receivers(&self) -> bool {
        !self.state.lock().receivers.is_empty()
    }

    /// Drain `backlog` into the registered handlers. Frames stay queued while no
    /// handler is registered.
    pub fn deliver(&self, backlog: &mut VecDeque<Frame>) {
        loop {
            let receivers = {
                let state = self.state.lock();
                if state.closed || state.receivers.is_empty() {
                    return;
                }
                state.receivers.clone()
            };
            let Some(frame) = backlog.pop_front() else {
                return;
            };
            if let Some((last, rest)) = receivers.split_last() {
                for handler in rest {
                    handler(frame.clone());
                }
                last(frame);
            }
        }
    }

    /// Remote end went away: fire disconnect handlers once and unregister all
    pub fn fire_disconnect(&self) {
        let handlers = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.receivers.clear();
            std::mem::take(&mut state.on_disconnect)
        };
        for handler in handlers {
            handler();
        }
    }

    /// Local teardown: unregister everything without firing
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.receivers.clear();
        state.on_disconnect.clear();
    }
}
