//! Keep-alive sub-protocol
//!
//! The background host is evicted after a period of inactivity. Contexts that
//! hold a link into it run a [`KeepAliveBeacon`] that pings on a fixed period;
//! the host answers every ping with a pong. A beacon that sees `max_missed`
//! unanswered pings fails the link.

use crate::channel::{ChannelAdapter, Connector};
use crate::config::{KeepAliveConfig, LinkConfig, RelayConfig, RetryConfig};
use crate::connection::{ConnectionManager, LinkState};
use crate::envelope::{Control, Frame};
use crate::error::{RelayError, Result};
use crate::types::LinkName;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

/// Periodic ping over one adapter
pub struct KeepAliveBeacon {
    outstanding: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

impl KeepAliveBeacon {
    /// Start pinging. `on_lost` runs at most once, from the beacon task, when
    /// the link is considered dead.
    pub fn start<F>(adapter: Arc<dyn ChannelAdapter>, config: KeepAliveConfig, on_lost: F) -> Self
    where
        F: FnOnce(RelayError) + Send + 'static,
    {
        let outstanding = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&outstanding);

        let task = tokio::spawn(async move {
            let period = config.interval();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let missed = counter.load(Ordering::SeqCst);
                if missed >= config.max_missed {
                    warn!(link = %adapter.link(), missed, "Keep-alive lost");
                    on_lost(RelayError::ChannelClosed(format!(
                        "{}: {missed} keep-alive pings unanswered",
                        adapter.link()
                    )));
                    return;
                }

                if let Err(e) = adapter.send(Frame::Control(Control::ping())) {
                    warn!(link = %adapter.link(), error = %e, "Keep-alive ping failed");
                    on_lost(e);
                    return;
                }
                counter.fetch_add(1, Ordering::SeqCst);
                debug!(link = %adapter.link(), "Keep-alive ping sent");
            }
        });

        Self { outstanding, task }
    }

    /// A pong arrived
    pub fn record_pong(&self) {
        self.outstanding.store(0, Ordering::SeqCst);
    }

    /// Pings sent since the last pong
    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for KeepAliveBeacon {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Answer a keep-alive ping. Returns whether the control frame was a ping.
pub fn answer(adapter: &dyn ChannelAdapter, control: &Control) -> Result<bool> {
    match control {
        Control::KeepAlive { .. } if !control.is_pong() => {
            adapter.send(Frame::Control(Control::pong()))?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Serve the host side of a keep-alive-only link: acknowledge the handshake
/// and answer pings.
pub fn respond(adapter: Arc<dyn ChannelAdapter>) {
    let weak = Arc::downgrade(&adapter);
    adapter.on_receive(Arc::new(move |frame| {
        let Some(adapter) = weak.upgrade() else {
            return;
        };
        let result = match &frame {
            Frame::Control(Control::ConnectionCheck) => {
                adapter.send(Frame::Control(Control::ConnectionReady))
            }
            Frame::Control(control) => answer(adapter.as_ref(), control).map(|_| ()),
            Frame::Envelope(env) => {
                debug!(link = %adapter.link(), action = %env.action, "Ignoring envelope on keep-alive link");
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!(link = %adapter.link(), error = %e, "Keep-alive reply failed");
        }
    }));
    if let Err(e) = adapter.send(Frame::Control(Control::ConnectionReady)) {
        debug!(link = %adapter.link(), error = %e, "Keep-alive ready failed");
    }
}

/// Dedicated keep-alive link with a backoff reconnect supervisor
pub struct KeepAliveSession {
    manager: Arc<ConnectionManager>,
    supervisor: JoinHandle<()>,
}

impl KeepAliveSession {
    /// Open the `KEEP_ALIVE_INTERVAL` link and keep it open
    pub async fn start(connector: Arc<dyn Connector>, config: &RelayConfig) -> Result<Self> {
        let link_config = LinkConfig::default()
            .with_handshake_timeout(config.handshake_timeout())
            .with_keep_alive(config.keep_alive.clone());
        let manager = ConnectionManager::new(LinkName::keep_alive(), connector, link_config, None);
        manager.connect().await?;
        info!(link = %manager.link(), "Keep-alive session started");

        let supervisor = tokio::spawn(supervise(Arc::clone(&manager), config.reconnect.clone()));
        Ok(Self {
            manager,
            supervisor,
        })
    }

    pub fn state(&self) -> LinkState {
        self.manager.state()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Whether the supervisor is still watching the link
    pub fn is_supervised(&self) -> bool {
        !self.supervisor.is_finished()
    }

    /// Stop reconnecting and tear the link down
    pub fn close(&self) {
        self.supervisor.abort();
        self.manager.disconnect();
        info!(link = %self.manager.link(), "Keep-alive session closed");
    }
}

impl Drop for KeepAliveSession {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

async fn supervise(manager: Arc<ConnectionManager>, retry: RetryConfig) {
    let mut state = manager.subscribe_state();
    loop {
        if state
            .wait_for(|s| *s == LinkState::Disconnected)
            .await
            .is_err()
        {
            return;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            if attempt > retry.max_attempts {
                error!(
                    link = %manager.link(),
                    attempts = retry.max_attempts,
                    "Keep-alive reconnect attempts exhausted"
                );
                return;
            }

            tokio::time::sleep(retry.delay_for(attempt)).await;
            match manager.connect().await {
                Ok(()) => {
                    info!(link = %manager.link(), attempt, "Keep-alive link re-established");
                    break;
                }
                Err(e) => {
                    warn!(link = %manager.link(), attempt, error = %e, "Keep-alive reconnect failed");
                }
            }
        }
    }
}
