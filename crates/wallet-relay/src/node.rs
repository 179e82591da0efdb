//! Context wiring
//!
//! Each node owns one [`Router`] and the links its context holds:
//!
//! - [`PageNode`] connects to the content script over the broadcast channel.
//! - [`ContentNode`] accepts the page and connects to the background.
//! - [`BackgroundNode`] listens for content scripts, popups and keep-alive
//!   ports, and hosts the approval broker and the wallet core. Each accepted
//!   link only carries envelopes from the contexts that live behind it.
//! - [`PopupNode`] connects to the background to read and answer approvals.

use crate::approval::{ApprovalBroker, ApprovalRequest};
use crate::authorization::{OriginAuthorizer, PageGate};
use crate::channel::ChannelAdapter;
use crate::config::RelayConfig;
use crate::connection::{ConnectionManager, LinkState};
use crate::envelope::Envelope;
use crate::error::{RelayError, Result};
use crate::keepalive::{self, KeepAliveSession};
use crate::memory::{BroadcastHub, MemoryRuntime, PortListener};
use crate::router::{AcceptedLink, Inbound, LinkPolicy, LocalHandler, Outbound, Router};
use crate::service::{ApprovalGate, WalletCore, WalletService};
use crate::storage::WalletStorage;
use crate::transport::MessageTransport;
use crate::types::{Context, LinkName, actions};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// Accepted links
// ============================================================================

/// Live accepted links of one link name
#[derive(Default)]
pub struct LinkGroup {
    links: Mutex<Vec<Arc<AcceptedLink>>>,
}

impl LinkGroup {
    fn add(&self, link: Arc<AcceptedLink>) {
        let mut links = self.links.lock();
        links.retain(|l| l.is_connected());
        links.push(link);
    }

    fn live(&self) -> Vec<Arc<AcceptedLink>> {
        let mut links = self.links.lock();
        links.retain(|l| l.is_connected());
        links.clone()
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send to every live link; returns how many took it
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        let mut delivered = 0;
        for link in self.live() {
            match link.deliver(envelope.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(link = %link.link(), error = %e, "Broadcast skipped link"),
            }
        }
        delivered
    }

    fn close_all(&self) {
        for link in self.links.lock().drain(..) {
            link.close();
        }
    }
}

/// Route toward the most recently accepted live link of a group
struct LatestLink {
    name: LinkName,
    group: Arc<LinkGroup>,
}

#[async_trait]
impl Outbound for LatestLink {
    fn link(&self) -> &LinkName {
        &self.name
    }

    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        match self.group.live().pop() {
            Some(link) => link.deliver(envelope).await,
            None => Err(RelayError::DeliveryFailed {
                link: self.name.to_string(),
                reason: "no connected peer".to_string(),
            }),
        }
    }
}

// ============================================================================
// Background
// ============================================================================

/// Privileged host: wallet core, approval broker and all inbound links
pub struct BackgroundNode {
    runtime: MemoryRuntime,
    broker: Arc<ApprovalBroker>,
    authorizer: Option<Arc<OriginAuthorizer>>,
    router: Arc<Router>,
    inbound: mpsc::UnboundedSender<Inbound>,
    content: Arc<LinkGroup>,
    popups: Arc<LinkGroup>,
    keep_alive: Mutex<Vec<Arc<dyn ChannelAdapter>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundNode {
    /// Start listening on `CONTENT_BG`, `BG_POPUP` and `KEEP_ALIVE_INTERVAL`.
    ///
    /// Without wallet storage there is nothing to check page access against,
    /// so pages are admitted as they come; see [`BackgroundNode::start_with_storage`].
    pub fn start(runtime: MemoryRuntime, core: Arc<dyn WalletCore>, config: &RelayConfig) -> Arc<Self> {
        Self::start_inner(runtime, core, None, config)
    }

    /// Start with page access checked against `storage`: pages get NO_WALLET
    /// until a wallet exists, and gated actions need an origin granted
    /// through an approved `REQUEST_ACCOUNTS`
    pub fn start_with_storage(
        runtime: MemoryRuntime,
        core: Arc<dyn WalletCore>,
        storage: WalletStorage,
        config: &RelayConfig,
    ) -> Arc<Self> {
        Self::start_inner(runtime, core, Some(storage), config)
    }

    fn start_inner(
        runtime: MemoryRuntime,
        core: Arc<dyn WalletCore>,
        storage: Option<WalletStorage>,
        config: &RelayConfig,
    ) -> Arc<Self> {
        let broker = Arc::new(ApprovalBroker::new());
        let popups = Arc::new(LinkGroup::default());
        let authorizer = storage.map(|storage| Arc::new(OriginAuthorizer::new(storage)));
        let readiness = core.readiness();

        let mut gate = ApprovalGate::new(Arc::clone(&broker), config.approval_ttl());
        if let Some(authorizer) = &authorizer {
            gate = gate.with_authorizer(Arc::clone(authorizer));
        }
        let wallet = Arc::new(WalletService::new(Context::Background, core));

        let to_popup = Arc::new(LatestLink {
            name: LinkName::bg_popup(),
            group: Arc::clone(&popups),
        });
        let mut router = Router::new(Context::Background)
            .with_route(Context::Popup, to_popup)
            .with_approvals(Arc::new(gate))
            .with_local(wallet);
        if let Some(authorizer) = &authorizer {
            router = router.with_admission(Arc::new(PageGate::new(Arc::clone(authorizer))));
        }
        if let Some(ready) = readiness {
            router = router.with_readiness(ready);
        }
        let router = Arc::new(router);

        let (inbound, rx) = mpsc::unbounded_channel();
        let node = Arc::new(Self {
            runtime: runtime.clone(),
            broker,
            authorizer,
            router: Arc::clone(&router),
            inbound,
            content: Arc::new(LinkGroup::default()),
            popups,
            keep_alive: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = vec![tokio::spawn(router.run(rx))];
        for link in [LinkName::content_bg(), LinkName::bg_popup(), LinkName::keep_alive()] {
            let listener = runtime.listen(link);
            tasks.push(tokio::spawn(accept_loop(Arc::downgrade(&node), listener)));
        }
        tasks.push(tokio::spawn(announce_approvals(Arc::downgrade(&node))));
        node.tasks.lock().extend(tasks);

        info!("Background node started");
        node
    }

    pub fn runtime(&self) -> &MemoryRuntime {
        &self.runtime
    }

    pub fn broker(&self) -> &Arc<ApprovalBroker> {
        &self.broker
    }

    /// Origin grants, when the node checks page access
    pub fn authorizer(&self) -> Option<&Arc<OriginAuthorizer>> {
        self.authorizer.as_ref()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn content_links(&self) -> &Arc<LinkGroup> {
        &self.content
    }

    pub fn popup_links(&self) -> &Arc<LinkGroup> {
        &self.popups
    }

    /// Serve an adapter opened by another context, dispatched on its link name
    pub fn accept(&self, adapter: Arc<dyn ChannelAdapter>) {
        let name = adapter.link().clone();
        match name.as_str() {
            LinkName::CONTENT_BG => {
                let policy = LinkPolicy::from_contexts(&[Context::Injected, Context::Content]);
                self.content
                    .add(AcceptedLink::serve_with(adapter, self.inbound.clone(), policy));
            }
            LinkName::BG_POPUP => {
                let popups = Arc::clone(&self.popups);
                let broker = Arc::clone(&self.broker);
                adapter.on_disconnect(Box::new(move || {
                    if popups.is_empty() && broker.dismiss() {
                        info!("Popup closed with a pending approval, rejected");
                    }
                }));
                let policy = LinkPolicy::from_contexts(&[Context::Popup]);
                self.popups
                    .add(AcceptedLink::serve_with(adapter, self.inbound.clone(), policy));
            }
            LinkName::KEEP_ALIVE_INTERVAL => {
                keepalive::respond(Arc::clone(&adapter));
                let mut ports = self.keep_alive.lock();
                ports.retain(|p| p.is_connected());
                ports.push(adapter);
            }
            other => {
                warn!(link = %other, "Refusing unknown link");
                adapter.disconnect();
            }
        }
    }

    /// Send an EVENT to every connected page and popup
    pub async fn broadcast_event(&self, action: &str, data: Value) -> usize {
        let to_page = Envelope::event(action, data.clone(), Context::Background, Context::Injected);
        let to_popup = Envelope::event(action, data, Context::Background, Context::Popup);
        self.content.broadcast(&to_page).await + self.popups.broadcast(&to_popup).await
    }

    /// Stop listening and drop every link
    pub fn shutdown(&self) {
        for link in [LinkName::content_bg(), LinkName::bg_popup(), LinkName::keep_alive()] {
            self.runtime.unlisten(&link);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.content.close_all();
        self.popups.close_all();
        for port in self.keep_alive.lock().drain(..) {
            port.disconnect();
        }
        info!("Background node stopped");
    }
}

impl Drop for BackgroundNode {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn accept_loop(node: Weak<BackgroundNode>, mut listener: PortListener) {
    debug!(link = %listener.link(), "Accepting");
    while let Some(adapter) = listener.accept().await {
        let Some(node) = node.upgrade() else {
            return;
        };
        node.accept(adapter);
    }
}

/// Tell open popups about every newly shown approval
async fn announce_approvals(node: Weak<BackgroundNode>) {
    let Some(mut views) = node.upgrade().map(|n| n.broker.subscribe()) else {
        return;
    };
    let mut last_id = None;
    while views.changed().await.is_ok() {
        let view = views.borrow_and_update().clone();
        let Some(request) = view.current_request else {
            last_id = None;
            continue;
        };
        if last_id.as_deref() == Some(request.id.as_str()) {
            continue;
        }
        last_id = Some(request.id.clone());

        let Some(node) = node.upgrade() else {
            return;
        };
        let event = Envelope::event(
            actions::APPROVAL_REQUESTED,
            json!(request),
            Context::Background,
            Context::Popup,
        );
        let reached = node.popups.broadcast(&event).await;
        debug!(approval_id = %request.id, popups = reached, "Approval announced");
    }
}

// ============================================================================
// Content script
// ============================================================================

/// Bridge between the page and the background
pub struct ContentNode {
    page: Arc<AcceptedLink>,
    background: Arc<ConnectionManager>,
    keep_alive: Option<KeepAliveSession>,
    router_task: JoinHandle<()>,
}

impl ContentNode {
    /// Join the page channel and connect to the background.
    ///
    /// A failed first connect is logged; the link reconnects on the next send.
    /// Whatever origin the page writes into its envelopes is passed on as is.
    pub async fn start(runtime: MemoryRuntime, hub: &BroadcastHub, config: &RelayConfig) -> Self {
        Self::start_inner(runtime, hub, config, None).await
    }

    /// Like [`ContentNode::start`], for a page known to be served from
    /// `origin`; every page envelope is stamped with it
    pub async fn start_for_origin(
        runtime: MemoryRuntime,
        hub: &BroadcastHub,
        config: &RelayConfig,
        origin: impl Into<String>,
    ) -> Self {
        Self::start_inner(runtime, hub, config, Some(origin.into())).await
    }

    async fn start_inner(
        runtime: MemoryRuntime,
        hub: &BroadcastHub,
        config: &RelayConfig,
        origin: Option<String>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let background = ConnectionManager::new(
            LinkName::content_bg(),
            Arc::new(runtime.clone()),
            config.background_link(),
            Some(tx.clone()),
        );
        // The page may only speak as itself
        let mut policy = LinkPolicy::from_contexts(&[Context::Injected]);
        if let Some(origin) = origin {
            policy = policy.with_origin(origin);
        }
        let page = AcceptedLink::serve_with(hub.join(LinkName::inject_content()), tx, policy);

        let router = Arc::new(
            Router::new(Context::Content)
                .with_route(Context::Background, background.clone())
                .with_route(Context::Popup, background.clone())
                .with_route(Context::Injected, page.clone()),
        );
        let router_task = tokio::spawn(router.run(rx));

        if let Err(e) = background.connect().await {
            warn!(link = %background.link(), error = %e, "Background not reachable yet");
        }

        let keep_alive = if config.keep_alive_enabled {
            match KeepAliveSession::start(Arc::new(runtime), config).await {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(error = %e, "Keep-alive session not started");
                    None
                }
            }
        } else {
            None
        };

        info!("Content node started");
        Self {
            page,
            background,
            keep_alive,
            router_task,
        }
    }

    pub fn background(&self) -> &Arc<ConnectionManager> {
        &self.background
    }

    pub fn background_state(&self) -> LinkState {
        self.background.state()
    }

    pub fn keep_alive(&self) -> Option<&KeepAliveSession> {
        self.keep_alive.as_ref()
    }

    pub fn shutdown(&self) {
        self.router_task.abort();
        if let Some(session) = &self.keep_alive {
            session.close();
        }
        self.background.disconnect();
        self.page.close();
        info!("Content node stopped");
    }
}

impl Drop for ContentNode {
    fn drop(&mut self) {
        self.router_task.abort();
    }
}

// ============================================================================
// Callers
// ============================================================================

/// Router plus transport for a context that originates calls
struct CallerParts {
    manager: Arc<ConnectionManager>,
    transport: Arc<MessageTransport>,
    tasks: Vec<JoinHandle<()>>,
}

impl CallerParts {
    fn build(
        context: Context,
        link: LinkName,
        connector: Arc<dyn crate::channel::Connector>,
        link_config: crate::config::LinkConfig,
        config: &RelayConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(link, connector, link_config, Some(tx));
        let transport = MessageTransport::new(context, manager.clone(), config.response_timeout());
        let local: Arc<dyn LocalHandler> = transport.clone();
        let router = Arc::new(Router::new(context).with_local(local));

        let watcher = transport.watch_link(manager.subscribe_state());
        let run = tokio::spawn(router.run(rx));
        Self {
            manager,
            transport,
            tasks: vec![run, watcher],
        }
    }

    fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.manager.disconnect();
    }
}

/// Injected page script: the dApp-facing provider
pub struct PageNode {
    parts: CallerParts,
}

impl PageNode {
    pub async fn start(hub: &BroadcastHub, config: &RelayConfig) -> Result<Self> {
        let parts = CallerParts::build(
            Context::Injected,
            LinkName::inject_content(),
            Arc::new(hub.clone()),
            config.plain_link(),
            config,
        );
        parts.manager.connect().await?;
        info!("Page node started");
        Ok(Self { parts })
    }

    pub fn transport(&self) -> &Arc<MessageTransport> {
        &self.parts.transport
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.parts.manager
    }

    /// Call the wallet in the background
    pub async fn request(&self, action: &str, data: Value) -> Result<Value> {
        self.parts.transport.request(action, data, Context::Background).await
    }

    /// Wallet events such as `accountsChanged`
    pub fn events(&self) -> broadcast::Receiver<Envelope> {
        self.parts.transport.subscribe_events()
    }

    pub fn shutdown(&self) {
        self.parts.stop();
    }
}

impl Drop for PageNode {
    fn drop(&mut self) {
        self.parts.stop();
    }
}

/// Approval window
pub struct PopupNode {
    parts: CallerParts,
}

impl PopupNode {
    pub async fn start(runtime: MemoryRuntime, config: &RelayConfig) -> Result<Self> {
        let parts = CallerParts::build(
            Context::Popup,
            LinkName::bg_popup(),
            Arc::new(runtime),
            config.background_link(),
            config,
        );
        parts.manager.connect().await?;
        info!("Popup node started");
        Ok(Self { parts })
    }

    pub fn transport(&self) -> &Arc<MessageTransport> {
        &self.parts.transport
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.parts.manager
    }

    /// Pending approval, if any
    pub async fn get_approve_data(&self) -> Result<Option<ApprovalRequest>> {
        let data = self
            .parts
            .transport
            .request(actions::GET_APPROVE_DATA, Value::Null, Context::Background)
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Confirm the pending approval with `result`
    pub async fn approve(&self, result: Value) -> Result<bool> {
        let ack = self
            .parts
            .transport
            .request(actions::APPROVE_RESPONSE, result, Context::Background)
            .await?;
        Ok(ack["resolved"].as_bool().unwrap_or(false))
    }

    /// Decline the pending approval
    pub async fn reject(&self) -> Result<bool> {
        let ack = self
            .parts
            .transport
            .request(actions::REJECT_RESPONSE, Value::Null, Context::Background)
            .await?;
        Ok(ack["resolved"].as_bool().unwrap_or(false))
    }

    /// Announcements such as `APPROVAL_REQUESTED`
    pub fn events(&self) -> broadcast::Receiver<Envelope> {
        self.parts.transport.subscribe_events()
    }

    /// Close the window
    pub fn close(&self) {
        self.parts.stop();
    }
}

impl Drop for PopupNode {
    fn drop(&mut self) {
        self.parts.stop();
    }
}
