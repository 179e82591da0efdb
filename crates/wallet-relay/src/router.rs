//! Envelope routing
//!
//! Each context runs one [`Router`]. For every inbound envelope it decides,
//! without side effects, whether to forward it toward its destination, hand it
//! to the approval gate, or handle it locally ([`Router::decide`]); then it
//! carries that decision out ([`Router::route`]). Routing never fails past this
//! boundary: malformed envelopes are logged and dropped, and undeliverable
//! requests are answered with an error toward their sender.

use crate::approval::ApprovalPolicy;
use crate::channel::ChannelAdapter;
use crate::envelope::{Control, Envelope, Frame};
use crate::error::{ErrorPayload, RelayError, Result};
use crate::keepalive;
use crate::types::{ActionRegistry, Context, LinkName, MessageType, actions};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Return path toward a neighbouring context
#[async_trait]
pub trait Outbound: Send + Sync {
    fn link(&self) -> &LinkName;

    async fn deliver(&self, envelope: Envelope) -> Result<()>;
}

/// Envelope received on some link
#[derive(Clone)]
pub struct Inbound {
    pub envelope: Envelope,
    /// Link the envelope arrived on, used when no route names its destination
    pub via: Option<Arc<dyn Outbound>>,
}

impl Inbound {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            via: None,
        }
    }

    pub fn via(mut self, via: Arc<dyn Outbound>) -> Self {
        self.via = Some(via);
        self
    }
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("envelope", &self.envelope)
            .field("via", &self.via.as_ref().map(|v| v.link().to_string()))
            .finish()
    }
}

/// Return path handed to local handlers that answer later
#[derive(Clone, Default)]
pub struct ReplyTo {
    via: Option<Arc<dyn Outbound>>,
}

impl ReplyTo {
    pub fn new(via: Option<Arc<dyn Outbound>>) -> Self {
        Self { via }
    }

    /// Link the envelope arrived on; the only sender identity a handler can trust
    pub fn link(&self) -> Option<&LinkName> {
        self.via.as_ref().map(|v| v.link())
    }

    /// Deliver a late response over the link the request arrived on
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        match &self.via {
            Some(outbound) => outbound.deliver(envelope).await,
            None => Err(RelayError::DeliveryFailed {
                link: envelope.to().map(|c| c.to_string()).unwrap_or_default(),
                reason: "no return path".to_string(),
            }),
        }
    }
}

/// Logic that consumes envelopes addressed to this context
#[async_trait]
pub trait LocalHandler: Send + Sync {
    /// Handle an envelope; a returned envelope is routed as the response.
    /// Handlers that answer later keep `reply` and send through it.
    async fn handle(&self, envelope: Envelope, reply: ReplyTo) -> Option<Envelope>;
}

/// Screens envelopes before they are handled in this context
#[async_trait]
pub trait Admission: Send + Sync {
    /// `Err` refuses the envelope; requests are answered with the payload
    async fn admit(&self, envelope: &Envelope, via: Option<&LinkName>) -> std::result::Result<(), ErrorPayload>;
}

/// Where the router sends an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Addressed elsewhere; pass it on unchanged
    Forward(Context),
    /// Needs the approval broker hosted here
    Approval,
    /// Handle in this context
    Local,
}

/// Whether an envelope belongs to the approval workflow
pub fn is_approval_domain(envelope: &Envelope, policy: &ApprovalPolicy) -> bool {
    envelope.kind == MessageType::Approve
        || policy.requires_approval(&envelope.action)
        || matches!(
            envelope.action.as_str(),
            actions::GET_APPROVE_DATA | actions::APPROVE_RESPONSE | actions::REJECT_RESPONSE
        )
}

/// Per-context dispatcher
pub struct Router {
    context: Context,
    routes: HashMap<Context, Arc<dyn Outbound>>,
    actions: ActionRegistry,
    policy: ApprovalPolicy,
    approvals: Option<Arc<dyn LocalHandler>>,
    local: Option<Arc<dyn LocalHandler>>,
    admission: Option<Arc<dyn Admission>>,
    readiness: Option<watch::Receiver<bool>>,
}

impl Router {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            routes: HashMap::new(),
            actions: ActionRegistry::default(),
            policy: ApprovalPolicy::default(),
            approvals: None,
            local: None,
            admission: None,
            readiness: None,
        }
    }

    /// Route envelopes addressed to `to` through `outbound`
    pub fn with_route(mut self, to: Context, outbound: Arc<dyn Outbound>) -> Self {
        self.routes.insert(to, outbound);
        self
    }

    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Host the approval broker in this context
    pub fn with_approvals(mut self, gate: Arc<dyn LocalHandler>) -> Self {
        self.approvals = Some(gate);
        self
    }

    pub fn with_local(mut self, handler: Arc<dyn LocalHandler>) -> Self {
        self.local = Some(handler);
        self
    }

    /// Screen envelopes handled here with `admission`
    pub fn with_admission(mut self, admission: Arc<dyn Admission>) -> Self {
        self.admission = Some(admission);
        self
    }

    /// Hold envelopes for this context until `ready` turns true.
    ///
    /// Popup traffic and envelopes passing through are never held.
    pub fn with_readiness(mut self, ready: watch::Receiver<bool>) -> Self {
        self.readiness = Some(ready);
        self
    }

    pub fn context(&self) -> Context {
        self.context
    }

    /// Pure routing decision
    pub fn decide(&self, envelope: &Envelope) -> Result<Dispatch> {
        let meta = envelope.validate()?;
        if !self.actions.contains(&envelope.action) {
            return Err(RelayError::MalformedEnvelope(format!(
                "unknown action {}",
                envelope.action
            )));
        }

        if meta.to != self.context {
            return Ok(Dispatch::Forward(meta.to));
        }

        if self.approvals.is_some() && is_approval_domain(envelope, &self.policy) {
            return Ok(Dispatch::Approval);
        }

        Ok(Dispatch::Local)
    }

    /// Carry out the routing decision for one inbound envelope
    pub async fn route(&self, inbound: Inbound) {
        let Inbound { envelope, via } = inbound;

        let dispatch = match self.decide(&envelope) {
            Ok(dispatch) => dispatch,
            Err(e) => {
                warn!(
                    context = %self.context,
                    action = %envelope.action,
                    error = %e,
                    "Dropping envelope"
                );
                return;
            }
        };

        debug!(context = %self.context, action = %envelope.action, ?dispatch, "Routing envelope");
        if !matches!(dispatch, Dispatch::Forward(_))
            && let Some(admission) = &self.admission
            && let Err(refusal) = admission.admit(&envelope, via.as_ref().map(|v| v.link())).await
        {
            warn!(
                context = %self.context,
                action = %envelope.action,
                code = refusal.code,
                "Envelope refused"
            );
            if envelope.kind.expects_response() {
                let reply = envelope.reply_error(self.context, refusal);
                self.respond(reply, via).await;
            }
            return;
        }

        match dispatch {
            Dispatch::Forward(to) => self.forward(to, envelope, via).await,
            Dispatch::Approval => {
                if let Some(gate) = &self.approvals
                    && let Some(response) = gate.handle(envelope, ReplyTo::new(via.clone())).await
                {
                    self.respond(response, via).await;
                }
            }
            Dispatch::Local => match &self.local {
                Some(handler) => {
                    if let Some(response) = handler.handle(envelope, ReplyTo::new(via.clone())).await {
                        self.respond(response, via).await;
                    }
                }
                None => {
                    if envelope.kind.expects_response() {
                        let reply = envelope.reply_error(
                            self.context,
                            ErrorPayload::method_not_found(&envelope.action),
                        );
                        self.respond(reply, via).await;
                    } else {
                        debug!(context = %self.context, action = %envelope.action, "No local handler for event");
                    }
                }
            },
        }
    }

    /// Consume inbound envelopes in arrival order until the sink closes.
    ///
    /// While the core is not ready, envelopes that need it are held and then
    /// routed in their arrival order once it is.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
        info!(context = %self.context, "Router started");
        let mut readiness = self.readiness.clone();
        let mut held: VecDeque<Inbound> = VecDeque::new();

        loop {
            let ready = readiness.as_ref().is_none_or(|r| *r.borrow());
            if ready && !held.is_empty() {
                info!(context = %self.context, count = held.len(), "Core ready, routing held envelopes");
                while let Some(inbound) = held.pop_front() {
                    self.route(inbound).await;
                }
                continue;
            }

            tokio::select! {
                inbound = rx.recv() => {
                    let Some(inbound) = inbound else {
                        break;
                    };
                    if !ready && self.needs_core(&inbound) {
                        debug!(context = %self.context, action = %inbound.envelope.action, "Core not ready, holding envelope");
                        held.push_back(inbound);
                    } else {
                        self.route(inbound).await;
                    }
                }
                _ = readiness_changed(&mut readiness), if !ready => {}
            }
        }
        info!(context = %self.context, "Router stopped");
    }

    /// Whether an inbound envelope waits for the core: it is handled here and
    /// did not come from the popup
    fn needs_core(&self, inbound: &Inbound) -> bool {
        let from_popup = inbound
            .via
            .as_ref()
            .is_some_and(|v| v.link().as_str() == LinkName::BG_POPUP);
        !from_popup && matches!(self.decide(&inbound.envelope), Ok(Dispatch::Local | Dispatch::Approval))
    }

    fn outbound_for(&self, to: Context, via: Option<&Arc<dyn Outbound>>) -> Option<Arc<dyn Outbound>> {
        self.routes.get(&to).cloned().or_else(|| via.cloned())
    }

    async fn forward(&self, to: Context, envelope: Envelope, via: Option<Arc<dyn Outbound>>) {
        let Some(outbound) = self.outbound_for(to, via.as_ref()) else {
            warn!(context = %self.context, to = %to, action = %envelope.action, "No route");
            self.bounce(&envelope, RelayError::DeliveryFailed {
                link: to.to_string(),
                reason: "no route".to_string(),
            }, via)
            .await;
            return;
        };

        if let Err(e) = outbound.deliver(envelope.clone()).await {
            warn!(
                context = %self.context,
                link = %outbound.link(),
                action = %envelope.action,
                error = %e,
                "Forward failed"
            );
            self.bounce(&envelope, e, via).await;
        }
    }

    /// Answer an undeliverable request with an error toward its sender
    async fn bounce(&self, envelope: &Envelope, error: RelayError, via: Option<Arc<dyn Outbound>>) {
        if !envelope.kind.expects_response() || envelope.error.is_some() {
            return;
        }
        let error = match error {
            e @ RelayError::DeliveryFailed { .. } => e,
            other => RelayError::DeliveryFailed {
                link: envelope.to().map(|c| c.to_string()).unwrap_or_default(),
                reason: other.to_string(),
            },
        };
        let reply = envelope.reply_error(self.context, error.to_payload());
        let Some(to) = reply.to() else {
            return;
        };
        if to == self.context {
            debug!(context = %self.context, action = %envelope.action, "Bounce addressed to self, dropping");
            return;
        }
        if let Some(outbound) = self.outbound_for(to, via.as_ref())
            && let Err(e) = outbound.deliver(reply).await
        {
            warn!(context = %self.context, error = %e, "Bounce undeliverable");
        }
    }

    /// Send a response produced here toward its destination
    async fn respond(&self, response: Envelope, via: Option<Arc<dyn Outbound>>) {
        let Some(to) = response.to() else {
            warn!(context = %self.context, action = %response.action, "Response without metadata");
            return;
        };
        match self.outbound_for(to, via.as_ref()) {
            Some(outbound) => {
                if let Err(e) = outbound.deliver(response).await {
                    warn!(context = %self.context, to = %to, error = %e, "Response undeliverable");
                }
            }
            None => warn!(context = %self.context, to = %to, "No route for response"),
        }
    }
}

async fn readiness_changed(readiness: &mut Option<watch::Receiver<bool>>) {
    match readiness {
        Some(rx) => {
            if rx.changed().await.is_err() {
                // Sender gone: the core will never become ready
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

// ============================================================================
// Accepting side of a link
// ============================================================================

/// What an accepted link lets through
#[derive(Debug, Clone, Default)]
pub struct LinkPolicy {
    /// Contexts allowed to send on this link; empty allows any
    pub allowed_from: Vec<Context>,
    /// Origin stamped onto every envelope, replacing whatever the peer wrote
    pub origin: Option<String>,
}

impl LinkPolicy {
    pub fn from_contexts(contexts: &[Context]) -> Self {
        Self {
            allowed_from: contexts.to_vec(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    fn admits(&self, envelope: &Envelope) -> bool {
        self.allowed_from.is_empty()
            || envelope.from().is_some_and(|from| self.allowed_from.contains(&from))
    }
}

/// Link accepted from a connecting context.
///
/// Acknowledges the handshake (eagerly and on every check), answers keep-alive
/// pings, and feeds envelopes to the router with itself as the return path.
pub struct AcceptedLink {
    adapter: Arc<dyn ChannelAdapter>,
    policy: LinkPolicy,
}

impl AcceptedLink {
    pub fn serve(adapter: Arc<dyn ChannelAdapter>, inbound: mpsc::UnboundedSender<Inbound>) -> Arc<Self> {
        Self::serve_with(adapter, inbound, LinkPolicy::default())
    }

    /// Serve a link whose envelopes must satisfy `policy`
    pub fn serve_with(
        adapter: Arc<dyn ChannelAdapter>,
        inbound: mpsc::UnboundedSender<Inbound>,
        policy: LinkPolicy,
    ) -> Arc<Self> {
        let link = Arc::new(Self {
            adapter: Arc::clone(&adapter),
            policy,
        });

        // The handler keeps the link alive until the adapter drops its handlers
        let this = Arc::clone(&link);
        adapter.on_receive(Arc::new(move |frame| this.on_frame(frame, &inbound)));

        let name = adapter.link().clone();
        adapter.on_disconnect(Box::new(move || {
            debug!(link = %name, "Accepted link closed");
        }));

        if let Err(e) = adapter.send(Frame::Control(Control::ConnectionReady)) {
            debug!(link = %adapter.link(), error = %e, "Ready announcement failed");
        }
        info!(link = %adapter.link(), "Link accepted");
        link
    }

    fn on_frame(self: &Arc<Self>, frame: Frame, inbound: &mpsc::UnboundedSender<Inbound>) {
        match frame {
            Frame::Control(Control::ConnectionCheck) => {
                if let Err(e) = self.adapter.send(Frame::Control(Control::ConnectionReady)) {
                    debug!(link = %self.adapter.link(), error = %e, "Ready reply failed");
                }
            }
            Frame::Control(Control::ConnectionReady) => {}
            Frame::Control(control) => {
                if let Err(e) = keepalive::answer(self.adapter.as_ref(), &control) {
                    debug!(link = %self.adapter.link(), error = %e, "Pong reply failed");
                }
            }
            Frame::Envelope(mut envelope) => {
                if !self.policy.admits(&envelope) {
                    warn!(
                        link = %self.adapter.link(),
                        from = ?envelope.from(),
                        action = %envelope.action,
                        "Dropping envelope from a sender this link does not carry"
                    );
                    return;
                }
                if let Some(origin) = &self.policy.origin
                    && let Some(meta) = envelope.metadata.as_mut()
                {
                    meta.origin = Some(origin.clone());
                }
                let via: Arc<dyn Outbound> = Arc::clone(self) as Arc<dyn Outbound>;
                if inbound.send(Inbound::new(envelope).via(via)).is_err() {
                    debug!(link = %self.adapter.link(), "Inbound sink closed");
                }
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.adapter.is_connected()
    }

    pub fn close(&self) {
        self.adapter.disconnect();
    }
}

#[async_trait]
impl Outbound for AcceptedLink {
    fn link(&self) -> &LinkName {
        self.adapter.link()
    }

    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.adapter
            .send(Frame::Envelope(envelope))
            .map_err(|e| RelayError::DeliveryFailed {
                link: self.adapter.link().to_string(),
                reason: e.to_string(),
            })
    }
}
