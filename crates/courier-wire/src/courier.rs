//! Courier: one protocol instance per execution context.
//!
//! A [`Courier`] owns the peer registry, channel manager, listener table and
//! negotiation state of one context. The host environment feeds every raw
//! delivery into [`Courier::handle_message`]; application code sends and
//! listens through the methods below.
//!
//! Handling is run-to-completion: each inbound message is fully processed
//! before the next one is handed in. Callbacks run with no internal lock
//! held, so they may call back into the courier.

use crate::channel::{Channel, ChannelManager};
use crate::clock::{Clock, SystemClock};
use crate::dispatch::{Listener, ListenerTable, Responder};
use crate::envelope::{events, Envelope, ProtocolEvent, ROOT_ID, WILDCARD};
use crate::negotiation::{LinkState, Negotiation, Phase};
use crate::registry::{Peer, PeerRegistry};
use crate::transport::{FrameHost, InboundMessage, PortHandle, Transport};
use courier_types::{CourierConfig, CourierError, CourierResult, Rejection};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Position of a context in the hosting hierarchy. Decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Root,
    Child,
}

/// Identity assigned to this context by the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub tags: Vec<String>,
}

pub(crate) struct CourierInner {
    pub(crate) config: CourierConfig,
    pub(crate) role: Role,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) host: Option<Arc<dyn FrameHost>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) channels: ChannelManager,
    pub(crate) listeners: ListenerTable,
    pub(crate) negotiation: Mutex<Negotiation>,
    pub(crate) ready: watch::Sender<Option<String>>,
}

/// Handle to a protocol instance. Cheap to clone.
#[derive(Clone)]
pub struct Courier {
    pub(crate) inner: Arc<CourierInner>,
}

/// Builder for [`Courier`].
pub struct CourierBuilder {
    config: CourierConfig,
    transport: Arc<dyn Transport>,
    host: Option<Arc<dyn FrameHost>>,
    clock: Arc<dyn Clock>,
}

impl CourierBuilder {
    /// The hosting page's frame directory. Required for the root role.
    pub fn frame_host(mut self, host: Arc<dyn FrameHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Timestamp source for outgoing envelopes. Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and create the instance. The role follows
    /// from [`Transport::is_root`].
    pub fn build(self) -> CourierResult<Courier> {
        self.config.validate()?;
        let role = if self.transport.is_root() {
            Role::Root
        } else {
            Role::Child
        };
        if role == Role::Root && self.host.is_none() {
            return Err(CourierError::Config(
                "the root context needs a frame host".into(),
            ));
        }

        let (ready, _) = watch::channel(None);
        let dedup_capacity = self.config.dedup_capacity;
        Ok(Courier {
            inner: Arc::new(CourierInner {
                config: self.config,
                role,
                transport: self.transport,
                host: self.host,
                clock: self.clock,
                channels: ChannelManager::new(PeerRegistry::new()),
                listeners: ListenerTable::new(),
                negotiation: Mutex::new(Negotiation::new(dedup_capacity)),
                ready,
            }),
        })
    }
}

impl Courier {
    /// Start building an instance for the context behind `transport`.
    pub fn builder(config: CourierConfig, transport: Arc<dyn Transport>) -> CourierBuilder {
        CourierBuilder {
            config,
            transport,
            host: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Begin discovery. The root registers itself and is ready at once; a
    /// child announces `LOADED` to the root and waits for `SETUP`. Calling
    /// this more than once has no effect.
    pub fn start(&self) {
        let inner = &self.inner;
        let mut state = inner.negotiation.lock().unwrap_or_else(|e| e.into_inner());
        if state.phase != Phase::Idle {
            return;
        }

        match inner.role {
            Role::Root => {
                let origin = inner.transport.origin();
                let _ = inner
                    .channels
                    .registry()
                    .add(Peer::new(ROOT_ID, Vec::new(), origin, Channel::Local));
                state.identity = Some(Identity {
                    id: ROOT_ID.to_string(),
                    tags: Vec::new(),
                });
                state.phase = Phase::AwaitingLoadSignals;
                info!("Courier started as root");
                inner.ready.send_replace(Some(ROOT_ID.to_string()));
            }
            Role::Child => {
                state.phase = Phase::AwaitingSetup;
                match inner.transport.top() {
                    Some(top) => {
                        let loaded = self.build_envelope(ROOT_ID, WILDCARD, events::LOADED, Value::Null);
                        self.post_raw(&top, &loaded, "*");
                        info!("Courier started as child, LOADED sent");
                    }
                    None => warn!("Child context has no root to announce to"),
                }
            }
        }
    }

    /// Feed one raw delivery from the transport.
    pub fn handle_message(&self, msg: InboundMessage) {
        let envelope = match Envelope::parse(&msg.data, &self.inner.config.scope) {
            Ok(envelope) => envelope,
            Err(e) => {
                let rejection = Rejection::from(e);
                trace!(%rejection, origin = %msg.origin, "Ignoring inbound message");
                return;
            }
        };

        let event = envelope.protocol_event();
        let result = match event {
            ProtocolEvent::Application => self.dispatch(msg, envelope),
            _ => self.negotiate(event, msg, envelope),
        };
        if let Err(rejection) = result {
            debug!(%rejection, ?event, "Dropped inbound message");
        }
    }

    /// Send `payload` under `event` to one peer. `on_reply` runs when the
    /// peer responds.
    pub fn send(
        &self,
        peer_id: &str,
        event: &str,
        payload: Value,
        on_reply: Option<Listener>,
    ) -> CourierResult<()> {
        let peer = self
            .peer(peer_id)
            .ok_or_else(|| CourierError::PeerNotFound(peer_id.to_string()))?;
        self.post_to_peer(&peer, event, payload, on_reply);
        Ok(())
    }

    /// Send to every peer carrying `tag`. Returns how many peers were addressed.
    pub fn send_to_tag(
        &self,
        tag: &str,
        event: &str,
        payload: Value,
        on_reply: Option<Listener>,
    ) -> usize {
        let peers = self.inner.channels.registry().with_tag(tag);
        for peer in &peers {
            self.post_to_peer(peer, event, payload.clone(), on_reply.clone());
        }
        peers.len()
    }

    /// Send to every peer except this context. Returns how many peers were
    /// addressed.
    pub fn broadcast(&self, event: &str, payload: Value, on_reply: Option<Listener>) -> usize {
        let own = self.id();
        let peers: Vec<Peer> = self
            .peers()
            .into_iter()
            .filter(|p| Some(p.id.as_str()) != own.as_deref())
            .collect();
        for peer in &peers {
            self.post_to_peer(peer, event, payload.clone(), on_reply.clone());
        }
        peers.len()
    }

    /// Register a callback for `event`.
    pub fn listen<F>(&self, event: &str, callback: F)
    where
        F: Fn(&Value, &Responder) + Send + Sync + 'static,
    {
        self.inner.listeners.add(event, Arc::new(callback));
    }

    /// Identifier of this context, once assigned.
    pub fn id(&self) -> Option<String> {
        let state = self.inner.negotiation.lock().unwrap_or_else(|e| e.into_inner());
        state.identity.as_ref().map(|i| i.id.clone())
    }

    /// Tags assigned to this context, empty until an identity is adopted.
    pub fn tags(&self) -> Vec<String> {
        let state = self.inner.negotiation.lock().unwrap_or_else(|e| e.into_inner());
        state
            .identity
            .as_ref()
            .map(|i| i.tags.clone())
            .unwrap_or_default()
    }

    /// All known peers, ordered by identifier.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.channels.registry().all()
    }

    /// Look up one peer by identifier.
    pub fn peer(&self, id: &str) -> Option<Peer> {
        self.inner.channels.registry().get(id)
    }

    /// Root or child, fixed at construction.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Current negotiation phase of this context.
    pub fn phase(&self) -> Phase {
        let state = self.inner.negotiation.lock().unwrap_or_else(|e| e.into_inner());
        state.phase
    }

    /// The configuration this instance was built with.
    pub fn config(&self) -> &CourierConfig {
        &self.inner.config
    }

    /// Epoch of the winning channel offer for `peer_id`.
    pub fn link(&self, peer_id: &str) -> Option<LinkState> {
        let state = self.inner.negotiation.lock().unwrap_or_else(|e| e.into_inner());
        state.epochs.get(peer_id)
    }

    /// Fires with this context's identifier once negotiation completes.
    pub fn ready(&self) -> watch::Receiver<Option<String>> {
        self.inner.ready.subscribe()
    }

    /// Wait until this context has an identity and return it.
    pub async fn wait_ready(&self) -> String {
        let mut rx = self.ready();
        let id = match rx.wait_for(Option::is_some).await {
            Ok(id) => id.clone().unwrap_or_default(),
            // The sender lives as long as `self`.
            Err(_) => String::new(),
        };
        id
    }

    pub(crate) fn build_envelope(&self, to: &str, from: &str, event: &str, payload: Value) -> Envelope {
        Envelope::new(
            to,
            from,
            event,
            payload,
            self.inner.clock.now_millis(),
            self.inner.config.scope.as_str(),
        )
    }

    /// Post an envelope over a shared handle, logging failures.
    pub(crate) fn post_raw(&self, port: &PortHandle, envelope: &Envelope, target_origin: &str) {
        let data = match envelope.encode() {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, event = %envelope.event, "Failed to encode envelope");
                return;
            }
        };
        if let Err(e) = port.post_message(&data, target_origin, Vec::new()) {
            warn!(error = %e, event = %envelope.event, "Failed to post envelope");
        }
    }

    fn post_to_peer(&self, peer: &Peer, event: &str, payload: Value, on_reply: Option<Listener>) {
        let from = self.id().unwrap_or_else(|| WILDCARD.to_string());
        let envelope = self.build_envelope(&peer.id, &from, event, payload);
        if let Some(callback) = on_reply {
            self.inner
                .listeners
                .add_reply(&envelope.response_event(), &peer.id, callback);
        }

        let data = match envelope.encode() {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, peer = %peer.id, "Failed to encode envelope");
                return;
            }
        };
        if let Err(e) = peer.channel.post(&data, &peer.origin) {
            warn!(error = %e, peer = %peer.id, event = %event, "Failed to send");
        }
    }
}

impl std::fmt::Debug for Courier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Courier")
            .field("role", &self.inner.role)
            .field("id", &self.id())
            .field("peers", &self.inner.channels.registry().len())
            .finish()
    }
}
