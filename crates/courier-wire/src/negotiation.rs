//! Negotiation: turns an anonymous frame into a named peer.
//!
//! Root role: answers every `LOADED` from a hosted frame with a `SETUP`
//! carrying the frame's identity and, when available, one end of a
//! dedicated channel.
//!
//! Child role: announces `LOADED` to the root, adopts the identity from
//! `SETUP`, announces `READY` to its siblings, answers each sibling's
//! `READY` with a `HANDSHAKE` channel offer, and accepts the sibling's
//! `HANDSHAKE` offers. `HANDSHAKE` closes the exchange; nothing answers it.
//!
//! Both ends of a sibling pair may offer a channel at the same time. The
//! tie-break in [`resolve_offer`] makes both ends keep the same one: the
//! older offer wins, and on equal timestamps the offer of the
//! lexicographically smaller identifier wins.

use crate::channel::Channel;
use crate::courier::{Courier, Identity, Role};
use crate::envelope::{events, Envelope, NegotiationPayload, ProtocolEvent, ROOT_ID, WILDCARD};
use crate::registry::normalize_tags;
use crate::transport::{InboundMessage, PortHandle, Route};
use courier_types::Rejection;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

/// Outcome of comparing a channel offer against the recorded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    Accept,
    Stale,
}

/// Decide whether an offer stamped `offered` from `remote_id` replaces the
/// offer recorded for that peer.
pub fn resolve_offer(
    recorded: Option<i64>,
    offered: i64,
    local_id: &str,
    remote_id: &str,
) -> OfferDecision {
    match recorded {
        None => OfferDecision::Accept,
        Some(recorded) if offered < recorded => OfferDecision::Accept,
        Some(recorded) if offered == recorded && local_id > remote_id => OfferDecision::Accept,
        Some(_) => OfferDecision::Stale,
    }
}

/// Channel state of one peer relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// This context created the channel and sent it to the peer.
    Offered { epoch: i64 },
    /// This context adopted the peer's channel.
    Accepted { epoch: i64 },
}

impl LinkState {
    /// Timestamp of the offer this link was built from.
    pub fn epoch(&self) -> i64 {
        match self {
            LinkState::Offered { epoch } | LinkState::Accepted { epoch } => *epoch,
        }
    }
}

/// Timestamp of the most recent winning offer per peer.
#[derive(Debug, Clone, Default)]
pub struct PortEpochs {
    links: HashMap<String, LinkState>,
}

impl PortEpochs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link state recorded for `peer`.
    pub fn get(&self, peer: &str) -> Option<LinkState> {
        self.links.get(peer).copied()
    }

    pub fn epoch(&self, peer: &str) -> Option<i64> {
        self.get(peer).map(|link| link.epoch())
    }

    /// Reject an offer that loses the tie-break.
    pub fn check(&self, peer: &str, offered: i64, local_id: &str) -> Result<(), Rejection> {
        let recorded = self.epoch(peer);
        match resolve_offer(recorded, offered, local_id, peer) {
            OfferDecision::Accept => Ok(()),
            OfferDecision::Stale => Err(Rejection::StaleOffer {
                peer: peer.to_string(),
                offered,
                recorded: recorded.unwrap_or_default(),
            }),
        }
    }

    /// Record an offer this context sent.
    pub fn record_offer(&mut self, peer: &str, epoch: i64) {
        self.links
            .insert(peer.to_string(), LinkState::Offered { epoch });
    }

    /// Adopt the peer's offer if it wins the tie-break.
    pub fn accept(&mut self, peer: &str, offered: i64, local_id: &str) -> Result<(), Rejection> {
        self.check(peer, offered, local_id)?;
        self.links
            .insert(peer.to_string(), LinkState::Accepted { epoch: offered });
        Ok(())
    }
}

/// Bounded memory of processed deliveries.
#[derive(Debug)]
pub(crate) struct SeenDeliveries {
    capacity: usize,
    order: VecDeque<String>,
    keys: HashSet<String>,
}

impl SeenDeliveries {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            keys: HashSet::new(),
        }
    }

    /// Returns `false` if `key` was already seen.
    pub(crate) fn insert(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

/// Where this context is in its own discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Root: answering load signals for as long as the context lives.
    AwaitingLoadSignals,
    /// Child: `LOADED` sent, no identity yet.
    AwaitingSetup,
    /// Child: identity adopted.
    Established,
}

pub(crate) struct Negotiation {
    pub(crate) phase: Phase,
    pub(crate) identity: Option<Identity>,
    pub(crate) epochs: PortEpochs,
    delayed_ready: VecDeque<(InboundMessage, Envelope)>,
    delayed_capacity: usize,
    seen: SeenDeliveries,
}

impl Negotiation {
    pub(crate) fn new(dedup_capacity: usize) -> Self {
        Self {
            phase: Phase::Idle,
            identity: None,
            epochs: PortEpochs::new(),
            delayed_ready: VecDeque::new(),
            delayed_capacity: dedup_capacity.max(1),
            seen: SeenDeliveries::new(dedup_capacity),
        }
    }

    /// Hold a sibling `READY` until this context has an identity, keeping
    /// only the most recent ones.
    fn delay_ready(&mut self, msg: InboundMessage, envelope: Envelope) {
        if self.delayed_ready.len() >= self.delayed_capacity {
            if let Some((dropped, oldest)) = self.delayed_ready.pop_front() {
                warn!(from = %oldest.from, "Delayed READY queue full, dropping oldest");
                discard_ports(&dropped);
            }
        }
        self.delayed_ready.push_back((msg, envelope));
    }
}

fn delivery_key(msg: &InboundMessage, envelope: &Envelope) -> String {
    let via = match (&msg.source, msg.route) {
        (Some(source), _) => source.port_id().to_string(),
        (None, Route::Port(id)) => id.to_string(),
        (None, Route::Window) => "window".to_string(),
    };
    format!("{via}|{}", envelope.message_id)
}

/// The channel a peer's message was delivered with: the transferred handle
/// if any, otherwise the sender's shared handle.
fn received_channel(msg: &InboundMessage) -> Option<Channel> {
    match (msg.ports.first(), &msg.source) {
        (Some(port), _) => Some(Channel::Dedicated(port.clone())),
        (None, Some(source)) => Some(Channel::Shared(source.clone())),
        (None, None) => None,
    }
}

fn discard_ports(msg: &InboundMessage) {
    for port in &msg.ports {
        port.close();
    }
}

fn generate_frame_id(prefix: &str) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut n: u64 = rand::thread_rng().gen();
    let mut digits = Vec::new();
    loop {
        digits.push(DIGITS[(n % 36) as usize]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    digits.reverse();
    format!("{prefix}{}", String::from_utf8_lossy(&digits))
}

impl Courier {
    /// Advance the state machine with a protocol envelope.
    pub(crate) fn negotiate(
        &self,
        event: ProtocolEvent,
        msg: InboundMessage,
        envelope: Envelope,
    ) -> Result<(), Rejection> {
        let mut state = self
            .inner
            .negotiation
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !state.seen.insert(delivery_key(&msg, &envelope)) {
            return Err(Rejection::DuplicateDelivery(envelope.message_id));
        }

        match (self.inner.role, event) {
            (Role::Root, ProtocolEvent::Loaded) => self.on_loaded(&mut state, msg, envelope),
            (Role::Child, ProtocolEvent::Setup) => self.on_setup(&mut state, msg, envelope),
            (Role::Child, ProtocolEvent::Ready) => {
                if state.identity.is_none() {
                    debug!(from = %envelope.from, "READY before identity, delaying");
                    state.delay_ready(msg, envelope);
                    return Ok(());
                }
                self.on_ready(&mut state, msg, envelope)
            }
            (Role::Child, ProtocolEvent::Handshake) => {
                self.on_handshake(&mut state, msg, envelope)
            }
            (role, event) => {
                debug!(?role, ?event, "Protocol event not handled in this role");
                Ok(())
            }
        }
    }

    /// Root: a hosted frame has loaded and asks for an identity.
    fn on_loaded(
        &self,
        state: &mut Negotiation,
        msg: InboundMessage,
        envelope: Envelope,
    ) -> Result<(), Rejection> {
        if envelope.from != WILDCARD || msg.route != Route::Window {
            return Err(Rejection::InvalidNegotiationPayload(envelope.event));
        }
        let source = msg.source.clone().ok_or(Rejection::UnknownSource)?;
        let host = self.inner.host.as_ref().ok_or(Rejection::UnknownSource)?;
        let hosted = host
            .frame_for_source(source.port_id())
            .ok_or(Rejection::UnknownSource)?;

        let frame_id = match hosted.id {
            Some(id) if !id.is_empty() => id,
            _ => {
                let id = generate_frame_id(&self.inner.config.frame_id_prefix);
                host.assign_id(source.port_id(), &id);
                id
            }
        };
        let tags = normalize_tags(hosted.tags);

        self.inner.channels.check(&frame_id, &msg.origin)?;
        state.epochs.check(&frame_id, envelope.timestamp, ROOT_ID)?;

        let setup = self.build_envelope(
            &frame_id,
            ROOT_ID,
            events::SETUP,
            NegotiationPayload::new(&frame_id, tags.clone()).to_value(),
        );
        let channel = self.offer(&source, &setup, &msg.origin)?;
        self.inner
            .channels
            .install(&frame_id, tags, &msg.origin, channel)?;
        state.epochs.record_offer(&frame_id, setup.timestamp);

        info!(frame = %frame_id, origin = %msg.origin, "Sent SETUP");
        Ok(())
    }

    /// Child: the root assigns this context its identity.
    fn on_setup(
        &self,
        state: &mut Negotiation,
        msg: InboundMessage,
        envelope: Envelope,
    ) -> Result<(), Rejection> {
        let from_top = match (&msg.source, self.inner.transport.top()) {
            (Some(source), Some(top)) => source.port_id() == top.port_id(),
            _ => false,
        };
        if !from_top || msg.route != Route::Window || envelope.from != ROOT_ID {
            return Err(Rejection::OriginMismatch {
                peer: ROOT_ID.to_string(),
            });
        }
        let payload = envelope
            .negotiation_payload()
            .ok_or_else(|| Rejection::InvalidNegotiationPayload(envelope.event.clone()))?;
        let channel = received_channel(&msg)
            .ok_or_else(|| Rejection::InvalidNegotiationPayload(envelope.event.clone()))?;

        if let Some(identity) = &state.identity {
            if identity.id != payload.peer_id {
                warn!(
                    current = %identity.id,
                    offered = %payload.peer_id,
                    "SETUP with a different identity ignored"
                );
                discard_ports(&msg);
                return Ok(());
            }
            self.inner
                .channels
                .install(ROOT_ID, Vec::new(), &msg.origin, channel)?;
            return Ok(());
        }

        state
            .epochs
            .accept(ROOT_ID, envelope.timestamp, &payload.peer_id)?;
        self.inner
            .channels
            .install(ROOT_ID, Vec::new(), &msg.origin, channel)?;

        let identity = Identity {
            id: payload.peer_id,
            tags: normalize_tags(payload.peer_tags),
        };
        state.identity = Some(identity.clone());
        state.phase = Phase::Established;
        info!(frame = %identity.id, tags = ?identity.tags, "Identity adopted");

        for (delayed_msg, delayed) in std::mem::take(&mut state.delayed_ready) {
            if let Err(rejection) = self.on_ready(state, delayed_msg, delayed) {
                debug!(%rejection, "Dropped delayed READY");
            }
        }

        let announce = NegotiationPayload::new(&identity.id, identity.tags.clone()).to_value();
        for sibling in self.inner.transport.siblings() {
            let ready = self.build_envelope(WILDCARD, &identity.id, events::READY, announce.clone());
            self.post_raw(&sibling, &ready, "*");
        }

        self.inner.ready.send_replace(Some(identity.id));
        Ok(())
    }

    /// Child: a sibling with an identity announced itself; offer it a channel.
    fn on_ready(
        &self,
        state: &mut Negotiation,
        msg: InboundMessage,
        envelope: Envelope,
    ) -> Result<(), Rejection> {
        let own = state
            .identity
            .clone()
            .ok_or_else(|| Rejection::MisaddressedEnvelope {
                to: envelope.to.clone(),
            })?;
        let payload = envelope
            .negotiation_payload()
            .filter(|p| p.peer_id == envelope.from && envelope.to == WILDCARD)
            .ok_or_else(|| Rejection::InvalidNegotiationPayload(envelope.event.clone()))?;
        if payload.peer_id == own.id || payload.peer_id == ROOT_ID {
            return Err(Rejection::InvalidNegotiationPayload(envelope.event));
        }
        if self.inner.channels.registry().contains(&payload.peer_id) {
            return Err(Rejection::DuplicatePeerRegistration(payload.peer_id));
        }
        let source = msg.source.clone().ok_or(Rejection::UnknownSource)?;

        self.inner.channels.check(&payload.peer_id, &msg.origin)?;
        state
            .epochs
            .check(&payload.peer_id, envelope.timestamp, &own.id)?;

        let handshake = self.build_envelope(
            &payload.peer_id,
            &own.id,
            events::HANDSHAKE,
            NegotiationPayload::new(&own.id, own.tags.clone()).to_value(),
        );
        let channel = self.offer(&source, &handshake, &msg.origin)?;
        self.inner
            .channels
            .install(&payload.peer_id, payload.peer_tags, &msg.origin, channel)?;
        state
            .epochs
            .record_offer(&payload.peer_id, handshake.timestamp);

        info!(peer = %payload.peer_id, "Sent HANDSHAKE");
        Ok(())
    }

    /// Child: a sibling answered our `READY` with a channel.
    fn on_handshake(
        &self,
        state: &mut Negotiation,
        msg: InboundMessage,
        envelope: Envelope,
    ) -> Result<(), Rejection> {
        let own = match &state.identity {
            Some(identity) if identity.id == envelope.to => identity.clone(),
            _ => {
                discard_ports(&msg);
                return Err(Rejection::MisaddressedEnvelope { to: envelope.to });
            }
        };
        let Some(payload) = envelope
            .negotiation_payload()
            .filter(|p| p.peer_id == envelope.from && p.peer_id != ROOT_ID)
        else {
            discard_ports(&msg);
            return Err(Rejection::InvalidNegotiationPayload(envelope.event));
        };
        let channel = received_channel(&msg)
            .ok_or_else(|| Rejection::InvalidNegotiationPayload(envelope.event.clone()))?;

        let accepted = self
            .inner
            .channels
            .check(&payload.peer_id, &msg.origin)
            .and_then(|()| {
                state
                    .epochs
                    .accept(&payload.peer_id, envelope.timestamp, &own.id)
            });
        if let Err(rejection) = accepted {
            discard_ports(&msg);
            return Err(rejection);
        }

        self.inner
            .channels
            .install(&payload.peer_id, payload.peer_tags, &msg.origin, channel)?;
        info!(peer = %payload.peer_id, "Accepted HANDSHAKE");
        Ok(())
    }

    /// Post a negotiation envelope to `source`, transferring the far end of a
    /// new dedicated channel when possible. Returns the channel this context
    /// keeps for the peer.
    fn offer(
        &self,
        source: &PortHandle,
        envelope: &Envelope,
        target_origin: &str,
    ) -> Result<Channel, Rejection> {
        let data = envelope.encode().map_err(|_| Rejection::MalformedEnvelope)?;

        if self.inner.config.use_channels {
            if let Some((local, remote)) = self.inner.transport.create_channel() {
                match source.post_message(&data, target_origin, vec![remote.clone()]) {
                    Ok(()) => return Ok(Channel::Dedicated(local)),
                    Err(e) => {
                        debug!(error = %e, "Transfer failed, falling back to shared transport");
                        local.close();
                        remote.close();
                    }
                }
            }
        }

        if let Err(e) = source.post_message(&data, target_origin, Vec::new()) {
            warn!(error = %e, event = %envelope.event, "Failed to post negotiation message");
        }
        Ok(Channel::Shared(source.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_offer_accepted() {
        assert_eq!(
            resolve_offer(None, 500, "frame-a", "frame-b"),
            OfferDecision::Accept
        );
    }

    #[test]
    fn test_older_offer_wins() {
        assert_eq!(
            resolve_offer(Some(200), 100, "frame-a", "frame-b"),
            OfferDecision::Accept
        );
        assert_eq!(
            resolve_offer(Some(100), 200, "frame-a", "frame-b"),
            OfferDecision::Stale
        );
    }

    #[test]
    fn test_tie_smaller_identifier_wins_on_both_sides() {
        // frame-a holds its own offer and receives frame-b's: frame-a's stays.
        assert_eq!(
            resolve_offer(Some(100), 100, "frame-a", "frame-b"),
            OfferDecision::Stale
        );
        // frame-b holds its own offer and receives frame-a's: it switches.
        assert_eq!(
            resolve_offer(Some(100), 100, "frame-b", "frame-a"),
            OfferDecision::Accept
        );
    }

    #[test]
    fn test_root_loses_ties() {
        assert_eq!(
            resolve_offer(Some(100), 100, ROOT_ID, "frame-1"),
            OfferDecision::Stale
        );
    }

    #[test]
    fn test_port_epochs_transitions() {
        let mut epochs = PortEpochs::new();
        assert!(epochs.get("frame-b").is_none());

        epochs.record_offer("frame-b", 100);
        assert_eq!(epochs.get("frame-b"), Some(LinkState::Offered { epoch: 100 }));

        let stale = epochs.accept("frame-b", 200, "frame-a");
        assert_eq!(
            stale,
            Err(Rejection::StaleOffer {
                peer: "frame-b".into(),
                offered: 200,
                recorded: 100,
            })
        );
        assert_eq!(epochs.epoch("frame-b"), Some(100));

        epochs.accept("frame-b", 50, "frame-a").unwrap();
        assert_eq!(epochs.get("frame-b"), Some(LinkState::Accepted { epoch: 50 }));
    }

    #[test]
    fn test_seen_deliveries_bounded() {
        let mut seen = SeenDeliveries::new(2);
        assert!(seen.insert("a".into()));
        assert!(!seen.insert("a".into()));
        assert!(seen.insert("b".into()));
        assert!(seen.insert("c".into()));
        // "a" was evicted
        assert!(seen.insert("a".into()));
        assert!(!seen.insert("c".into()));
    }

    fn ready_from(peer: &str) -> (InboundMessage, Envelope) {
        let envelope = Envelope::new(
            WILDCARD,
            peer,
            events::READY,
            NegotiationPayload::new(peer, Vec::new()).to_value(),
            100,
            "frame-courier",
        );
        let msg = InboundMessage {
            data: envelope.encode().unwrap(),
            origin: "https://a.example".into(),
            source: None,
            ports: Vec::new(),
            route: Route::Window,
        };
        (msg, envelope)
    }

    #[test]
    fn test_delayed_ready_keeps_most_recent() {
        let mut state = Negotiation::new(2);
        for peer in ["frame-a", "frame-b", "frame-c"] {
            let (msg, envelope) = ready_from(peer);
            state.delay_ready(msg, envelope);
        }

        let held: Vec<_> = state
            .delayed_ready
            .iter()
            .map(|(_, envelope)| envelope.from.as_str())
            .collect();
        assert_eq!(held, vec!["frame-b", "frame-c"]);
    }

    #[test]
    fn test_generated_frame_id() {
        let id = generate_frame_id("frame-");
        assert!(id.starts_with("frame-"));
        let suffix = &id["frame-".len()..];
        assert!(!suffix.is_empty());
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(generate_frame_id("frame-"), generate_frame_id("frame-"));
    }
}
