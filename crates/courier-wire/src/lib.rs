//! Frame courier protocol: discovery and addressed messaging between
//! isolated execution contexts.
//!
//! A host page (the root) and the frames it embeds share no memory and can
//! only exchange opaque strings over an origin-gated transport. This crate
//! turns an anonymous frame into a named peer with a dedicated channel, and
//! turns one-way notifications into addressed, optionally answered messages.
//!
//! ## Architecture
//!
//! - **Envelope**: the JSON wire record, its codec and the event constants
//! - **PeerRegistry**: the peers this context can address
//! - **ChannelManager**: installs and replaces per-peer transport handles
//! - **Negotiation**: the root/child discovery state machine and tie-break
//! - **ListenerTable**: event callbacks and request/response correlation
//! - **Courier**: one protocol instance per context, tying it all together
//! - **MemoryNetwork**: an in-process transport for tests and simulation

pub mod channel;
pub mod clock;
pub mod courier;
pub mod dispatch;
pub mod envelope;
pub mod memory;
pub mod negotiation;
pub mod registry;
pub mod transport;

pub use channel::{Channel, ChannelKind, ChannelManager, Installed};
pub use clock::{Clock, ManualClock, SystemClock};
pub use courier::{Courier, CourierBuilder, Identity, Role};
pub use dispatch::{listener, Listener, ListenerTable, Responder};
pub use envelope::{events, Envelope, EnvelopeError, NegotiationPayload, ProtocolEvent};
pub use memory::{Delivery, MemoryNetwork, MemoryTransport, WindowId};
pub use negotiation::{resolve_offer, LinkState, OfferDecision, Phase, PortEpochs};
pub use registry::{Peer, PeerRegistry};
pub use transport::{
    FrameHost, HostedFrame, InboundMessage, MessagePort, PortError, PortHandle, PortId, Route,
    Transport,
};

pub use courier_types::{CourierConfig, CourierError, CourierResult, Rejection};
