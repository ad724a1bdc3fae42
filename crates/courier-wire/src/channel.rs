//! Channel manager: owns the transport handle of every peer.
//!
//! A peer is reached either over a dedicated handle (one end of an
//! entangled pair) or over the shared window transport when dedicated
//! handles are unavailable. Past installation the manager treats both the
//! same way. At most one channel is active per peer, and an installed
//! channel can only be replaced by traffic from the same origin.

use crate::registry::{Peer, PeerRegistry};
use crate::transport::{PortError, PortHandle, PortId, Route};
use courier_types::Rejection;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// The transport handle used to reach one peer.
#[derive(Debug, Clone)]
pub enum Channel {
    /// A dedicated handle; traffic is not origin-gated.
    Dedicated(PortHandle),
    /// The peer's shared window transport, addressed by origin.
    Shared(PortHandle),
    /// This context itself.
    Local,
}

/// Which variant a [`Channel`] is, without its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Dedicated,
    Shared,
    Local,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelKind::Dedicated => "dedicated",
            ChannelKind::Shared => "shared",
            ChannelKind::Local => "local",
        };
        f.write_str(name)
    }
}

impl Channel {
    /// Variant of this channel.
    pub fn kind(&self) -> ChannelKind {
        match self {
            Channel::Dedicated(_) => ChannelKind::Dedicated,
            Channel::Shared(_) => ChannelKind::Shared,
            Channel::Local => ChannelKind::Local,
        }
    }

    /// Identifier of the underlying handle; `None` for [`Channel::Local`].
    pub fn port_id(&self) -> Option<PortId> {
        match self {
            Channel::Dedicated(port) | Channel::Shared(port) => Some(port.port_id()),
            Channel::Local => None,
        }
    }

    /// Post serialized data to the peer behind this channel.
    pub fn post(&self, data: &str, peer_origin: &str) -> Result<(), PortError> {
        match self {
            Channel::Dedicated(port) => port.post_message(data, "*", Vec::new()),
            Channel::Shared(port) => port.post_message(data, peer_origin, Vec::new()),
            Channel::Local => Ok(()),
        }
    }

    /// Whether a message that arrived over `route` from `origin` came
    /// through this channel.
    ///
    /// Several frames can share one origin, so shared-transport traffic must
    /// also come from the window the channel was installed for.
    pub fn accepts(
        &self,
        route: Route,
        source: Option<&PortHandle>,
        origin: &str,
        peer_origin: &str,
    ) -> bool {
        match (self, route) {
            (Channel::Dedicated(port), Route::Port(id)) => port.port_id() == id,
            (Channel::Shared(port), Route::Window) => {
                origin == peer_origin
                    && source.is_some_and(|s| s.port_id() == port.port_id())
            }
            _ => false,
        }
    }

    fn same_handle(&self, other: &Channel) -> bool {
        self.kind() == other.kind() && self.port_id() == other.port_id()
    }
}

/// Outcome of a successful install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installed {
    /// The peer was registered with this channel.
    New,
    /// The peer's previous channel was released and replaced.
    Replaced,
    /// The peer already used this very handle.
    Unchanged,
}

/// Installs, replaces and binds per-peer channels.
#[derive(Debug, Clone)]
pub struct ChannelManager {
    registry: PeerRegistry,
    bound: Arc<Mutex<HashSet<PortId>>>,
}

impl ChannelManager {
    /// Create a manager that installs channels into `registry`.
    pub fn new(registry: PeerRegistry) -> Self {
        Self {
            registry,
            bound: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Check whether a channel from `origin` may be installed for `peer_id`.
    pub fn check(&self, peer_id: &str, origin: &str) -> Result<(), Rejection> {
        match self.registry.get(peer_id) {
            Some(existing) if existing.origin != origin => {
                Err(Rejection::ChannelReplacementRejected {
                    peer: peer_id.to_string(),
                    installed: existing.origin,
                    offered: origin.to_string(),
                })
            }
            Some(_) => Ok(()),
            None if origin.is_empty() => Err(Rejection::OriginMismatch {
                peer: peer_id.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Install `channel` as the channel of `peer_id`, registering the peer on
    /// first contact. Tags of an existing peer are left untouched.
    pub fn install(
        &self,
        peer_id: &str,
        tags: Vec<String>,
        origin: &str,
        channel: Channel,
    ) -> Result<Installed, Rejection> {
        self.check(peer_id, origin)?;

        let Some(existing) = self.registry.get(peer_id) else {
            self.registry
                .add(Peer::new(peer_id, tags, origin, channel.clone()))?;
            self.bind(&channel);
            info!(peer = %peer_id, kind = %channel.kind(), "Channel installed");
            return Ok(Installed::New);
        };

        if existing.channel.same_handle(&channel) {
            self.bind(&channel);
            return Ok(Installed::Unchanged);
        }

        if let Some(previous) = self.registry.set_channel(peer_id, channel.clone()) {
            self.release(&previous);
        }
        self.bind(&channel);
        info!(peer = %peer_id, kind = %channel.kind(), "Channel replaced");
        Ok(Installed::Replaced)
    }

    /// Start a dedicated handle the first time it is seen.
    fn bind(&self, channel: &Channel) {
        let Channel::Dedicated(port) = channel else {
            return;
        };
        let mut bound = self.bound.lock().unwrap_or_else(|e| e.into_inner());
        if bound.insert(port.port_id()) {
            port.start();
        }
    }

    fn release(&self, channel: &Channel) {
        if let Channel::Dedicated(port) = channel {
            debug!(port = %port.port_id(), "Closing replaced channel");
            self.bound
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&port.port_id());
            port.close();
        }
    }
}
