//! Peer registry: the remote contexts this context can address.
//!
//! Identifiers are assigned once by the root and never change, so the
//! registry is add-only: registering an identifier twice is a no-op and the
//! channel of an existing peer is replaced through the
//! [`ChannelManager`](crate::channel::ChannelManager) instead.

use crate::channel::Channel;
use chrono::{DateTime, Utc};
use courier_types::Rejection;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// A remote context known by identifier.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Identifier assigned by the root. `""` is the root itself.
    pub id: String,
    /// Ordered, duplicate-free tags.
    pub tags: Vec<String>,
    /// Origin that traffic from this peer must carry.
    pub origin: String,
    /// The only transport valid for this peer until replaced.
    pub channel: Channel,
    /// When the peer was first registered.
    pub established_at: DateTime<Utc>,
}

impl Peer {
    /// Create a peer record stamped with the current time. Tags are
    /// normalized.
    pub fn new(
        id: impl Into<String>,
        tags: Vec<String>,
        origin: impl Into<String>,
        channel: Channel,
    ) -> Self {
        Self {
            id: id.into(),
            tags: normalize_tags(tags),
            origin: origin.into(),
            channel,
            established_at: Utc::now(),
        }
    }

    /// Whether the peer carries `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Store of all known peers, one per context.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<BTreeMap<String, Peer>>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. A second registration under the same identifier
    /// leaves the registry unchanged.
    pub fn add(&self, peer: Peer) -> Result<(), Rejection> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if peers.contains_key(&peer.id) {
            warn!(peer = %peer.id, "Peer already registered, ignoring");
            return Err(Rejection::DuplicatePeerRegistration(peer.id));
        }
        peers.insert(peer.id.clone(), peer);
        Ok(())
    }

    /// Look up a peer by identifier.
    pub fn get(&self, id: &str) -> Option<Peer> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(id).cloned()
    }

    /// Whether a peer is registered under `id`.
    pub fn contains(&self, id: &str) -> bool {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.contains_key(id)
    }

    /// Snapshot of every peer, ordered by identifier.
    pub fn all(&self) -> Vec<Peer> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    /// Peers carrying `tag`.
    pub fn with_tag(&self, tag: &str) -> Vec<Peer> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().filter(|p| p.has_tag(tag)).cloned().collect()
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }

    /// Whether no peer is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swap the channel of an existing peer, returning the previous one.
    pub(crate) fn set_channel(&self, id: &str, channel: Channel) -> Option<Channel> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers
            .get_mut(id)
            .map(|peer| std::mem::replace(&mut peer.channel, channel))
    }
}

/// Trim tags, drop empties and keep the first occurrence of each.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.as_ref().trim();
        if !tag.is_empty() && !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

/// Split a whitespace-separated tag list.
pub fn parse_tags(raw: &str) -> Vec<String> {
    normalize_tags(raw.split_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_peer(id: &str, tags: &[&str]) -> Peer {
        Peer::new(
            id,
            tags.iter().map(|s| s.to_string()).collect(),
            "https://child.example",
            Channel::Local,
        )
    }

    #[test]
    fn test_add_and_get_peer() {
        let registry = PeerRegistry::new();
        registry.add(make_peer("frame-1", &["a"])).unwrap();

        let peer = registry.get("frame-1").unwrap();
        assert_eq!(peer.id, "frame-1");
        assert_eq!(peer.tags, vec!["a"]);
        assert_eq!(peer.origin, "https://child.example");
        assert!(registry.get("frame-2").is_none());
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let registry = PeerRegistry::new();
        registry.add(make_peer("frame-1", &["a"])).unwrap();

        let mut second = make_peer("frame-1", &["z"]);
        second.origin = "https://other.example".to_string();
        assert_eq!(
            registry.add(second),
            Err(Rejection::DuplicatePeerRegistration("frame-1".into()))
        );

        assert_eq!(registry.len(), 1);
        let peer = registry.get("frame-1").unwrap();
        assert_eq!(peer.tags, vec!["a"]);
        assert_eq!(peer.origin, "https://child.example");
    }

    #[test]
    fn test_all_is_a_snapshot() {
        let registry = PeerRegistry::new();
        registry.add(make_peer("frame-b", &[])).unwrap();
        registry.add(make_peer("", &[])).unwrap();
        registry.add(make_peer("frame-a", &[])).unwrap();

        let snapshot = registry.all();
        registry.add(make_peer("frame-c", &[])).unwrap();

        let ids: Vec<_> = snapshot.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["", "frame-a", "frame-b"]);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_with_tag() {
        let registry = PeerRegistry::new();
        registry.add(make_peer("frame-1", &["chart", "left"])).unwrap();
        registry.add(make_peer("frame-2", &["chart"])).unwrap();
        registry.add(make_peer("frame-3", &["table"])).unwrap();

        let charts: Vec<_> = registry
            .with_tag("chart")
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(charts, vec!["frame-1", "frame-2"]);
        assert!(registry.with_tag("missing").is_empty());
    }

    #[test]
    fn test_normalize_tags() {
        assert_eq!(parse_tags("  a b\tb  c "), vec!["a", "b", "c"]);
        assert!(parse_tags("").is_empty());
        assert_eq!(normalize_tags(["x", "", " y ", "x"]), vec!["x", "y"]);
    }
}
