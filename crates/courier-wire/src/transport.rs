//! The message transport contract supplied by the host environment.
//!
//! The transport only delivers opaque strings. Two kinds of handle exist:
//! the shared per-window transport, which every context can post to, and
//! dedicated handles created as an entangled pair, one end of which can be
//! transferred along with a message.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Identity of a transport handle. Two handles with the same id address the
/// same endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub Uuid);

impl PortId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PortId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by a handle when posting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("port is closed")]
    Closed,
    #[error("handle could not be transferred: {0}")]
    DataClone(String),
}

/// A handle messages can be posted to.
pub trait MessagePort: Send + Sync {
    fn port_id(&self) -> PortId;

    /// Post `data`. `target_origin` is honoured by the shared transport and
    /// ignored by dedicated handles; `"*"` matches any origin.
    fn post_message(
        &self,
        data: &str,
        target_origin: &str,
        transfer: Vec<PortHandle>,
    ) -> Result<(), PortError>;

    /// Begin delivering messages that arrive on this handle to the context
    /// holding it.
    fn start(&self);

    /// Release the handle.
    fn close(&self);
}

pub type PortHandle = Arc<dyn MessagePort>;

impl fmt::Debug for dyn MessagePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessagePort({})", self.port_id())
    }
}

/// How an inbound message reached this context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Over the shared window transport.
    Window,
    /// Over the dedicated handle with this id, held by this context.
    Port(PortId),
}

/// A raw delivery from the transport.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub data: String,
    /// Origin reported by the transport for the sender.
    pub origin: String,
    /// Handle that reaches the sender over the shared transport.
    pub source: Option<PortHandle>,
    /// Handles transferred with the message.
    pub ports: Vec<PortHandle>,
    pub route: Route,
}

/// The environment one context runs in.
pub trait Transport: Send + Sync {
    /// Origin of this context.
    fn origin(&self) -> String;

    /// Whether this context is the root of the hosting hierarchy.
    fn is_root(&self) -> bool;

    /// Shared handle of the root context. `None` for the root itself.
    fn top(&self) -> Option<PortHandle>;

    /// Shared handles of the other frames hosted directly by the root.
    fn siblings(&self) -> Vec<PortHandle>;

    /// Create an entangled pair of dedicated handles, or `None` when the
    /// environment has no such primitive.
    fn create_channel(&self) -> Option<(PortHandle, PortHandle)>;
}

/// A frame as described by the hosting page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostedFrame {
    /// Identifier persisted for this frame, if one was assigned before.
    pub id: Option<String>,
    pub tags: Vec<String>,
}

/// The root's view of the frames it hosts.
pub trait FrameHost: Send + Sync {
    /// Look up the hosted frame whose shared handle is `source`.
    fn frame_for_source(&self, source: PortId) -> Option<HostedFrame>;

    /// Persist the identifier assigned to the frame behind `source`.
    fn assign_id(&self, source: PortId, id: &str);
}
