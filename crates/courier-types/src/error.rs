//! Shared error types for the frame courier.

use thiserror::Error;

/// Errors that reach application code.
#[derive(Error, Debug)]
pub enum CourierError {
    /// No peer is registered under the requested identifier.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CourierError {
    /// The peer identifier carried by a [`CourierError::PeerNotFound`].
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            CourierError::PeerNotFound(id) => Some(id),
            _ => None,
        }
    }
}

/// Alias for Result with CourierError.
pub type CourierResult<T> = Result<T, CourierError>;

/// Why an inbound message or protocol step was dropped.
///
/// Rejections never propagate to application code. The protocol logs them
/// and leaves the affected peer relationship as it was.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The raw data did not decode into an envelope.
    #[error("malformed envelope")]
    MalformedEnvelope,

    /// The envelope belongs to another protocol instance.
    #[error("scope mismatch: expected {expected}, found {found}")]
    ScopeMismatch { expected: String, found: String },

    /// The message arrived from an origin or route that is not bound to the peer.
    #[error("origin mismatch for peer '{peer}'")]
    OriginMismatch { peer: String },

    /// A peer with this identifier is already registered.
    #[error("peer '{0}' is already registered")]
    DuplicatePeerRegistration(String),

    /// A channel replacement came from a different origin than the installed one.
    #[error("channel replacement for '{peer}' rejected: origin {offered} != {installed}")]
    ChannelReplacementRejected {
        peer: String,
        installed: String,
        offered: String,
    },

    /// The offer lost the tie-break against an older accepted offer.
    #[error("stale offer from '{peer}' at {offered} (recorded {recorded})")]
    StaleOffer {
        peer: String,
        offered: i64,
        recorded: i64,
    },

    /// The same delivery was already processed.
    #[error("duplicate delivery of {0}")]
    DuplicateDelivery(String),

    /// The sender could not be matched to any hosted frame.
    #[error("unknown message source")]
    UnknownSource,

    /// The negotiation payload was missing or inconsistent with the envelope.
    #[error("invalid negotiation payload in {0}")]
    InvalidNegotiationPayload(String),

    /// The envelope is addressed to another context.
    #[error("envelope addressed to '{to}'")]
    MisaddressedEnvelope { to: String },
}
