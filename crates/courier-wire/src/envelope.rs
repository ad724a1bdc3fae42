//! Envelope codec.
//!
//! Every message exchanged between contexts is an [`Envelope`] serialized
//! as a single JSON object:
//!
//! ```json
//! {"messageId":"…","timestamp":1700000000000,"to":"frame-1","from":"",
//!  "event":"_frame_courier--setup","payload":{…},"scope":"frame-courier"}
//! ```
//!
//! The message id is derived from the content, and the response event of a
//! message is derived from its id, so a reply can be correlated without any
//! extra round trip.

use courier_types::Rejection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Protocol event names. The prefix keeps them apart from application events.
pub mod events {
    pub const PREFIX: &str = "_frame_courier--";
    /// A frame announces to the root that it has loaded.
    pub const LOADED: &str = "_frame_courier--loaded";
    /// The root hands a frame its identity.
    pub const SETUP: &str = "_frame_courier--setup";
    /// A frame with an identity announces itself to its siblings.
    pub const READY: &str = "_frame_courier--ready";
    /// A sibling answers READY with a channel offer.
    pub const HANDSHAKE: &str = "_frame_courier--handshake";
    /// Prefix of every derived response event.
    pub const MESSAGE_RESPONSE: &str = "_frame_courier--message-response";
}

/// Address used before the recipient's identity is known.
pub const WILDCARD: &str = "?";

/// Identifier of the root context.
pub const ROOT_ID: &str = "";

/// Errors produced while decoding or encoding envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("scope mismatch: expected {expected}, found {found}")]
    ScopeMismatch { expected: String, found: String },
}

impl From<EnvelopeError> for Rejection {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::Malformed(_) => Rejection::MalformedEnvelope,
            EnvelopeError::ScopeMismatch { expected, found } => {
                Rejection::ScopeMismatch { expected, found }
            }
        }
    }
}

/// The addressed, correlatable unit exchanged between contexts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// `event:` followed by a hash of (timestamp, to, payload).
    pub message_id: String,
    /// Creation time in milliseconds.
    pub timestamp: i64,
    /// Recipient identifier, or [`WILDCARD`].
    pub to: String,
    /// Sender identifier, or [`WILDCARD`] before one is assigned.
    pub from: String,
    /// Event name.
    pub event: String,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: Value,
    /// Protocol instance this envelope belongs to.
    pub scope: String,
}

/// Which step of the protocol an envelope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolEvent {
    Loaded,
    Setup,
    Ready,
    Handshake,
    Application,
}

/// Identity carried by SETUP, READY and HANDSHAKE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationPayload {
    #[serde(rename = "frameId")]
    pub peer_id: String,
    #[serde(rename = "frameTags")]
    pub peer_tags: Vec<String>,
}

impl NegotiationPayload {
    pub fn new(peer_id: impl Into<String>, peer_tags: Vec<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            peer_tags,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "frameId": self.peer_id,
            "frameTags": self.peer_tags,
        })
    }
}

impl Envelope {
    /// Build an envelope stamped with `timestamp`.
    pub fn new(
        to: impl Into<String>,
        from: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
        timestamp: i64,
        scope: impl Into<String>,
    ) -> Self {
        let to = to.into();
        let event = event.into();
        let message_id = format!("{}:{}", event, content_hash(timestamp, &to, &payload));
        Self {
            message_id,
            timestamp,
            to,
            from: from.into(),
            event,
            payload,
            scope: scope.into(),
        }
    }

    /// Event a reply to this envelope is sent under.
    pub fn response_event(&self) -> String {
        response_event_of(&self.message_id)
    }

    /// Serialize to the wire text form.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse wire text, accepting only envelopes of `scope`.
    pub fn parse(data: &str, scope: &str) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_str(data)?;
        if envelope.scope != scope {
            return Err(EnvelopeError::ScopeMismatch {
                expected: scope.to_string(),
                found: envelope.scope,
            });
        }
        Ok(envelope)
    }

    pub fn protocol_event(&self) -> ProtocolEvent {
        match self.event.as_str() {
            events::LOADED => ProtocolEvent::Loaded,
            events::SETUP => ProtocolEvent::Setup,
            events::READY => ProtocolEvent::Ready,
            events::HANDSHAKE => ProtocolEvent::Handshake,
            _ => ProtocolEvent::Application,
        }
    }

    /// Decode the identity payload. Returns `None` when the payload does not
    /// carry a non-empty identifier.
    pub fn negotiation_payload(&self) -> Option<NegotiationPayload> {
        let payload: NegotiationPayload = serde_json::from_value(self.payload.clone()).ok()?;
        if payload.peer_id.is_empty() {
            return None;
        }
        Some(payload)
    }
}

/// Derive the response event for a message id.
pub fn response_event_of(message_id: &str) -> String {
    format!("{}:{}", events::MESSAGE_RESPONSE, short_hash(message_id.as_bytes()))
}

fn content_hash(timestamp: i64, to: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(to.as_bytes());
    hasher.update([0]);
    hasher.update(payload.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

fn short_hash(data: &[u8]) -> String {
    hex::encode(&Sha256::digest(data)[..8])
}
