//! Listener dispatch and request/response correlation.
//!
//! Callbacks are registered per event name and run in registration order.
//! Each callback receives a [`Responder`] that answers the sender under the
//! response event derived from the inbound message id; a callback passed to
//! [`Responder::respond`] is registered under the response event of the
//! reply, so chains of any depth need no extra bookkeeping. A reply callback
//! only runs for the peer the original message was sent to.

use crate::courier::Courier;
use crate::envelope::{Envelope, WILDCARD};
use crate::transport::InboundMessage;
use courier_types::{CourierResult, Rejection};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// An event callback.
pub type Listener = Arc<dyn Fn(&Value, &Responder) + Send + Sync>;

/// Wrap a closure as a [`Listener`].
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&Value, &Responder) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone)]
struct Entry {
    /// Only messages from this peer reach the listener.
    from: Option<String>,
    listener: Listener,
}

/// Event name to callbacks, in insertion order.
#[derive(Clone, Default)]
pub struct ListenerTable {
    table: Arc<Mutex<HashMap<String, Vec<Entry>>>>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `event` from any peer.
    pub fn add(&self, event: &str, listener: Listener) {
        self.push(event, Entry { from: None, listener });
    }

    /// Register a reply callback that only `peer_id` can trigger.
    pub fn add_reply(&self, event: &str, peer_id: &str, listener: Listener) {
        self.push(
            event,
            Entry {
                from: Some(peer_id.to_string()),
                listener,
            },
        );
    }

    fn push(&self, event: &str, entry: Entry) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.entry(event.to_string()).or_default().push(entry);
    }

    /// Callbacks for `event` sent by `from`, cloned so they can run without
    /// the lock held.
    pub fn listeners(&self, event: &str, from: &str) -> Vec<Listener> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .get(event)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.from.as_deref().map_or(true, |id| id == from))
                    .map(|entry| entry.listener.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of listeners registered for `event`.
    pub fn count(&self, event: &str) -> usize {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.get(event).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for ListenerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_map()
            .entries(table.iter().map(|(event, list)| (event, list.len())))
            .finish()
    }
}

/// Answers the sender of a dispatched message.
#[derive(Clone)]
pub struct Responder {
    courier: Courier,
    peer_id: String,
    response_event: String,
}

impl Responder {
    /// Identifier of the peer that sent the message.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Event the reply is sent under.
    pub fn response_event(&self) -> &str {
        &self.response_event
    }

    /// Send `payload` back to the sender. `on_reply` is invoked if the sender
    /// answers this reply in turn.
    pub fn respond(&self, payload: Value, on_reply: Option<Listener>) -> CourierResult<()> {
        self.courier
            .send(&self.peer_id, &self.response_event, payload, on_reply)
    }
}

impl Courier {
    /// Route an application envelope to its listeners.
    pub(crate) fn dispatch(&self, msg: InboundMessage, envelope: Envelope) -> Result<(), Rejection> {
        let addressed = envelope.to == WILDCARD || self.id().as_deref() == Some(envelope.to.as_str());
        if !addressed {
            return Err(Rejection::MisaddressedEnvelope { to: envelope.to });
        }

        let peer = self
            .peer(&envelope.from)
            .ok_or_else(|| Rejection::OriginMismatch {
                peer: envelope.from.clone(),
            })?;
        if !peer
            .channel
            .accepts(msg.route, msg.source.as_ref(), &msg.origin, &peer.origin)
        {
            return Err(Rejection::OriginMismatch { peer: peer.id });
        }

        let callbacks = self.inner.listeners.listeners(&envelope.event, &peer.id);
        if callbacks.is_empty() {
            debug!(event = %envelope.event, from = %peer.id, "No listeners for event");
            return Ok(());
        }

        let responder = Responder {
            courier: self.clone(),
            peer_id: peer.id,
            response_event: envelope.response_event(),
        };
        for callback in callbacks {
            callback(&envelope.payload, &responder);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_listeners_in_insertion_order() {
        let table = ListenerTable::new();
        let registered: Vec<Listener> = (0..3).map(|_| listener(|_, _| {})).collect();
        for l in &registered {
            table.add("ping", l.clone());
        }
        assert_eq!(table.count("ping"), 3);
        assert_eq!(table.count("pong"), 0);
        assert!(table.listeners("pong", "frame-1").is_empty());

        let stored = table.listeners("ping", "frame-1");
        for (a, b) in stored.iter().zip(&registered) {
            assert!(Arc::ptr_eq(a, b));
        }
    }

    #[test]
    fn test_table_is_shared_between_clones() {
        let table = ListenerTable::new();
        let clone = table.clone();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        clone.add(
            "ping",
            listener(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(table.count("ping"), 1);
        assert_eq!(format!("{table:?}"), "{\"ping\": 1}");
    }

    #[test]
    fn test_reply_listener_only_runs_for_addressed_peer() {
        let table = ListenerTable::new();
        let open = listener(|_, _| {});
        let reply = listener(|_, _| {});
        table.add("reply-event", open.clone());
        table.add_reply("reply-event", "frame-b", reply.clone());

        let from_b = table.listeners("reply-event", "frame-b");
        assert_eq!(from_b.len(), 2);
        assert!(Arc::ptr_eq(&from_b[1], &reply));

        let from_c = table.listeners("reply-event", "frame-c");
        assert_eq!(from_c.len(), 1);
        assert!(Arc::ptr_eq(&from_c[0], &open));
        assert_eq!(table.count("reply-event"), 2);
    }
}
