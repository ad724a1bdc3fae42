//! In-process transport: a deterministic model of a host page and its frames.
//!
//! Windows have an origin and a parent; posting to a window is gated by the
//! target origin. Dedicated ports come in entangled pairs, queue messages
//! until started, and change owner when transferred. Every delivery goes
//! through one FIFO queue that the caller pumps, so tests can inspect,
//! reorder or duplicate traffic between steps.

use crate::registry::parse_tags;
use crate::transport::{
    FrameHost, HostedFrame, InboundMessage, MessagePort, PortError, PortHandle, PortId, Route,
    Transport,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Upper bound on deliveries pumped by one [`MemoryNetwork::run_until_idle`].
const MAX_STEPS: usize = 100_000;

/// Index of a window in a [`MemoryNetwork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub usize);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window-{}", self.0)
    }
}

/// A message queued for a window.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub target: WindowId,
    pub message: InboundMessage,
}

struct WindowState {
    port_id: PortId,
    origin: String,
    parent: Option<WindowId>,
    frame_id: Option<String>,
    frame_tags: Vec<String>,
}

struct PortState {
    owner: WindowId,
    entangled: PortId,
    started: bool,
    closed: bool,
    starts: usize,
    backlog: Vec<InboundMessage>,
}

#[derive(Default)]
struct NetworkState {
    windows: Vec<WindowState>,
    ports: HashMap<PortId, PortState>,
    queue: VecDeque<Delivery>,
    channels_disabled: bool,
}

impl NetworkState {
    fn root_of(&self, mut window: WindowId) -> WindowId {
        while let Some(parent) = self.windows[window.0].parent {
            window = parent;
        }
        window
    }

    /// Move `transfer` from `holder` to `receiver`.
    fn transfer(
        &mut self,
        holder: WindowId,
        receiver: WindowId,
        transfer: &[PortHandle],
    ) -> Result<(), PortError> {
        for port in transfer {
            match self.ports.get(&port.port_id()) {
                Some(state) if !state.closed && state.owner == holder => {}
                _ => return Err(PortError::DataClone(port.port_id().to_string())),
            }
        }
        for port in transfer {
            if let Some(state) = self.ports.get_mut(&port.port_id()) {
                state.owner = receiver;
                state.started = false;
            }
        }
        Ok(())
    }
}

/// A simulated page: one root window, its frames, and the ports between them.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Model an environment with or without dedicated ports.
    pub fn set_channels_enabled(&self, enabled: bool) {
        self.lock().channels_disabled = !enabled;
    }

    pub fn add_root(&self, origin: &str) -> WindowId {
        self.add_window(origin, None, None, Vec::new())
    }

    /// Embed a frame in `parent`. `frame_id` is the identifier persisted by
    /// the host page, if any; `tags` is a whitespace-separated list.
    pub fn add_frame(
        &self,
        parent: WindowId,
        origin: &str,
        frame_id: Option<&str>,
        tags: &str,
    ) -> WindowId {
        self.add_window(
            origin,
            Some(parent),
            frame_id.map(str::to_string),
            parse_tags(tags),
        )
    }

    fn add_window(
        &self,
        origin: &str,
        parent: Option<WindowId>,
        frame_id: Option<String>,
        frame_tags: Vec<String>,
    ) -> WindowId {
        let mut state = self.lock();
        let id = WindowId(state.windows.len());
        state.windows.push(WindowState {
            port_id: PortId::new(),
            origin: origin.to_string(),
            parent,
            frame_id,
            frame_tags,
        });
        id
    }

    /// The transport seen by code running in `window`.
    pub fn transport(&self, window: WindowId) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            net: self.clone(),
            window,
        })
    }

    /// Identifier the host page has persisted for `window`.
    pub fn frame_id(&self, window: WindowId) -> Option<String> {
        self.lock().windows[window.0].frame_id.clone()
    }

    /// Shared handle id of `window`.
    pub fn window_port(&self, window: WindowId) -> PortId {
        self.lock().windows[window.0].port_id
    }

    /// How many times `port` was started.
    pub fn start_count(&self, port: PortId) -> usize {
        self.lock().ports.get(&port).map_or(0, |p| p.starts)
    }

    pub fn is_closed(&self, port: PortId) -> bool {
        self.lock().ports.get(&port).is_some_and(|p| p.closed)
    }

    /// The other end of a dedicated port.
    pub fn entangled(&self, port: PortId) -> Option<PortId> {
        self.lock().ports.get(&port).map(|p| p.entangled)
    }

    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Remove and return every queued delivery.
    pub fn take_pending(&self) -> Vec<Delivery> {
        self.lock().queue.drain(..).collect()
    }

    /// Append a delivery to the queue.
    pub fn inject(&self, delivery: Delivery) {
        self.lock().queue.push_back(delivery);
    }

    /// Post `data` over the shared transport as if sent by `from`.
    pub fn post_window(&self, from: WindowId, to: WindowId, data: &str) {
        let handle = WindowHandle {
            net: self.clone(),
            target: to,
            holder: from,
        };
        if let Err(e) = handle.post_message(data, "*", Vec::new()) {
            warn!(error = %e, "Window post failed");
        }
    }

    /// Deliver the next queued message. Returns `false` when the queue is empty.
    pub fn step<F>(&self, mut handler: F) -> bool
    where
        F: FnMut(WindowId, InboundMessage),
    {
        let next = self.lock().queue.pop_front();
        match next {
            Some(delivery) => {
                handler(delivery.target, delivery.message);
                true
            }
            None => false,
        }
    }

    /// Deliver until the queue is empty. Returns the number of deliveries.
    pub fn run_until_idle<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(WindowId, InboundMessage),
    {
        let mut steps = 0;
        while steps < MAX_STEPS && self.step(&mut handler) {
            steps += 1;
        }
        if steps == MAX_STEPS {
            warn!(steps, "Delivery limit reached, queue not drained");
        }
        steps
    }
}

/// Shared transport of `target`, as reachable from `holder`.
struct WindowHandle {
    net: MemoryNetwork,
    target: WindowId,
    holder: WindowId,
}

impl MessagePort for WindowHandle {
    fn port_id(&self) -> PortId {
        self.net.lock().windows[self.target.0].port_id
    }

    fn post_message(
        &self,
        data: &str,
        target_origin: &str,
        transfer: Vec<PortHandle>,
    ) -> Result<(), PortError> {
        let mut state = self.net.lock();
        state.transfer(self.holder, self.target, &transfer)?;

        if target_origin != "*" && state.windows[self.target.0].origin != target_origin {
            return Ok(());
        }

        let message = InboundMessage {
            data: data.to_string(),
            origin: state.windows[self.holder.0].origin.clone(),
            source: Some(Arc::new(WindowHandle {
                net: self.net.clone(),
                target: self.holder,
                holder: self.target,
            })),
            ports: transfer,
            route: Route::Window,
        };
        state.queue.push_back(Delivery {
            target: self.target,
            message,
        });
        Ok(())
    }

    fn start(&self) {}

    fn close(&self) {}
}

/// One end of an entangled port pair.
struct MemoryPort {
    net: MemoryNetwork,
    id: PortId,
}

impl MessagePort for MemoryPort {
    fn port_id(&self) -> PortId {
        self.id
    }

    fn post_message(
        &self,
        data: &str,
        _target_origin: &str,
        transfer: Vec<PortHandle>,
    ) -> Result<(), PortError> {
        let mut state = self.net.lock();
        let (owner, entangled) = match state.ports.get(&self.id) {
            Some(port) if !port.closed => (port.owner, port.entangled),
            _ => return Err(PortError::Closed),
        };
        let receiver = match state.ports.get(&entangled) {
            Some(peer) if !peer.closed => peer.owner,
            _ => return Ok(()),
        };
        state.transfer(owner, receiver, &transfer)?;

        let message = InboundMessage {
            data: data.to_string(),
            origin: state.windows[owner.0].origin.clone(),
            source: None,
            ports: transfer,
            route: Route::Port(entangled),
        };
        let NetworkState { ports, queue, .. } = &mut *state;
        if let Some(peer) = ports.get_mut(&entangled) {
            if peer.started {
                queue.push_back(Delivery {
                    target: peer.owner,
                    message,
                });
            } else {
                peer.backlog.push(message);
            }
        }
        Ok(())
    }

    fn start(&self) {
        let mut state = self.net.lock();
        let NetworkState { ports, queue, .. } = &mut *state;
        if let Some(port) = ports.get_mut(&self.id) {
            port.starts += 1;
            if port.started || port.closed {
                return;
            }
            port.started = true;
            for message in port.backlog.drain(..) {
                queue.push_back(Delivery {
                    target: port.owner,
                    message,
                });
            }
        }
    }

    fn close(&self) {
        let mut state = self.net.lock();
        if let Some(port) = state.ports.get_mut(&self.id) {
            port.closed = true;
            port.backlog.clear();
        }
    }
}

/// The environment of one window.
pub struct MemoryTransport {
    net: MemoryNetwork,
    window: WindowId,
}

impl MemoryTransport {
    pub fn window(&self) -> WindowId {
        self.window
    }

    fn handle_to(&self, target: WindowId) -> PortHandle {
        Arc::new(WindowHandle {
            net: self.net.clone(),
            target,
            holder: self.window,
        })
    }
}

impl Transport for MemoryTransport {
    fn origin(&self) -> String {
        self.net.lock().windows[self.window.0].origin.clone()
    }

    fn is_root(&self) -> bool {
        self.net.lock().windows[self.window.0].parent.is_none()
    }

    fn top(&self) -> Option<PortHandle> {
        let root = self.net.lock().root_of(self.window);
        (root != self.window).then(|| self.handle_to(root))
    }

    fn siblings(&self) -> Vec<PortHandle> {
        let frames: Vec<WindowId> = {
            let state = self.net.lock();
            let root = state.root_of(self.window);
            if root == self.window {
                return Vec::new();
            }
            state
                .windows
                .iter()
                .enumerate()
                .filter(|(i, w)| w.parent == Some(root) && *i != self.window.0)
                .map(|(i, _)| WindowId(i))
                .collect()
        };
        frames.into_iter().map(|w| self.handle_to(w)).collect()
    }

    fn create_channel(&self) -> Option<(PortHandle, PortHandle)> {
        let mut state = self.net.lock();
        if state.channels_disabled {
            return None;
        }
        let (a, b) = (PortId::new(), PortId::new());
        for (id, entangled) in [(a, b), (b, a)] {
            state.ports.insert(
                id,
                PortState {
                    owner: self.window,
                    entangled,
                    started: false,
                    closed: false,
                    starts: 0,
                    backlog: Vec::new(),
                },
            );
        }
        let local: PortHandle = Arc::new(MemoryPort {
            net: self.net.clone(),
            id: a,
        });
        let remote: PortHandle = Arc::new(MemoryPort {
            net: self.net.clone(),
            id: b,
        });
        Some((local, remote))
    }
}

impl FrameHost for MemoryTransport {
    fn frame_for_source(&self, source: PortId) -> Option<HostedFrame> {
        let state = self.net.lock();
        state
            .windows
            .iter()
            .find(|w| w.port_id == source && w.parent == Some(self.window))
            .map(|w| HostedFrame {
                id: w.frame_id.clone(),
                tags: w.frame_tags.clone(),
            })
    }

    fn assign_id(&self, source: PortId, id: &str) {
        let mut state = self.net.lock();
        let window = self.window;
        if let Some(w) = state
            .windows
            .iter_mut()
            .find(|w| w.port_id == source && w.parent == Some(window))
        {
            w.frame_id = Some(id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> (MemoryNetwork, WindowId, WindowId, WindowId) {
        let net = MemoryNetwork::new();
        let root = net.add_root("https://host.example");
        let a = net.add_frame(root, "https://a.example", Some("frame-a"), "x y");
        let b = net.add_frame(root, "https://b.example", None, "");
        (net, root, a, b)
    }

    fn drain(net: &MemoryNetwork) -> Vec<(WindowId, InboundMessage)> {
        let mut out = Vec::new();
        net.run_until_idle(|w, m| out.push((w, m)));
        out
    }

    #[test]
    fn test_hierarchy() {
        let (net, root, a, b) = page();
        let root_t = net.transport(root);
        let a_t = net.transport(a);

        assert!(root_t.is_root());
        assert!(root_t.top().is_none());
        assert!(root_t.siblings().is_empty());
        assert!(!a_t.is_root());
        assert_eq!(a_t.top().unwrap().port_id(), net.window_port(root));

        let siblings: Vec<_> = a_t.siblings().iter().map(|s| s.port_id()).collect();
        assert_eq!(siblings, vec![net.window_port(b)]);
    }

    #[test]
    fn test_window_post_reports_source_and_origin() {
        let (net, root, a, _) = page();
        let top = net.transport(a).top().unwrap();
        top.post_message("hello", "*", Vec::new()).unwrap();

        let delivered = drain(&net);
        assert_eq!(delivered.len(), 1);
        let (target, msg) = &delivered[0];
        assert_eq!(*target, root);
        assert_eq!(msg.data, "hello");
        assert_eq!(msg.origin, "https://a.example");
        assert_eq!(msg.route, Route::Window);
        assert_eq!(
            msg.source.as_ref().unwrap().port_id(),
            net.window_port(a)
        );
    }

    #[test]
    fn test_target_origin_gates_window_posts() {
        let (net, _, a, _) = page();
        let top = net.transport(a).top().unwrap();
        top.post_message("wrong", "https://elsewhere.example", Vec::new())
            .unwrap();
        top.post_message("right", "https://host.example", Vec::new())
            .unwrap();

        let delivered = drain(&net);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1.data, "right");
    }

    #[test]
    fn test_port_backlog_until_started() {
        let (net, root, _, _) = page();
        let (local, remote) = net.transport(root).create_channel().unwrap();

        local.post_message("early", "*", Vec::new()).unwrap();
        assert_eq!(net.pending(), 0);

        remote.start();
        let delivered = drain(&net);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1.route, Route::Port(remote.port_id()));
        assert_eq!(net.start_count(remote.port_id()), 1);
    }

    #[test]
    fn test_transfer_moves_ownership() {
        let (net, root, a, _) = page();
        let root_t = net.transport(root);
        let (local, remote) = root_t.create_channel().unwrap();

        // The root posts to frame a, transferring the remote end.
        let frame_a = root_t.frame_for_source(net.window_port(a));
        assert_eq!(frame_a.unwrap().id.as_deref(), Some("frame-a"));
        let a_handle = WindowHandle {
            net: net.clone(),
            target: a,
            holder: root,
        };
        a_handle
            .post_message("setup", "https://a.example", vec![remote.clone()])
            .unwrap();

        let delivered = drain(&net);
        let (target, msg) = &delivered[0];
        assert_eq!(*target, a);
        assert_eq!(msg.ports.len(), 1);

        // Frame a answers over the transferred end.
        let received = msg.ports[0].clone();
        received.start();
        local.start();
        received.post_message("reply", "*", Vec::new()).unwrap();
        let delivered = drain(&net);
        assert_eq!(delivered[0].0, root);
        assert_eq!(delivered[0].1.origin, "https://a.example");

        // A handle that already moved cannot be transferred again by the root.
        assert!(matches!(
            a_handle.post_message("again", "*", vec![remote]),
            Err(PortError::DataClone(_))
        ));
    }

    #[test]
    fn test_closed_port() {
        let (net, root, _, _) = page();
        let (local, remote) = net.transport(root).create_channel().unwrap();
        remote.start();
        remote.close();
        assert!(net.is_closed(remote.port_id()));

        // Messages to a closed end vanish; posting from it fails.
        local.post_message("lost", "*", Vec::new()).unwrap();
        assert_eq!(net.pending(), 0);
        assert_eq!(
            remote.post_message("x", "*", Vec::new()),
            Err(PortError::Closed)
        );
    }

    #[test]
    fn test_channels_disabled() {
        let (net, root, _, _) = page();
        net.set_channels_enabled(false);
        assert!(net.transport(root).create_channel().is_none());
    }

    #[test]
    fn test_frame_host_assign_id() {
        let (net, root, _, b) = page();
        let host = net.transport(root);
        let source = net.window_port(b);
        assert_eq!(host.frame_for_source(source).unwrap().id, None);
        host.assign_id(source, "frame-b");
        assert_eq!(net.frame_id(b).as_deref(), Some("frame-b"));

        // Only frames hosted by this window are visible.
        assert!(net.transport(b).frame_for_source(source).is_none());
    }
}
