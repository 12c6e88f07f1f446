// Client-local projection of room presence.
//
// Two structures are kept in lockstep: node-keyed presence sets and the
// session-keyed reverse index. Every mutation updates both before it returns.

use std::collections::{HashMap, HashSet};

use flowpresence_common::protocol::ws::{PresenceKind, UserStatus};
use flowpresence_common::types::{NodeId, SessionId, UserId};

/// Presence sets for a single node. Never stored empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePresenceEntry {
    pub hovering: HashSet<SessionId>,
    pub editing: HashSet<SessionId>,
}

impl NodePresenceEntry {
    fn set(&self, kind: PresenceKind) -> &HashSet<SessionId> {
        match kind {
            PresenceKind::Hovering => &self.hovering,
            PresenceKind::Editing => &self.editing,
        }
    }

    fn set_mut(&mut self, kind: PresenceKind) -> &mut HashSet<SessionId> {
        match kind {
            PresenceKind::Hovering => &mut self.hovering,
            PresenceKind::Editing => &mut self.editing,
        }
    }

    fn is_empty(&self) -> bool {
        self.hovering.is_empty() && self.editing.is_empty()
    }
}

/// Borrowed view of a node's presence. Empty for unknown nodes.
#[derive(Debug, Clone, Copy)]
pub struct NodePresence<'a> {
    entry: Option<&'a NodePresenceEntry>,
}

impl<'a> NodePresence<'a> {
    pub fn hovering(&self) -> impl Iterator<Item = &'a SessionId> {
        self.entry.into_iter().flat_map(|entry| entry.hovering.iter())
    }

    pub fn editing(&self) -> impl Iterator<Item = &'a SessionId> {
        self.entry.into_iter().flat_map(|entry| entry.editing.iter())
    }

    pub fn is_hovering(&self, session_id: &SessionId) -> bool {
        self.entry.is_some_and(|entry| entry.hovering.contains(session_id))
    }

    pub fn is_editing(&self, session_id: &SessionId) -> bool {
        self.entry.is_some_and(|entry| entry.editing.contains(session_id))
    }

    pub fn hovering_count(&self) -> usize {
        self.entry.map_or(0, |entry| entry.hovering.len())
    }

    pub fn editing_count(&self) -> usize {
        self.entry.map_or(0, |entry| entry.editing.len())
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    /// Owned copy of both sets, `(hovering, editing)`.
    pub fn to_sets(&self) -> (HashSet<SessionId>, HashSet<SessionId>) {
        match self.entry {
            Some(entry) => (entry.hovering.clone(), entry.editing.clone()),
            None => (HashSet::new(), HashSet::new()),
        }
    }
}

/// Where one session currently is, per presence kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPresence {
    pub hovering: Option<NodeId>,
    pub editing: Option<NodeId>,
}

impl SessionPresence {
    fn slot(&self, kind: PresenceKind) -> Option<&NodeId> {
        match kind {
            PresenceKind::Hovering => self.hovering.as_ref(),
            PresenceKind::Editing => self.editing.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: PresenceKind) -> &mut Option<NodeId> {
        match kind {
            PresenceKind::Hovering => &mut self.hovering,
            PresenceKind::Editing => &mut self.editing,
        }
    }

    fn is_empty(&self) -> bool {
        self.hovering.is_none() && self.editing.is_none()
    }
}

/// A single `{nodeId, type}` presence record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSlot {
    pub node_id: NodeId,
    pub kind: PresenceKind,
}

/// Display attributes of a room member, learned from join/roster frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Account behind the session. `None` until the relay has named it.
    pub user_id: Option<UserId>,
    pub color: String,
    pub status: UserStatus,
}

/// What changed in the store. Emitted once per affected key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Node(NodeId),
    Session(SessionId),
    Cleared,
}

/// Handle returned by [`PresenceStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&PresenceChange) + Send>;

/// Presence state for one client. Construct one per connection lifecycle;
/// nothing here is global.
#[derive(Default)]
pub struct PresenceStore {
    nodes: HashMap<NodeId, NodePresenceEntry>,
    sessions: HashMap<SessionId, SessionPresence>,
    peers: HashMap<SessionId, PeerInfo>,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
}

impl std::fmt::Debug for PresenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceStore")
            .field("nodes", &self.nodes)
            .field("sessions", &self.sessions)
            .field("peers", &self.peers)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn node_presence(&self, node_id: &NodeId) -> NodePresence<'_> {
        NodePresence { entry: self.nodes.get(node_id) }
    }

    /// The session's presence record. Editing takes precedence over hovering
    /// when the session holds both.
    pub fn user_presence(&self, session_id: &SessionId) -> Option<PresenceSlot> {
        let presence = self.sessions.get(session_id)?;
        [PresenceKind::Editing, PresenceKind::Hovering].into_iter().find_map(|kind| {
            presence.slot(kind).map(|node_id| PresenceSlot { node_id: node_id.clone(), kind })
        })
    }

    /// Both presence slots of a session.
    pub fn session_presence(&self, session_id: &SessionId) -> Option<&SessionPresence> {
        self.sessions.get(session_id)
    }

    /// Node the session holds presence of the given kind on.
    pub fn presence_of(&self, session_id: &SessionId, kind: PresenceKind) -> Option<&NodeId> {
        self.sessions.get(session_id).and_then(|presence| presence.slot(kind))
    }

    pub fn has_node_entry(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn active_nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn peer(&self, session_id: &SessionId) -> Option<&PeerInfo> {
        self.peers.get(session_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = (&SessionId, &PeerInfo)> {
        self.peers.iter()
    }

    // ── Mutations ───────────────────────────────────────────────────

    /// Record `session_id` as `kind` on `node_id`, moving it off any other
    /// node it held the same kind of presence on.
    pub fn add_node_presence(&mut self, node_id: NodeId, session_id: SessionId, kind: PresenceKind) {
        let previous = self.presence_of(&session_id, kind).cloned();
        if previous.as_ref() == Some(&node_id) {
            return;
        }

        if let Some(previous_node) = previous {
            self.detach(&previous_node, &session_id, kind);
            self.notify(PresenceChange::Node(previous_node));
        }

        self.nodes.entry(node_id.clone()).or_default().set_mut(kind).insert(session_id.clone());
        *self.sessions.entry(session_id.clone()).or_default().slot_mut(kind) = Some(node_id.clone());

        self.notify(PresenceChange::Node(node_id));
        self.notify(PresenceChange::Session(session_id));
    }

    /// Drop `session_id` from the `kind` set of `node_id`. No-op when the
    /// session is not recorded there.
    pub fn remove_node_presence(&mut self, node_id: &NodeId, session_id: &SessionId, kind: PresenceKind) {
        if self.presence_of(session_id, kind) != Some(node_id) {
            return;
        }

        self.detach(node_id, session_id, kind);
        self.clear_slot(session_id, kind);

        self.notify(PresenceChange::Node(node_id.clone()));
        self.notify(PresenceChange::Session(session_id.clone()));
    }

    /// Remove every trace of a session (leave or disconnect).
    pub fn remove_user_presence(&mut self, session_id: &SessionId) {
        let Some(presence) = self.sessions.remove(session_id) else {
            return;
        };

        let mut touched = Vec::with_capacity(2);
        for kind in [PresenceKind::Hovering, PresenceKind::Editing] {
            if let Some(node_id) = presence.slot(kind) {
                self.detach(node_id, session_id, kind);
                if !touched.contains(node_id) {
                    touched.push(node_id.clone());
                }
            }
        }

        for node_id in touched {
            self.notify(PresenceChange::Node(node_id));
        }
        self.notify(PresenceChange::Session(session_id.clone()));
    }

    /// Reset all presence state, peers included. Listeners stay registered.
    pub fn clear_all(&mut self) {
        self.nodes.clear();
        self.sessions.clear();
        self.peers.clear();
        self.notify(PresenceChange::Cleared);
    }

    pub fn upsert_peer(&mut self, session_id: SessionId, info: PeerInfo) {
        if self.peers.get(&session_id) == Some(&info) {
            return;
        }
        self.peers.insert(session_id.clone(), info);
        self.notify(PresenceChange::Session(session_id));
    }

    pub fn set_peer_status(&mut self, session_id: &SessionId, status: UserStatus) {
        let Some(peer) = self.peers.get_mut(session_id) else {
            return;
        };
        if peer.status != status {
            peer.status = status;
            self.notify(PresenceChange::Session(session_id.clone()));
        }
    }

    /// Distinct users with at least one session in the room, sorted.
    pub fn connected_users(&self) -> Vec<&UserId> {
        let mut users: Vec<&UserId> = self.peers.values().filter_map(|peer| peer.user_id.as_ref()).collect();
        users.sort();
        users.dedup();
        users
    }

    pub fn remove_peer(&mut self, session_id: &SessionId) {
        if self.peers.remove(session_id).is_some() {
            self.notify(PresenceChange::Session(session_id.clone()));
        }
    }

    // ── Observers ───────────────────────────────────────────────────

    /// Register a change listener. Called synchronously after each mutation.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&PresenceChange) + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Remove from the node-keyed set only, collecting the entry when empty.
    fn detach(&mut self, node_id: &NodeId, session_id: &SessionId, kind: PresenceKind) {
        if let Some(entry) = self.nodes.get_mut(node_id) {
            entry.set_mut(kind).remove(session_id);
            if entry.is_empty() {
                self.nodes.remove(node_id);
            }
        }
    }

    fn clear_slot(&mut self, session_id: &SessionId, kind: PresenceKind) {
        if let Some(presence) = self.sessions.get_mut(session_id) {
            *presence.slot_mut(kind) = None;
            if presence.is_empty() {
                self.sessions.remove(session_id);
            }
        }
    }

    fn notify(&mut self, change: PresenceChange) {
        for (_, listener) in &mut self.listeners {
            listener(&change);
        }
    }

    /// Verify that the node sets and the reverse index describe the same
    /// state. Returns a description of the first mismatch.
    pub fn check_consistency(&self) -> Result<(), String> {
        for (node_id, entry) in &self.nodes {
            if entry.is_empty() {
                return Err(format!("node {node_id} kept an empty entry"));
            }
            for kind in [PresenceKind::Hovering, PresenceKind::Editing] {
                for session_id in entry.set(kind) {
                    if self.presence_of(session_id, kind) != Some(node_id) {
                        return Err(format!(
                            "session {session_id} in {kind:?} set of {node_id} but not indexed there"
                        ));
                    }
                }
            }
        }

        for (session_id, presence) in &self.sessions {
            if presence.is_empty() {
                return Err(format!("session {session_id} kept an empty index entry"));
            }
            for kind in [PresenceKind::Hovering, PresenceKind::Editing] {
                if let Some(node_id) = presence.slot(kind) {
                    let present =
                        self.nodes.get(node_id).is_some_and(|entry| entry.set(kind).contains(session_id));
                    if !present {
                        return Err(format!(
                            "session {session_id} indexed on {node_id} ({kind:?}) but missing from the node set"
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}
