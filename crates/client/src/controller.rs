// Join/leave lifecycle for exactly one room per client.
//
// The controller owns the presence store for its connection. Local actions
// are sent to the relay and applied to the store the same way remote frames
// are; the store never distinguishes the local session from peers.

use tracing::{debug, info, warn};

use flowpresence_common::color::{color_for_user, sanitize_color};
use flowpresence_common::protocol::ws::{now_millis, PresenceAction, PresenceKind, UserStatus, WsMessage};
use flowpresence_common::types::{NodeId, RoomId, SessionId, UserId};

use crate::connection::{Connection, ConnectionEvent};
use crate::error::PresenceError;
use crate::store::{NodePresence, PeerInfo, PresenceSlot, PresenceStore};

const FALLBACK_PEER_COLOR: &str = "#9ca3af";

/// Room membership as seen by this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinState {
    /// Not in a room.
    Idle,
    /// `JOIN_CHAT_FLOW` sent; waiting for the roster.
    Joining { room_id: RoomId },
    /// The relay acknowledged the join.
    Joined { room_id: RoomId },
}

impl JoinState {
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::Idle => None,
            Self::Joining { room_id } | Self::Joined { room_id } => Some(room_id),
        }
    }
}

/// Result of a [`JoinLeaveController::join_room`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// A join request was sent.
    Requested,
    /// A join is already pending; nothing was sent.
    Pending,
    /// Already a member of the requested room; nothing was sent.
    AlreadyJoined,
}

/// Lifecycle notifications for the surrounding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    Connected { session_id: SessionId },
    Joined { room_id: RoomId },
    /// The relay rejected the join. The controller does not retry.
    AuthorizationFailed { room_id: Option<RoomId>, reason: String },
    /// The connection dropped. `rejoin` is the room the client was in; the
    /// application decides whether to join it again once reconnected.
    Disconnected { rejoin: Option<RoomId> },
}

pub struct JoinLeaveController<C: Connection> {
    connection: C,
    store: PresenceStore,
    session_id: Option<SessionId>,
    state: JoinState,
    rejoin_room: Option<RoomId>,
    last_failure: Option<String>,
}

impl<C: Connection> JoinLeaveController<C> {
    pub fn new(connection: C) -> Self {
        Self::with_store(connection, PresenceStore::new())
    }

    /// Use a pre-built store, e.g. one with listeners already registered.
    pub fn with_store(connection: C, store: PresenceStore) -> Self {
        Self {
            connection,
            store,
            session_id: None,
            state: JoinState::Idle,
            rejoin_room: None,
            last_failure: None,
        }
    }

    pub fn state(&self) -> &JoinState {
        &self.state
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn store(&self) -> &PresenceStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut PresenceStore {
        &mut self.store
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    pub fn node_presence(&self, node_id: &NodeId) -> NodePresence<'_> {
        self.store.node_presence(node_id)
    }

    pub fn user_presence(&self, session_id: &SessionId) -> Option<PresenceSlot> {
        self.store.user_presence(session_id)
    }

    /// Room the client was in when the connection last dropped.
    pub fn rejoin_target(&self) -> Option<&RoomId> {
        self.rejoin_room.as_ref()
    }

    /// Reason of the most recent rejected join, cleared by the next join.
    pub fn last_authorization_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    // ── Commands ────────────────────────────────────────────────────

    pub fn join_room(&mut self, room_id: RoomId, user_id: &UserId) -> Result<JoinOutcome, PresenceError> {
        let session_id = self.session_id.clone().ok_or(PresenceError::NotConnected)?;

        match &self.state {
            JoinState::Joined { room_id: current } if *current == room_id => {
                return Ok(JoinOutcome::AlreadyJoined);
            }
            JoinState::Joined { room_id: current } => {
                return Err(PresenceError::AlreadyJoined(current.clone()));
            }
            JoinState::Joining { .. } => return Ok(JoinOutcome::Pending),
            JoinState::Idle => {}
        }

        let color = color_for_user(user_id);
        self.connection.send(&WsMessage::join(room_id.clone(), session_id.clone(), color))?;

        info!(room_id = %room_id, session_id = %session_id, user_id = %user_id, "joining room");
        self.state = JoinState::Joining { room_id };
        self.rejoin_room = None;
        self.last_failure = None;
        Ok(JoinOutcome::Requested)
    }

    /// Leave the current room. Local presence is cleared even when the
    /// `LEAVE_CHAT_FLOW` frame cannot be sent.
    pub fn leave_room(&mut self) -> Result<(), PresenceError> {
        let Some(room_id) = self.state.room_id().cloned() else {
            return Err(PresenceError::NotJoined);
        };

        if let Some(session_id) = self.session_id.clone() {
            if let Err(error) = self.connection.send(&WsMessage::leave(room_id.clone(), session_id)) {
                warn!(room_id = %room_id, error = %error, "failed to send leave; clearing local presence anyway");
            }
        }

        info!(room_id = %room_id, "left room");
        self.reset_membership();
        Ok(())
    }

    /// Announce a hover/edit transition on a node.
    ///
    /// Entering a node while holding the same kind of presence elsewhere
    /// first sends the matching leave for the previous node.
    pub fn send_node_presence(&mut self, node_id: NodeId, action: PresenceAction) -> Result<(), PresenceError> {
        let (room_id, session_id) = self.joined_context()?;
        let kind = action.kind();

        if action.is_start() {
            let previous = self.store.presence_of(&session_id, kind).cloned();
            match previous {
                Some(previous) if previous == node_id => {}
                Some(previous) => {
                    let leave = WsMessage::node_presence(
                        room_id.clone(),
                        session_id.clone(),
                        previous.clone(),
                        PresenceAction::ending(kind),
                    );
                    self.connection.send(&leave)?;
                    self.store.remove_node_presence(&previous, &session_id, kind);
                }
                None => {}
            }
        }

        let frame = WsMessage::node_presence(room_id, session_id.clone(), node_id.clone(), action);
        self.connection.send(&frame)?;
        apply_node_action(&mut self.store, node_id, session_id, action);
        Ok(())
    }

    /// Report this client's activity status to the room.
    pub fn send_heartbeat(&mut self, status: UserStatus) -> Result<(), PresenceError> {
        let (room_id, session_id) = self.joined_context()?;
        self.connection.send(&WsMessage::heartbeat(room_id, session_id.clone(), status))?;
        self.store.set_peer_status(&session_id, status);
        Ok(())
    }

    /// Override the palette color for this session.
    pub fn send_color(&mut self, color: &str) -> Result<(), PresenceError> {
        let (room_id, session_id) = self.joined_context()?;
        let color = sanitize_color(Some(color), FALLBACK_PEER_COLOR);
        self.connection.send(&WsMessage::UserColorUpdated {
            room_id,
            session_id: session_id.clone(),
            timestamp: now_millis(),
            color: color.clone(),
        })?;
        self.update_peer_color(session_id, color);
        Ok(())
    }

    // ── Connection layer events ─────────────────────────────────────

    pub fn handle_event(&mut self, event: ConnectionEvent) -> Option<ControllerEvent> {
        match event {
            ConnectionEvent::Established { session_id, user_id } => {
                if self.state != JoinState::Idle {
                    self.rejoin_room = self.state.room_id().cloned();
                    self.reset_membership();
                }
                debug!(session_id = %session_id, user_id = %user_id, "connection established");
                self.session_id = Some(session_id.clone());
                Some(ControllerEvent::Connected { session_id })
            }
            ConnectionEvent::Lost { reason } => {
                let rejoin = self.state.room_id().cloned();
                info!(reason = %reason, rejoin = ?rejoin, "connection lost; presence cleared");
                self.reset_membership();
                self.session_id = None;
                self.rejoin_room = rejoin.clone();
                Some(ControllerEvent::Disconnected { rejoin })
            }
            ConnectionEvent::AuthorizationFailed { room_id, reason } => {
                let current = self.state.room_id()?.clone();
                if room_id.as_ref().is_some_and(|room_id| *room_id != current) {
                    debug!(room_id = ?room_id, "ignoring authorization failure for another room");
                    return None;
                }
                warn!(room_id = %current, reason = %reason, "join rejected");
                self.reset_membership();
                self.last_failure = Some(reason.clone());
                Some(ControllerEvent::AuthorizationFailed { room_id: Some(current), reason })
            }
            ConnectionEvent::Received(frame) => self.apply_remote(frame),
        }
    }

    fn apply_remote(&mut self, frame: WsMessage) -> Option<ControllerEvent> {
        let current = self.state.room_id()?;
        if frame.room_id() != Some(current) {
            debug!(frame = frame.type_name(), "dropping frame for another room");
            return None;
        }

        match frame {
            WsMessage::RoomRoster { room_id, members } => {
                for member in members {
                    self.store.upsert_peer(
                        member.session_id,
                        PeerInfo { user_id: Some(member.user_id), color: member.color, status: member.status },
                    );
                }
                if matches!(self.state, JoinState::Joining { .. }) {
                    info!(room_id = %room_id, "joined room");
                    self.state = JoinState::Joined { room_id: room_id.clone() };
                    return Some(ControllerEvent::Joined { room_id });
                }
                None
            }
            WsMessage::JoinChatFlow { session_id, user_id, color, .. } => {
                let color = sanitize_color(color.as_deref(), FALLBACK_PEER_COLOR);
                self.store.upsert_peer(session_id, PeerInfo { user_id, color, status: UserStatus::Active });
                None
            }
            WsMessage::LeaveChatFlow { session_id, .. } => {
                self.store.remove_user_presence(&session_id);
                self.store.remove_peer(&session_id);
                None
            }
            WsMessage::NodePresenceUpdated { session_id, node_id, action, .. } => {
                apply_node_action(&mut self.store, node_id, session_id, action);
                None
            }
            WsMessage::UserColorUpdated { session_id, color, .. } => {
                let color = sanitize_color(Some(&color), FALLBACK_PEER_COLOR);
                self.update_peer_color(session_id, color);
                None
            }
            WsMessage::UserStatusUpdated { session_id, status, .. } => {
                self.store.set_peer_status(&session_id, status);
                None
            }
            other => {
                debug!(frame = other.type_name(), "ignoring frame");
                None
            }
        }
    }

    fn joined_context(&self) -> Result<(RoomId, SessionId), PresenceError> {
        let JoinState::Joined { room_id } = &self.state else {
            return Err(PresenceError::NotJoined);
        };
        let session_id = self.session_id.clone().ok_or(PresenceError::NotConnected)?;
        Ok((room_id.clone(), session_id))
    }

    fn update_peer_color(&mut self, session_id: SessionId, color: String) {
        let (user_id, status) = self
            .store
            .peer(&session_id)
            .map_or((None, UserStatus::Active), |peer| (peer.user_id.clone(), peer.status));
        self.store.upsert_peer(session_id, PeerInfo { user_id, color, status });
    }

    fn reset_membership(&mut self) {
        self.state = JoinState::Idle;
        self.store.clear_all();
    }
}

fn apply_node_action(store: &mut PresenceStore, node_id: NodeId, session_id: SessionId, action: PresenceAction) {
    let kind: PresenceKind = action.kind();
    if action.is_start() {
        store.add_node_presence(node_id, session_id, kind);
    } else {
        store.remove_node_presence(&node_id, &session_id, kind);
    }
}
