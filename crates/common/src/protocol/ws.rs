// WebSocket frames for the flow presence protocol.
//
// Every frame is a JSON object tagged by `type` with camelCase fields. The
// three core presence envelopes (`JOIN_CHAT_FLOW`, `LEAVE_CHAT_FLOW`,
// `NODE_PRESENCE_UPDATED`) travel client -> relay -> peers unchanged.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::{NodeId, RoomId, SessionId, UserId};

/// Node-level presence transition sent by a client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Enter,
    Leave,
    EditStart,
    EditEnd,
}

impl PresenceAction {
    /// Which presence set this action touches.
    pub const fn kind(self) -> PresenceKind {
        match self {
            Self::Enter | Self::Leave => PresenceKind::Hovering,
            Self::EditStart | Self::EditEnd => PresenceKind::Editing,
        }
    }

    /// True for `enter` / `edit_start`.
    pub const fn is_start(self) -> bool {
        matches!(self, Self::Enter | Self::EditStart)
    }

    /// The action that ends presence of the given kind.
    pub const fn ending(kind: PresenceKind) -> Self {
        match kind {
            PresenceKind::Hovering => Self::Leave,
            PresenceKind::Editing => Self::EditEnd,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Leave => "leave",
            Self::EditStart => "edit_start",
            Self::EditEnd => "edit_end",
        }
    }
}

/// The two independent presence sets kept per node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    Hovering,
    Editing,
}

/// Coarse activity status of a room member.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[default]
    Active,
    Idle,
    Away,
}

impl UserStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Away => "away",
        }
    }
}

/// One entry of the membership roster sent to a joiner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RosterMember {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub color: String,
    #[serde(default)]
    pub status: UserStatus,
}

/// All frames of the flow presence protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum WsMessage {
    /// Server -> Client: first frame on every connection.
    ConnectionEstablished { session_id: SessionId, user_id: UserId },

    /// Client -> Server, relayed to peers: join a room. The relay stamps
    /// `userId` on the copy it fans out; a client-supplied value is ignored.
    JoinChatFlow {
        room_id: RoomId,
        session_id: SessionId,
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
    },

    /// Client -> Server, relayed to peers (or synthesized on disconnect).
    LeaveChatFlow { room_id: RoomId, session_id: SessionId, timestamp: i64 },

    /// Client -> Server, relayed to peers: hover/edit transition on a node.
    NodePresenceUpdated {
        room_id: RoomId,
        session_id: SessionId,
        timestamp: i64,
        node_id: NodeId,
        action: PresenceAction,
    },

    /// Client -> Server: keep-alive carrying the client's activity status.
    UserHeartbeat {
        room_id: RoomId,
        session_id: SessionId,
        timestamp: i64,
        #[serde(default)]
        status: UserStatus,
    },

    /// Client -> Server, relayed to peers: change of display color.
    UserColorUpdated { room_id: RoomId, session_id: SessionId, timestamp: i64, color: String },

    /// Server -> joiner: join acknowledgement with the current membership.
    RoomRoster { room_id: RoomId, members: Vec<RosterMember> },

    /// Server -> Client: a member's activity status changed.
    UserStatusUpdated { room_id: RoomId, session_id: SessionId, status: UserStatus },

    /// Server -> Client: join was rejected.
    AuthzError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        message: String,
    },

    /// Server -> Client: transport-level error.
    Error { code: String, message: String, retryable: bool },
}

impl WsMessage {
    pub fn join(room_id: RoomId, session_id: SessionId, color: impl Into<String>) -> Self {
        Self::JoinChatFlow { room_id, session_id, timestamp: now_millis(), user_id: None, color: Some(color.into()) }
    }

    pub fn leave(room_id: RoomId, session_id: SessionId) -> Self {
        Self::LeaveChatFlow { room_id, session_id, timestamp: now_millis() }
    }

    pub fn node_presence(
        room_id: RoomId,
        session_id: SessionId,
        node_id: NodeId,
        action: PresenceAction,
    ) -> Self {
        Self::NodePresenceUpdated { room_id, session_id, timestamp: now_millis(), node_id, action }
    }

    pub fn heartbeat(room_id: RoomId, session_id: SessionId, status: UserStatus) -> Self {
        Self::UserHeartbeat { room_id, session_id, timestamp: now_millis(), status }
    }

    /// Room the frame refers to, if any.
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::JoinChatFlow { room_id, .. }
            | Self::LeaveChatFlow { room_id, .. }
            | Self::NodePresenceUpdated { room_id, .. }
            | Self::UserHeartbeat { room_id, .. }
            | Self::UserColorUpdated { room_id, .. }
            | Self::RoomRoster { room_id, .. }
            | Self::UserStatusUpdated { room_id, .. } => Some(room_id),
            Self::AuthzError { room_id, .. } => room_id.as_ref(),
            Self::ConnectionEstablished { .. } | Self::Error { .. } => None,
        }
    }

    /// Session the frame speaks for, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::ConnectionEstablished { session_id, .. }
            | Self::JoinChatFlow { session_id, .. }
            | Self::LeaveChatFlow { session_id, .. }
            | Self::NodePresenceUpdated { session_id, .. }
            | Self::UserHeartbeat { session_id, .. }
            | Self::UserColorUpdated { session_id, .. }
            | Self::UserStatusUpdated { session_id, .. } => Some(session_id),
            Self::RoomRoster { .. } | Self::AuthzError { .. } | Self::Error { .. } => None,
        }
    }

    /// Wire name of the frame type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "CONNECTION_ESTABLISHED",
            Self::JoinChatFlow { .. } => "JOIN_CHAT_FLOW",
            Self::LeaveChatFlow { .. } => "LEAVE_CHAT_FLOW",
            Self::NodePresenceUpdated { .. } => "NODE_PRESENCE_UPDATED",
            Self::UserHeartbeat { .. } => "USER_HEARTBEAT",
            Self::UserColorUpdated { .. } => "USER_COLOR_UPDATED",
            Self::RoomRoster { .. } => "ROOM_ROSTER",
            Self::UserStatusUpdated { .. } => "USER_STATUS_UPDATED",
            Self::AuthzError { .. } => "AUTHZ_ERROR",
            Self::Error { .. } => "ERROR",
        }
    }
}

pub fn decode_message(raw: &str) -> Result<WsMessage, serde_json::Error> {
    serde_json::from_str::<WsMessage>(raw)
}

pub fn encode_message(message: &WsMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Milliseconds since the Unix epoch, the timestamp unit of every envelope.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_maps_to_presence_kind() {
        assert_eq!(PresenceAction::Enter.kind(), PresenceKind::Hovering);
        assert_eq!(PresenceAction::Leave.kind(), PresenceKind::Hovering);
        assert_eq!(PresenceAction::EditStart.kind(), PresenceKind::Editing);
        assert_eq!(PresenceAction::EditEnd.kind(), PresenceKind::Editing);
        assert!(PresenceAction::Enter.is_start());
        assert!(!PresenceAction::EditEnd.is_start());
        assert_eq!(PresenceAction::ending(PresenceKind::Editing), PresenceAction::EditEnd);
    }

    #[test]
    fn node_presence_frame_uses_camel_case_fields() {
        let message = WsMessage::NodePresenceUpdated {
            room_id: "flow-1".into(),
            session_id: "sess-1".into(),
            timestamp: 1_700_000_000_000,
            node_id: "n7".into(),
            action: PresenceAction::EditStart,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "NODE_PRESENCE_UPDATED",
                "roomId": "flow-1",
                "sessionId": "sess-1",
                "timestamp": 1_700_000_000_000i64,
                "nodeId": "n7",
                "action": "edit_start"
            })
        );
    }

    #[test]
    fn join_without_color_decodes() {
        let raw = r#"{"type":"JOIN_CHAT_FLOW","roomId":"r","sessionId":"s","timestamp":1}"#;
        let decoded = decode_message(raw).unwrap();
        assert!(matches!(decoded, WsMessage::JoinChatFlow { color: None, .. }));
    }

    #[test]
    fn unknown_type_fails_to_decode() {
        let raw = r#"{"type":"CURSOR_MOVED","roomId":"r","sessionId":"s","timestamp":1}"#;
        assert!(decode_message(raw).is_err());
    }

    #[test]
    fn unknown_action_fails_to_decode() {
        let raw = r#"{"type":"NODE_PRESENCE_UPDATED","roomId":"r","sessionId":"s","timestamp":1,"nodeId":"n","action":"teleport"}"#;
        assert!(decode_message(raw).is_err());
    }

    #[test]
    fn heartbeat_status_defaults_to_active() {
        let raw = r#"{"type":"USER_HEARTBEAT","roomId":"r","sessionId":"s","timestamp":1}"#;
        match decode_message(raw).unwrap() {
            WsMessage::UserHeartbeat { status, .. } => assert_eq!(status, UserStatus::Active),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn type_name_matches_serialized_tag() {
        let frames = [
            WsMessage::join("r".into(), "s".into(), "#fff"),
            WsMessage::leave("r".into(), "s".into()),
            WsMessage::heartbeat("r".into(), "s".into(), UserStatus::Idle),
            WsMessage::AuthzError { room_id: None, message: "denied".into() },
        ];
        for frame in frames {
            let value = serde_json::to_value(&frame).unwrap();
            assert_eq!(value["type"], frame.type_name());
        }
    }

    #[test]
    fn accessors_expose_room_and_session() {
        let frame = WsMessage::leave("flow-9".into(), "sess-3".into());
        assert_eq!(frame.room_id().map(RoomId::as_str), Some("flow-9"));
        assert_eq!(frame.session_id().map(SessionId::as_str), Some("sess-3"));

        let error = WsMessage::Error { code: "X".into(), message: "y".into(), retryable: false };
        assert!(error.room_id().is_none());
        assert!(error.session_id().is_none());
    }
}
