use std::{collections::HashMap, sync::Arc, time::Duration};

use flowpresence_common::types::{RoomId, SessionId, UserId};
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::access::RoomAccessStore;
use crate::config::ConnectionLimits;
use crate::rooms::RoomManager;

pub(crate) const HEARTBEAT_INTERVAL_MS: u32 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const MAX_FRAME_BYTES: u32 = 262_144;
/// Transport read limit. Frames between `MAX_FRAME_BYTES` and this are read
/// whole and refused with a close frame; larger ones fail at the transport.
pub(crate) const FRAME_CEILING_BYTES: usize = 4 * MAX_FRAME_BYTES as usize;

#[derive(Clone)]
pub(crate) struct PresenceRouterState {
    pub(crate) rooms: Arc<RoomManager>,
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) access: RoomAccessStore,
    pub(crate) limits: ConnectionLimits,
}

#[derive(Debug, Clone)]
struct SessionRecord {
    user_id: UserId,
    room_id: Option<RoomId>,
    connected_at: Instant,
}

/// Live WebSocket sessions and the room each one is in.
///
/// A session belongs to at most one room at a time.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, SessionRecord>>>,
}

/// What a closed session left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndedSession {
    pub user_id: UserId,
    pub room_id: Option<RoomId>,
    pub connected_for: Duration,
}

impl SessionRegistry {
    /// Allocate a fresh session id for a new connection, unless `user_id`
    /// already holds `max_per_user` sessions.
    pub async fn register(&self, user_id: UserId, max_per_user: usize) -> Option<SessionId> {
        let mut guard = self.sessions.write().await;
        let open = guard.values().filter(|record| record.user_id == user_id).count();
        if open >= max_per_user {
            return None;
        }
        let session_id = SessionId::new(Uuid::new_v4().to_string());
        guard.insert(session_id.clone(), SessionRecord { user_id, room_id: None, connected_at: Instant::now() });
        Some(session_id)
    }

    /// Drop a session, returning its owner and the room it was still in.
    pub async fn unregister(&self, session_id: &SessionId) -> Option<EndedSession> {
        let record = self.sessions.write().await.remove(session_id)?;
        Some(EndedSession {
            user_id: record.user_id,
            room_id: record.room_id,
            connected_for: record.connected_at.elapsed(),
        })
    }

    pub async fn room_for_session(&self, session_id: &SessionId) -> Option<RoomId> {
        self.sessions.read().await.get(session_id).and_then(|record| record.room_id.clone())
    }

    /// Record the session's current room. Returns the previous one.
    pub async fn set_room(&self, session_id: &SessionId, room_id: Option<RoomId>) -> Option<RoomId> {
        let mut guard = self.sessions.write().await;
        let record = guard.get_mut(session_id)?;
        std::mem::replace(&mut record.room_id, room_id)
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(registry: &SessionRegistry, user: &str) -> SessionId {
        registry.register(user.into(), 10).await.expect("under the connection cap")
    }

    #[tokio::test]
    async fn register_allocates_distinct_sessions() {
        let registry = SessionRegistry::default();
        let first = open(&registry, "alice").await;
        let second = open(&registry, "alice").await;

        assert_ne!(first, second);
        assert_eq!(registry.active_sessions().await, 2);
    }

    #[tokio::test]
    async fn register_enforces_cap_per_user_only() {
        let registry = SessionRegistry::default();
        let first = registry.register("alice".into(), 2).await.expect("first session");
        registry.register("alice".into(), 2).await.expect("second session");

        assert_eq!(registry.register("alice".into(), 2).await, None);
        assert!(registry.register("bob".into(), 2).await.is_some());

        registry.unregister(&first).await;
        assert!(registry.register("alice".into(), 2).await.is_some());
    }

    #[tokio::test]
    async fn set_room_tracks_membership_and_returns_previous() {
        let registry = SessionRegistry::default();
        let session = open(&registry, "bob").await;

        assert_eq!(registry.set_room(&session, Some("r1".into())).await, None);
        assert_eq!(registry.set_room(&session, Some("r2".into())).await, Some("r1".into()));
        assert_eq!(registry.room_for_session(&session).await, Some("r2".into()));
        assert_eq!(registry.set_room(&"unknown".into(), Some("r1".into())).await, None);
    }

    #[tokio::test]
    async fn unregister_returns_owner_and_current_room() {
        let registry = SessionRegistry::default();
        let session = open(&registry, "carol").await;
        registry.set_room(&session, Some("r1".into())).await;

        let ended = registry.unregister(&session).await.expect("session was registered");
        assert_eq!(ended.user_id, UserId::from("carol"));
        assert_eq!(ended.room_id, Some("r1".into()));
        assert_eq!(registry.active_sessions().await, 0);
        assert_eq!(registry.unregister(&session).await, None);
    }

    #[test]
    fn heartbeat_timeout_is_less_than_interval() {
        assert_eq!(HEARTBEAT_INTERVAL_MS, 15_000);
        assert_eq!(HEARTBEAT_TIMEOUT_MS, 10_000);
        assert!(HEARTBEAT_TIMEOUT_MS < u64::from(HEARTBEAT_INTERVAL_MS));
    }
}
