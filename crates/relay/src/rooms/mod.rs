// Room Manager: authoritative room membership and event fan-out.
//
// The relay keeps membership only. Node-level presence lives on the clients
// and is rebuilt from the relayed event stream.
//
// Locking: the room map lock is never held while waiting on a room lock.
// All membership changes and fan-out for a room happen under that room's
// mutex, so events from one session reach peers in the order they were
// relayed. A room emptied by a leave is marked closed before it is removed
// from the map; a join that finds a closed room retries on a fresh one.

use std::{collections::HashMap, sync::Arc, time::Duration};

use flowpresence_common::color::{color_for_user, sanitize_color};
use flowpresence_common::protocol::ws::{RosterMember, UserStatus, WsMessage};
use flowpresence_common::types::{RoomId, SessionId, UserId};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ActivityConfig;

mod outbound;

pub use outbound::{Delivery, Outbound, OutboundReceiver, OUTBOUND_QUEUE_CAPACITY};

/// A `JOIN_CHAT_FLOW` as received from a session.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub room_id: RoomId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub timestamp: i64,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Added to the room; `peers` other members were notified.
    Joined { peers: usize },
    /// The session was already a member. Nothing was broadcast.
    AlreadyMember,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left { room_closed: bool },
    NotMember,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Forwarded to `recipients` other members.
    Relayed { recipients: usize },
    /// The sender is not a member of the room; the event was dropped.
    NotMember,
}

#[derive(Debug)]
struct Member {
    user_id: UserId,
    color: String,
    status: UserStatus,
    last_activity: Instant,
    outbound: Outbound,
}

impl Member {
    fn roster_entry(&self, session_id: &SessionId) -> RosterMember {
        RosterMember {
            session_id: session_id.clone(),
            user_id: self.user_id.clone(),
            color: self.color.clone(),
            status: self.status,
        }
    }
}

#[derive(Debug, Default)]
struct Room {
    members: HashMap<SessionId, Member>,
    closed: bool,
}

impl Room {
    /// Send to every member except `exclude`. Returns the number of members
    /// whose outbound queue accepted the frame.
    fn broadcast(&self, message: &WsMessage, exclude: Option<&SessionId>) -> usize {
        let mut sent = 0;
        for (session_id, member) in &self.members {
            if Some(session_id) == exclude {
                continue;
            }
            if member.outbound.send(message.clone()) {
                sent += 1;
            } else {
                debug!(session_id = %session_id, "outbound queue closed or full; skipping member");
            }
        }
        sent
    }

    fn roster(&self) -> Vec<RosterMember> {
        let mut roster: Vec<RosterMember> =
            self.members.iter().map(|(session_id, member)| member.roster_entry(session_id)).collect();
        roster.sort_by(|left, right| left.session_id.cmp(&right.session_id));
        roster
    }

    /// Record activity and restore `active` if the member had been demoted.
    fn touch(&mut self, room_id: &RoomId, session_id: &SessionId, now: Instant) -> bool {
        let Some(member) = self.members.get_mut(session_id) else {
            return false;
        };
        member.last_activity = now;
        if member.status != UserStatus::Active {
            member.status = UserStatus::Active;
            let update = WsMessage::UserStatusUpdated {
                room_id: room_id.clone(),
                session_id: session_id.clone(),
                status: UserStatus::Active,
            };
            self.broadcast(&update, None);
        }
        true
    }
}

#[derive(Debug, Default)]
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to a room.
    ///
    /// Peers receive the `JOIN_CHAT_FLOW` with the sanitized color. The
    /// joiner receives a `ROOM_ROSTER` on its own queue, also for a
    /// duplicate join, and no node-presence snapshot. A duplicate join
    /// replaces the stored queue with the one supplied.
    pub async fn join(&self, request: JoinRequest, outbound: Outbound) -> JoinOutcome {
        let color = sanitize_color(request.color.as_deref(), color_for_user(&request.user_id));

        loop {
            let room = self.room_or_insert(&request.room_id).await;
            let mut guard = room.lock().await;
            if guard.closed {
                drop(guard);
                self.discard_if_current(&request.room_id, &room).await;
                continue;
            }

            if let Some(member) = guard.members.get_mut(&request.session_id) {
                member.outbound = outbound;
                send_roster(&guard, &request.room_id, &request.session_id);
                debug!(room_id = %request.room_id, session_id = %request.session_id, "duplicate join ignored");
                return JoinOutcome::AlreadyMember;
            }

            guard.members.insert(
                request.session_id.clone(),
                Member {
                    user_id: request.user_id.clone(),
                    color: color.clone(),
                    status: UserStatus::Active,
                    last_activity: Instant::now(),
                    outbound,
                },
            );

            let announce = WsMessage::JoinChatFlow {
                room_id: request.room_id.clone(),
                session_id: request.session_id.clone(),
                timestamp: request.timestamp,
                user_id: Some(request.user_id.clone()),
                color: Some(color),
            };
            let peers = guard.broadcast(&announce, Some(&request.session_id));

            send_roster(&guard, &request.room_id, &request.session_id);

            info!(
                room_id = %request.room_id,
                session_id = %request.session_id,
                user_id = %request.user_id,
                members = guard.members.len(),
                "session joined room"
            );
            return JoinOutcome::Joined { peers };
        }
    }

    /// Remove a session and tell the remaining members. The room is deleted
    /// once its last member leaves.
    pub async fn leave(&self, room_id: &RoomId, session_id: &SessionId, timestamp: i64) -> LeaveOutcome {
        let Some(room) = self.room(room_id).await else {
            return LeaveOutcome::NotMember;
        };

        let room_closed = {
            let mut guard = room.lock().await;
            if guard.members.remove(session_id).is_none() {
                return LeaveOutcome::NotMember;
            }
            let leave = WsMessage::LeaveChatFlow {
                room_id: room_id.clone(),
                session_id: session_id.clone(),
                timestamp,
            };
            guard.broadcast(&leave, None);
            if guard.members.is_empty() {
                guard.closed = true;
            }
            guard.closed
        };

        if room_closed {
            self.discard_if_current(room_id, &room).await;
            debug!(room_id = %room_id, "room closed");
        }
        info!(room_id = %room_id, session_id = %session_id, "session left room");
        LeaveOutcome::Left { room_closed }
    }

    /// Forward a session's event verbatim to every other member.
    pub async fn relay(&self, room_id: &RoomId, session_id: &SessionId, event: WsMessage) -> RelayOutcome {
        let Some(room) = self.room(room_id).await else {
            return RelayOutcome::NotMember;
        };
        let mut guard = room.lock().await;
        if !guard.touch(room_id, session_id, Instant::now()) {
            return RelayOutcome::NotMember;
        }
        let recipients = guard.broadcast(&event, Some(session_id));
        RelayOutcome::Relayed { recipients }
    }

    /// Record a heartbeat. A status change is broadcast to the whole room.
    /// Returns `false` when the session is not a member.
    pub async fn heartbeat(&self, room_id: &RoomId, session_id: &SessionId, status: UserStatus) -> bool {
        let Some(room) = self.room(room_id).await else {
            return false;
        };
        let mut guard = room.lock().await;
        let Some(member) = guard.members.get_mut(session_id) else {
            return false;
        };
        member.last_activity = Instant::now();
        if member.status != status {
            member.status = status;
            let update =
                WsMessage::UserStatusUpdated { room_id: room_id.clone(), session_id: session_id.clone(), status };
            guard.broadcast(&update, None);
        }
        true
    }

    /// Change a member's color and relay the sanitized value to peers.
    pub async fn update_color(
        &self,
        room_id: &RoomId,
        session_id: &SessionId,
        timestamp: i64,
        color: &str,
    ) -> RelayOutcome {
        let Some(room) = self.room(room_id).await else {
            return RelayOutcome::NotMember;
        };
        let mut guard = room.lock().await;
        if !guard.touch(room_id, session_id, Instant::now()) {
            return RelayOutcome::NotMember;
        }
        let Some(member) = guard.members.get_mut(session_id) else {
            return RelayOutcome::NotMember;
        };
        member.color = sanitize_color(Some(color), color_for_user(&member.user_id));
        let update = WsMessage::UserColorUpdated {
            room_id: room_id.clone(),
            session_id: session_id.clone(),
            timestamp,
            color: member.color.clone(),
        };
        let recipients = guard.broadcast(&update, Some(session_id));
        RelayOutcome::Relayed { recipients }
    }

    /// Demote members whose last activity is older than the configured
    /// thresholds. Members are never promoted here. Returns how many
    /// statuses changed.
    pub async fn sweep_idle(&self, now: Instant, activity: ActivityConfig) -> usize {
        let rooms: Vec<(RoomId, Arc<Mutex<Room>>)> =
            self.rooms.read().await.iter().map(|(room_id, room)| (room_id.clone(), Arc::clone(room))).collect();

        let mut changed = 0;
        for (room_id, room) in rooms {
            let mut guard = room.lock().await;
            let mut updates = Vec::new();
            for (session_id, member) in guard.members.iter_mut() {
                let target = status_for_inactivity(now.saturating_duration_since(member.last_activity), activity);
                if rank(target) > rank(member.status) {
                    member.status = target;
                    updates.push(WsMessage::UserStatusUpdated {
                        room_id: room_id.clone(),
                        session_id: session_id.clone(),
                        status: target,
                    });
                }
            }
            changed += updates.len();
            for update in &updates {
                guard.broadcast(update, None);
            }
        }
        changed
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn member_count(&self, room_id: &RoomId) -> usize {
        match self.room(room_id).await {
            Some(room) => room.lock().await.members.len(),
            None => 0,
        }
    }

    pub async fn is_member(&self, room_id: &RoomId, session_id: &SessionId) -> bool {
        match self.room(room_id).await {
            Some(room) => room.lock().await.members.contains_key(session_id),
            None => false,
        }
    }

    pub async fn roster(&self, room_id: &RoomId) -> Vec<RosterMember> {
        match self.room(room_id).await {
            Some(room) => room.lock().await.roster(),
            None => Vec::new(),
        }
    }

    async fn room(&self, room_id: &RoomId) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    async fn room_or_insert(&self, room_id: &RoomId) -> Arc<Mutex<Room>> {
        if let Some(room) = self.room(room_id).await {
            return room;
        }
        Arc::clone(self.rooms.write().await.entry(room_id.clone()).or_default())
    }

    async fn discard_if_current(&self, room_id: &RoomId, room: &Arc<Mutex<Room>>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room_id).is_some_and(|current| Arc::ptr_eq(current, room)) {
            rooms.remove(room_id);
        }
    }
}

fn send_roster(room: &Room, room_id: &RoomId, session_id: &SessionId) {
    if let Some(member) = room.members.get(session_id) {
        let roster = WsMessage::RoomRoster { room_id: room_id.clone(), members: room.roster() };
        member.outbound.send(roster);
    }
}

fn status_for_inactivity(inactive_for: Duration, activity: ActivityConfig) -> UserStatus {
    if inactive_for >= activity.away_after {
        UserStatus::Away
    } else if inactive_for >= activity.idle_after {
        UserStatus::Idle
    } else {
        UserStatus::Active
    }
}

fn rank(status: UserStatus) -> u8 {
    match status {
        UserStatus::Active => 0,
        UserStatus::Idle => 1,
        UserStatus::Away => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpresence_common::protocol::ws::PresenceAction;

    type Inbox = OutboundReceiver;

    fn channel() -> (Outbound, Inbox) {
        Outbound::channel(OUTBOUND_QUEUE_CAPACITY)
    }

    fn request(room: &str, session: &str, user: &str, color: Option<&str>) -> JoinRequest {
        JoinRequest {
            room_id: room.into(),
            session_id: session.into(),
            user_id: user.into(),
            timestamp: 1,
            color: color.map(str::to_owned),
        }
    }

    async fn join(manager: &RoomManager, room: &str, session: &str) -> Inbox {
        let (sender, receiver) = channel();
        manager.join(request(room, session, session, Some("#e06c75")), sender).await;
        receiver
    }

    fn drain(inbox: &mut Inbox) -> Vec<WsMessage> {
        let mut frames = Vec::new();
        while let Some(frame) = inbox.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn join_broadcasts_to_peers_and_sends_roster_to_joiner() {
        let manager = RoomManager::new();
        let mut first = join(&manager, "r1", "s1").await;
        drain(&mut first);

        let (sender, mut second) = channel();
        let outcome = manager.join(request("r1", "s2", "bob", Some("#61AFEF")), sender).await;
        assert_eq!(outcome, JoinOutcome::Joined { peers: 1 });

        match &drain(&mut first)[..] {
            [WsMessage::JoinChatFlow { session_id, color, .. }] => {
                assert_eq!(session_id.as_str(), "s2");
                assert_eq!(color.as_deref(), Some("#61afef"));
            }
            other => panic!("unexpected frames {other:?}"),
        }
        match &drain(&mut second)[..] {
            [WsMessage::RoomRoster { members, .. }] => {
                let ids: Vec<&str> = members.iter().map(|member| member.session_id.as_str()).collect();
                assert_eq!(ids, vec!["s1", "s2"]);
            }
            other => panic!("unexpected frames {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_join_color_falls_back_to_assigned_color() {
        let manager = RoomManager::new();
        let (sender, mut inbox) = channel();
        manager.join(request("r1", "s1", "alice", Some("red; background: url(x)")), sender).await;

        let roster = manager.roster(&"r1".into()).await;
        assert_eq!(roster[0].color, color_for_user(&"alice".into()));
        drain(&mut inbox);
    }

    #[tokio::test]
    async fn duplicate_join_is_not_rebroadcast() {
        let manager = RoomManager::new();
        let mut first = join(&manager, "r1", "s1").await;
        let mut second = join(&manager, "r1", "s2").await;
        drain(&mut first);
        drain(&mut second);

        let (sender, mut again) = channel();
        let outcome = manager.join(request("r1", "s2", "s2", None), sender).await;

        assert_eq!(outcome, JoinOutcome::AlreadyMember);
        assert!(drain(&mut first).is_empty());
        assert!(matches!(&drain(&mut again)[..], [WsMessage::RoomRoster { .. }]));
        assert_eq!(manager.member_count(&"r1".into()).await, 2);

        manager.leave(&"r1".into(), &"s1".into(), 2).await;
        assert!(matches!(&drain(&mut again)[..], [WsMessage::LeaveChatFlow { .. }]));
        assert!(drain(&mut second).is_empty());
    }

    #[tokio::test]
    async fn full_member_queue_is_skipped_and_flagged() {
        let manager = RoomManager::new();
        let (stalled_sender, mut stalled) = Outbound::channel(1);
        manager.join(request("r1", "slow", "slow", None), stalled_sender).await;
        let mut fast = join(&manager, "r1", "fast").await;
        drain(&mut fast);

        let event = WsMessage::node_presence("r1".into(), "fast".into(), "n1".into(), PresenceAction::Enter);
        let outcome = manager.relay(&"r1".into(), &"fast".into(), event).await;

        assert_eq!(outcome, RelayOutcome::Relayed { recipients: 0 });
        assert_eq!(stalled.next().await, Delivery::Overflowed);
        assert!(matches!(stalled.try_recv(), Some(WsMessage::RoomRoster { .. })));
    }

    #[tokio::test]
    async fn relay_forwards_verbatim_to_others_only() {
        let manager = RoomManager::new();
        let mut first = join(&manager, "r1", "s1").await;
        let mut second = join(&manager, "r1", "s2").await;
        let mut third = join(&manager, "r1", "s3").await;
        drain(&mut first);
        drain(&mut second);
        drain(&mut third);

        let event = WsMessage::node_presence("r1".into(), "s1".into(), "n7".into(), PresenceAction::EditStart);
        let outcome = manager.relay(&"r1".into(), &"s1".into(), event.clone()).await;

        assert_eq!(outcome, RelayOutcome::Relayed { recipients: 2 });
        assert!(drain(&mut first).is_empty());
        assert_eq!(drain(&mut second), vec![event.clone()]);
        assert_eq!(drain(&mut third), vec![event]);
    }

    #[tokio::test]
    async fn relay_from_non_member_is_dropped() {
        let manager = RoomManager::new();
        let mut first = join(&manager, "r1", "s1").await;
        drain(&mut first);

        let event = WsMessage::node_presence("r1".into(), "ghost".into(), "n1".into(), PresenceAction::Enter);
        assert_eq!(manager.relay(&"r1".into(), &"ghost".into(), event.clone()).await, RelayOutcome::NotMember);
        assert_eq!(manager.relay(&"nowhere".into(), &"s1".into(), event).await, RelayOutcome::NotMember);
        assert!(drain(&mut first).is_empty());
    }

    #[tokio::test]
    async fn leave_notifies_remaining_and_deletes_empty_room() {
        let manager = RoomManager::new();
        let mut first = join(&manager, "r1", "s1").await;
        let _second = join(&manager, "r1", "s2").await;
        drain(&mut first);

        assert_eq!(manager.leave(&"r1".into(), &"s2".into(), 5).await, LeaveOutcome::Left { room_closed: false });
        assert!(matches!(
            &drain(&mut first)[..],
            [WsMessage::LeaveChatFlow { session_id, timestamp: 5, .. }] if session_id.as_str() == "s2"
        ));

        assert_eq!(manager.leave(&"r1".into(), &"s1".into(), 6).await, LeaveOutcome::Left { room_closed: true });
        assert_eq!(manager.room_count().await, 0);
        assert_eq!(manager.leave(&"r1".into(), &"s1".into(), 7).await, LeaveOutcome::NotMember);
    }

    #[tokio::test]
    async fn room_is_recreated_after_gc() {
        let manager = RoomManager::new();
        let _first = join(&manager, "r1", "s1").await;
        manager.leave(&"r1".into(), &"s1".into(), 1).await;
        let _again = join(&manager, "r1", "s2").await;

        assert_eq!(manager.room_count().await, 1);
        assert_eq!(manager.member_count(&"r1".into()).await, 1);
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let manager = RoomManager::new();
        let mut first = join(&manager, "r1", "s1").await;
        let mut second = join(&manager, "r2", "s2").await;
        drain(&mut first);
        drain(&mut second);

        let event = WsMessage::node_presence("r1".into(), "s1".into(), "n1".into(), PresenceAction::Enter);
        assert_eq!(manager.relay(&"r1".into(), &"s1".into(), event).await, RelayOutcome::Relayed { recipients: 0 });
        assert!(drain(&mut second).is_empty());
    }

    #[tokio::test]
    async fn heartbeat_broadcasts_only_status_changes() {
        let manager = RoomManager::new();
        let mut first = join(&manager, "r1", "s1").await;
        let mut second = join(&manager, "r1", "s2").await;
        drain(&mut first);
        drain(&mut second);

        assert!(manager.heartbeat(&"r1".into(), &"s2".into(), UserStatus::Active).await);
        assert!(drain(&mut first).is_empty());

        assert!(manager.heartbeat(&"r1".into(), &"s2".into(), UserStatus::Idle).await);
        let expected = WsMessage::UserStatusUpdated {
            room_id: "r1".into(),
            session_id: "s2".into(),
            status: UserStatus::Idle,
        };
        assert_eq!(drain(&mut first), vec![expected.clone()]);
        assert_eq!(drain(&mut second), vec![expected]);
        assert!(!manager.heartbeat(&"r1".into(), &"ghost".into(), UserStatus::Idle).await);
    }

    #[tokio::test]
    async fn color_update_is_sanitized_and_relayed() {
        let manager = RoomManager::new();
        let mut first = join(&manager, "r1", "s1").await;
        let mut second = join(&manager, "r1", "s2").await;
        drain(&mut first);
        drain(&mut second);

        let outcome = manager.update_color(&"r1".into(), &"s2".into(), 9, "#ABC").await;
        assert_eq!(outcome, RelayOutcome::Relayed { recipients: 1 });
        assert!(matches!(
            &drain(&mut first)[..],
            [WsMessage::UserColorUpdated { color, timestamp: 9, .. }] if color == "#abc"
        ));
        assert!(drain(&mut second).is_empty());

        manager.update_color(&"r1".into(), &"s2".into(), 10, "javascript:alert(1)").await;
        let roster = manager.roster(&"r1".into()).await;
        let member = roster.iter().find(|member| member.session_id.as_str() == "s2").unwrap();
        assert_eq!(member.color, color_for_user(&"s2".into()));
    }

    #[tokio::test]
    async fn sweep_demotes_to_idle_then_away() {
        let manager = RoomManager::new();
        let mut first = join(&manager, "r1", "s1").await;
        drain(&mut first);
        let activity = ActivityConfig::default();

        let start = Instant::now();
        assert_eq!(manager.sweep_idle(start + Duration::from_secs(30), activity).await, 0);

        assert_eq!(manager.sweep_idle(start + Duration::from_secs(61), activity).await, 1);
        assert!(matches!(&drain(&mut first)[..], [WsMessage::UserStatusUpdated { status: UserStatus::Idle, .. }]));

        assert_eq!(manager.sweep_idle(start + Duration::from_secs(90), activity).await, 0);
        assert_eq!(manager.sweep_idle(start + Duration::from_secs(301), activity).await, 1);
        assert_eq!(manager.roster(&"r1".into()).await[0].status, UserStatus::Away);
    }

    #[tokio::test]
    async fn activity_restores_active_status() {
        let manager = RoomManager::new();
        let mut first = join(&manager, "r1", "s1").await;
        let mut second = join(&manager, "r1", "s2").await;
        manager.sweep_idle(Instant::now() + Duration::from_secs(400), ActivityConfig::default()).await;
        drain(&mut first);
        drain(&mut second);

        let event = WsMessage::node_presence("r1".into(), "s1".into(), "n1".into(), PresenceAction::Enter);
        manager.relay(&"r1".into(), &"s1".into(), event.clone()).await;

        let frames = drain(&mut second);
        assert!(matches!(
            &frames[..],
            [WsMessage::UserStatusUpdated { status: UserStatus::Active, .. }, relayed] if *relayed == event
        ));
    }

    #[tokio::test]
    async fn concurrent_joins_and_leaves_leave_no_empty_rooms() {
        let manager = Arc::new(RoomManager::new());
        let mut tasks = Vec::new();
        for idx in 0..32 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                let session = format!("s{idx}");
                let (sender, _receiver) = channel();
                manager.join(request("shared", &session, &session, None), sender).await;
                manager.leave(&"shared".into(), &session.as_str().into(), 1).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(manager.room_count().await, 0);
    }
}
