use flowpresence_common::types::RoomId;

/// Errors returned to callers of the join/leave controller.
///
/// None of these are fatal: every failure leaves the client in a state where
/// editing continues without presence.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("no session: the connection is not established")]
    NotConnected,
    #[error("not joined to a room")]
    NotJoined,
    #[error("already joined to room {0}; leave it first")]
    AlreadyJoined(RoomId),
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}
