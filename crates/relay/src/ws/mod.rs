mod handler;
mod protocol;
mod rate_limit;
mod session;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::access::RoomAccessStore;
use crate::config::ConnectionLimits;
use crate::rooms::RoomManager;
pub(crate) use session::PresenceRouterState;
pub use session::SessionRegistry;

pub fn router(
    rooms: Arc<RoomManager>,
    sessions: Arc<SessionRegistry>,
    access: RoomAccessStore,
    limits: ConnectionLimits,
) -> Router {
    let state = PresenceRouterState { rooms, sessions, access, limits };
    Router::new().route("/v1/ws", get(handler::ws_upgrade)).with_state(state)
}
