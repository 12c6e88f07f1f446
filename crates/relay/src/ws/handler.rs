use std::time::Duration;

use super::protocol as ws_protocol;
use super::rate_limit::{MessageRateLimiter, RateLimitDecision};
use super::session::{
    PresenceRouterState, FRAME_CEILING_BYTES, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, MAX_FRAME_BYTES,
};
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode, RelayError,
};
use crate::metrics;
use crate::rooms::{Delivery, JoinOutcome, JoinRequest, LeaveOutcome, Outbound, RelayOutcome, OUTBOUND_QUEUE_CAPACITY};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use flowpresence_common::protocol::ws::{now_millis, WsMessage};
use flowpresence_common::types::{RoomId, SessionId, UserId};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Close code sent to a connection that would exceed the per-user cap.
pub(crate) const TOO_MANY_CONNECTIONS_CLOSE_CODE: u16 = 4429;

/// How long to wait for the peer to answer our close frame.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct WsConnectQuery {
    #[serde(default)]
    user_id: Option<String>,
}

pub(crate) async fn ws_upgrade(
    Query(query): Query<WsConnectQuery>,
    State(state): State<PresenceRouterState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    let Some(user_id) = query.user_id.map(|value| value.trim().to_owned()).filter(|value| !value.is_empty())
    else {
        return RelayError::missing_field("user_id").with_request_id(request_id).into_response();
    };

    // Frames up to the ceiling are read whole so the size check below can
    // answer with a close frame instead of a transport error.
    ws.max_frame_size(FRAME_CEILING_BYTES).max_message_size(FRAME_CEILING_BYTES).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(state, UserId::new(user_id), socket)).await;
    })
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

pub(super) fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

/// Send an `ERROR` frame, then a close frame, then wait for the peer's
/// close so the frames are not lost to a connection reset.
async fn close_with_error(socket: &mut WebSocket, error: WsMessage, code: u16, reason: String) {
    let _ = ws_protocol::send_ws_message(socket, &error).await;
    if socket.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await.is_err() {
        return;
    }
    let _ = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
        while let Some(Ok(message)) = socket.recv().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    })
    .await;
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let reason = frame_size_exceeded_reason();
    close_with_error(socket, ErrorCode::FrameTooLarge.ws_error(reason.clone()), close_code::SIZE, reason).await;
}

async fn handle_socket(state: PresenceRouterState, user_id: UserId, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let max_connections = state.limits.max_connections_per_user;
    let Some(session_id) = state.sessions.register(user_id.clone(), max_connections).await else {
        metrics::increment_connections_rejected();
        warn!(user_id = %user_id, request_id = %request_id, max_connections, "connection cap reached, closing");
        let error = ErrorCode::TooManyConnections
            .ws_error(format!("at most {max_connections} concurrent connections are allowed per user"));
        let reason = ErrorCode::TooManyConnections.default_message().to_string();
        close_with_error(&mut socket, error, TOO_MANY_CONNECTIONS_CLOSE_CODE, reason).await;
        return;
    };
    info!(session_id = %session_id, user_id = %user_id, request_id = %request_id, "websocket connected");

    let established = WsMessage::ConnectionEstablished { session_id: session_id.clone(), user_id: user_id.clone() };
    if ws_protocol::send_ws_message(&mut socket, &established).await.is_err() {
        disconnect(&state, &session_id, "failed to send connection established").await;
        return;
    }

    let (outbound_sender, mut outbound_receiver) = Outbound::channel(OUTBOUND_QUEUE_CAPACITY);
    let mut rate_limiter = MessageRateLimiter::new(state.limits.message_rate_limit, state.limits.message_rate_window);
    let mut rate_limited = false;

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS and disconnects when
    // the last pong is older than one interval plus HEARTBEAT_TIMEOUT_MS.
    let mut heartbeat_interval = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS as u64));
    heartbeat_interval.reset();
    let mut last_pong = Instant::now();
    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
    let heartbeat_deadline = Duration::from_millis(HEARTBEAT_INTERVAL_MS as u64) + heartbeat_timeout;

    let reason = loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_deadline {
                    warn!(session_id = %session_id, request_id = %request_id, "heartbeat timeout, disconnecting");
                    break "heartbeat timeout";
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break "ping failed";
                }
            }
            delivery = outbound_receiver.next() => {
                match delivery {
                    Delivery::Frame(outbound_message) => {
                        if ws_protocol::send_ws_message(&mut socket, &outbound_message).await.is_err() {
                            break "send failed";
                        }
                    }
                    Delivery::Overflowed => {
                        warn!(session_id = %session_id, request_id = %request_id, "outbound queue full, disconnecting");
                        break "outbound queue full";
                    }
                    Delivery::Closed => break "outbound queue closed",
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break "client disconnected";
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES as usize {
                            close_frame_too_large(&mut socket).await;
                            break "frame too large";
                        }

                        if let RateLimitDecision::Limited { retry_after_ms } = rate_limiter.check(Instant::now()) {
                            metrics::record_ws_dropped("rate_limited");
                            if !rate_limited {
                                rate_limited = true;
                                debug!(session_id = %session_id, retry_after_ms, "message rate limit exceeded");
                                outbound_sender.send(ErrorCode::RateLimited.ws_error(format!(
                                    "message rate limit exceeded, retry after {retry_after_ms} ms"
                                )));
                            }
                            continue;
                        }
                        rate_limited = false;

                        match ws_protocol::decode_message(raw_message.as_str()) {
                            Ok(frame) => {
                                handle_client_frame(&state, &session_id, &user_id, &outbound_sender, frame).await;
                            }
                            Err(error) => {
                                metrics::record_ws_dropped("malformed");
                                debug!(session_id = %session_id, error = %error, "dropping malformed frame");
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break "pong failed";
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break "client closed",
                    Ok(Message::Binary(_)) => {
                        metrics::record_ws_dropped("binary");
                        debug!(session_id = %session_id, "dropping binary frame");
                    }
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(&mut socket).await;
                            break "frame too large";
                        }
                        break "socket error";
                    }
                }
            }
        }
    };

    disconnect(&state, &session_id, reason).await;
}

/// Implicit leave for whatever room the session was in, then forget it.
async fn disconnect(state: &PresenceRouterState, session_id: &SessionId, reason: &str) {
    let Some(ended) = state.sessions.unregister(session_id).await else {
        info!(session_id = %session_id, reason, "websocket disconnected");
        return;
    };
    if let Some(room_id) = &ended.room_id {
        state.rooms.leave(room_id, session_id, now_millis()).await;
    }
    info!(
        session_id = %session_id,
        user_id = %ended.user_id,
        duration_ms = u64::try_from(ended.connected_for.as_millis()).unwrap_or(u64::MAX),
        reason,
        "websocket disconnected"
    );
}

/// Apply one decoded client frame. Replies to the sender go through its
/// outbound queue so they stay ordered with room fan-out.
pub(crate) async fn handle_client_frame(
    state: &PresenceRouterState,
    session_id: &SessionId,
    user_id: &UserId,
    outbound: &Outbound,
    frame: WsMessage,
) {
    metrics::record_ws_frame(frame.type_name());

    if frame.session_id().is_some_and(|claimed| claimed != session_id) {
        metrics::record_ws_dropped("stale_session");
        debug!(
            session_id = %session_id,
            claimed = ?frame.session_id(),
            frame = frame.type_name(),
            "dropping frame sent on behalf of another session"
        );
        return;
    }

    match frame {
        WsMessage::JoinChatFlow { room_id, timestamp, color, .. } => {
            if !state.access.allows(&room_id, user_id) {
                metrics::increment_authz_denied();
                warn!(session_id = %session_id, user_id = %user_id, room_id = %room_id, "join denied");
                outbound.send(WsMessage::AuthzError {
                    room_id: Some(room_id),
                    message: ErrorCode::AuthForbidden.default_message().to_string(),
                });
                return;
            }

            if let Some(previous) = state.sessions.room_for_session(session_id).await {
                if previous != room_id {
                    state.rooms.leave(&previous, session_id, timestamp).await;
                }
            }

            let request = JoinRequest {
                room_id: room_id.clone(),
                session_id: session_id.clone(),
                user_id: user_id.clone(),
                timestamp,
                color,
            };
            if let JoinOutcome::Joined { peers } = state.rooms.join(request, outbound.clone()).await {
                metrics::record_relay_deliveries(peers);
            }
            state.sessions.set_room(session_id, Some(room_id)).await;
        }
        WsMessage::LeaveChatFlow { room_id, timestamp, .. } => {
            match state.rooms.leave(&room_id, session_id, timestamp).await {
                LeaveOutcome::Left { .. } => {
                    state.sessions.set_room(session_id, None).await;
                }
                LeaveOutcome::NotMember => {
                    metrics::record_ws_dropped("not_member");
                    debug!(session_id = %session_id, room_id = %room_id, "leave for a room the session is not in");
                }
            }
        }
        event @ WsMessage::NodePresenceUpdated { .. } => {
            let Some(room_id) = event.room_id().cloned() else {
                return;
            };
            let outcome = state.rooms.relay(&room_id, session_id, event).await;
            record_relay(session_id, &room_id, outcome);
        }
        WsMessage::UserHeartbeat { room_id, status, .. } => {
            if !state.rooms.heartbeat(&room_id, session_id, status).await {
                metrics::record_ws_dropped("not_member");
                debug!(session_id = %session_id, room_id = %room_id, "heartbeat from non-member dropped");
            }
        }
        WsMessage::UserColorUpdated { room_id, timestamp, color, .. } => {
            let outcome = state.rooms.update_color(&room_id, session_id, timestamp, &color).await;
            record_relay(session_id, &room_id, outcome);
        }
        other => {
            metrics::record_ws_dropped("unexpected_type");
            debug!(session_id = %session_id, frame = other.type_name(), "dropping server-only frame from client");
        }
    }
}

fn record_relay(session_id: &SessionId, room_id: &RoomId, outcome: RelayOutcome) {
    match outcome {
        RelayOutcome::Relayed { recipients } => metrics::record_relay_deliveries(recipients),
        RelayOutcome::NotMember => {
            metrics::record_ws_dropped("not_member");
            debug!(session_id = %session_id, room_id = %room_id, "dropping relay from non-member");
        }
    }
}
