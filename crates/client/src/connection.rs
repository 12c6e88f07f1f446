// Connection layer: the boundary between the presence controller and the
// transport.
//
// The controller only needs `send` plus a stream of `ConnectionEvent`s. The
// WebSocket adapter below pumps frames between a tokio-tungstenite socket and
// a pair of bounded channels, so the controller itself stays synchronous.

use std::net::IpAddr;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use flowpresence_common::protocol::ws::{decode_message, encode_message, WsMessage};
use flowpresence_common::types::{RoomId, SessionId, UserId};

/// Outbound half of a connection.
pub trait Connection {
    /// Queue a frame for delivery. Fire-and-forget: success means the frame
    /// was handed to the transport, not that the relay received it.
    fn send(&mut self, message: &WsMessage) -> Result<()>;
}

/// Inbound events the controller reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The relay assigned this connection a session id.
    Established { session_id: SessionId, user_id: UserId },
    /// Any other frame from the relay.
    Received(WsMessage),
    /// The connection closed or failed. A reconnect yields a new session.
    Lost { reason: String },
    /// The relay refused a join.
    AuthorizationFailed { room_id: Option<RoomId>, reason: String },
}

impl ConnectionEvent {
    /// Classify a decoded frame.
    pub fn from_frame(message: WsMessage) -> Self {
        match message {
            WsMessage::ConnectionEstablished { session_id, user_id } => {
                Self::Established { session_id, user_id }
            }
            WsMessage::AuthzError { room_id, message } => {
                Self::AuthorizationFailed { room_id, reason: message }
            }
            other => Self::Received(other),
        }
    }

    /// Decode a raw text frame. Malformed or unknown frames yield `None`.
    pub fn from_text(raw: &str) -> Option<Self> {
        match decode_message(raw) {
            Ok(message) => Some(Self::from_frame(message)),
            Err(error) => {
                debug!(error = %error, "dropping undecodable relay frame");
                None
            }
        }
    }
}

/// Frames the controller may queue ahead of the socket writer.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;
/// Relay events buffered ahead of the consumer. A full buffer stops reading
/// the socket.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Channel-backed connection. Frames sent here are written to the socket by
/// the pump task spawned in [`connect`].
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    outbound: mpsc::Sender<WsMessage>,
}

impl ChannelConnection {
    pub fn new(outbound: mpsc::Sender<WsMessage>) -> Self {
        Self { outbound }
    }

    /// A connection plus the receiving end of its outbound queue.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<WsMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }
}

impl Connection for ChannelConnection {
    fn send(&mut self, message: &WsMessage) -> Result<()> {
        self.outbound.try_send(message.clone()).map_err(|error| match error {
            TrySendError::Full(_) => anyhow!("outbound queue full"),
            TrySendError::Closed(_) => anyhow!("connection is closed"),
        })
    }
}

/// Open a WebSocket to the relay and start the frame pumps.
///
/// Returns the outbound connection and the inbound event stream. The stream
/// always ends with a single `Lost` event.
pub async fn connect(ws_url: &str) -> Result<(ChannelConnection, mpsc::Receiver<ConnectionEvent>)> {
    validate_ws_url(ws_url)?;

    let (socket, _response) = tokio_tungstenite::connect_async(ws_url)
        .await
        .with_context(|| format!("failed to connect to relay at {ws_url}"))?;
    info!(ws_url, "relay websocket connected");

    let (mut sink, mut stream) = socket.split();
    let (connection, mut outbound) = ChannelConnection::pair(OUTBOUND_QUEUE_CAPACITY);
    let (events, inbound) = mpsc::channel(EVENT_QUEUE_CAPACITY);

    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let encoded = match encode_message(&message) {
                Ok(encoded) => encoded,
                Err(error) => {
                    warn!(error = %error, frame = message.type_name(), "failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(encoded.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        let reason = loop {
            match stream.next().await {
                Some(Ok(Message::Text(raw))) => {
                    if let Some(event) = ConnectionEvent::from_text(raw.as_str()) {
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|frame| format!("closed by relay: {}", frame.reason.as_str()))
                        .unwrap_or_else(|| "closed by relay".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => break format!("websocket error: {error}"),
                None => break "connection closed".to_string(),
            }
        };
        let _ = events.send(ConnectionEvent::Lost { reason }).await;
    });

    Ok((connection, inbound))
}

fn validate_ws_url(value: &str) -> Result<()> {
    let parsed = Url::parse(value).map_err(|error| anyhow!("invalid ws_url `{value}`: {error}"))?;
    match parsed.scheme() {
        "wss" => Ok(()),
        "ws" if is_loopback_host(parsed.host_str()) => Ok(()),
        _ => Err(anyhow!("ws_url must use wss (ws is allowed only for localhost testing)")),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpresence_common::protocol::ws::PresenceAction;

    #[test]
    fn connection_established_frame_becomes_established_event() {
        let raw = r#"{"type":"CONNECTION_ESTABLISHED","sessionId":"s-1","userId":"alice"}"#;
        assert_eq!(
            ConnectionEvent::from_text(raw),
            Some(ConnectionEvent::Established { session_id: "s-1".into(), user_id: "alice".into() })
        );
    }

    #[test]
    fn authz_error_frame_becomes_authorization_failure() {
        let raw = r#"{"type":"AUTHZ_ERROR","roomId":"flow-1","message":"access denied"}"#;
        assert_eq!(
            ConnectionEvent::from_text(raw),
            Some(ConnectionEvent::AuthorizationFailed {
                room_id: Some("flow-1".into()),
                reason: "access denied".into()
            })
        );
    }

    #[test]
    fn presence_frames_pass_through() {
        let raw = r#"{"type":"NODE_PRESENCE_UPDATED","roomId":"r","sessionId":"s","timestamp":1,"nodeId":"n","action":"enter"}"#;
        match ConnectionEvent::from_text(raw) {
            Some(ConnectionEvent::Received(WsMessage::NodePresenceUpdated { action, .. })) => {
                assert_eq!(action, PresenceAction::Enter);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_dropped() {
        assert_eq!(ConnectionEvent::from_text("not json"), None);
        assert_eq!(ConnectionEvent::from_text(r#"{"type":"SOMETHING_NEW"}"#), None);
    }

    #[test]
    fn channel_connection_forwards_and_reports_closed() {
        let (mut connection, mut receiver) = ChannelConnection::pair(4);
        let frame = WsMessage::leave("r".into(), "s".into());
        connection.send(&frame).unwrap();
        assert_eq!(receiver.try_recv().unwrap(), frame);

        drop(receiver);
        let error = connection.send(&frame).unwrap_err();
        assert_eq!(error.to_string(), "connection is closed");
    }

    #[test]
    fn channel_connection_refuses_frames_beyond_capacity() {
        let (mut connection, mut receiver) = ChannelConnection::pair(2);
        let frame = WsMessage::leave("r".into(), "s".into());
        connection.send(&frame).unwrap();
        connection.send(&frame).unwrap();

        let error = connection.send(&frame).unwrap_err();
        assert_eq!(error.to_string(), "outbound queue full");

        receiver.try_recv().unwrap();
        assert!(connection.send(&frame).is_ok());
    }

    #[test]
    fn ws_url_validation_requires_tls_off_loopback() {
        assert!(validate_ws_url("wss://relay.example.com/v1/ws").is_ok());
        assert!(validate_ws_url("ws://localhost:8080/v1/ws").is_ok());
        assert!(validate_ws_url("ws://127.0.0.1:8080/v1/ws").is_ok());
        assert!(validate_ws_url("ws://[::1]:8080/v1/ws").is_ok());
        assert!(validate_ws_url("ws://relay.example.com/v1/ws").is_err());
        assert!(validate_ws_url("http://localhost:8080").is_err());
        assert!(validate_ws_url("not a url").is_err());
    }
}
