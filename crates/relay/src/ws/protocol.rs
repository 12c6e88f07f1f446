use axum::extract::ws::{Message, WebSocket};
pub use flowpresence_common::protocol::ws::{decode_message, encode_message};
use flowpresence_common::protocol::ws::WsMessage;

pub async fn send_ws_message(socket: &mut WebSocket, message: &WsMessage) -> Result<(), ()> {
    let encoded = encode_message(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
