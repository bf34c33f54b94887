use serde_json::json;

use super::storage::WsStorage;

/// Sends a one-off event straight to a user's connections, bypassing the
/// room entirely. Used for connection-lifecycle events (`handshake`, `pong`)
/// and for `media` error replies that have no room to go through.
pub async fn send_to_user(storage: &WsStorage, session_id: &str, user_id: &str, event: &str, data: serde_json::Value) {
    meshcast_media::RoomNotifier::notify(storage, session_id, user_id, event, data).await;
}

pub async fn send_error(storage: &WsStorage, session_id: &str, user_id: &str, message: &str) {
    send_to_user(storage, session_id, user_id, "mediaError", json!({ "message": message })).await;
}
