use std::sync::Arc;

use axum::{
    extract::{Query, State, WebSocketUpgrade, ws::{Message, WebSocket}},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use meshcast_media::{MediaAction, MediaError, TransportKind};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::state::AppState;

use super::dispatcher::send_error;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub session_id: String,
    pub user_id: String,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_kind")]
    pub kind: String,
}

fn default_device() -> String {
    "web".to_string()
}

fn default_kind() -> String {
    "producer".to_string()
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(socket: WebSocket, state: AppState, params: WsParams) {
    let WsParams {
        session_id,
        user_id,
        device,
        kind,
    } = params;

    info!(session_id, user_id, "websocket connected");

    let (sender, mut receiver) = socket.split();
    let sender: super::storage::WsSender = Arc::new(Mutex::new(sender));
    state.ws_storage.add(&session_id, &user_id, sender.clone());

    let default_transport_kind = TransportKind::parse(&kind).unwrap_or(TransportKind::Producer);
    let registry = state.registry.clone();
    let room = match registry.init_session(&session_id).await {
        Ok((room, existed)) => {
            let mut guard = sender.lock().await;
            let _ = guard
                .send(Message::text(
                    json!({ "event": "handshake", "data": { "user_id": user_id, "room_existed": existed } })
                        .to_string(),
                ))
                .await;
            drop(guard);
            room
        }
        Err(err) => {
            warn!(session_id, %err, "failed to create room");
            let mut guard = sender.lock().await;
            let _ = guard
                .send(Message::text(
                    json!({ "event": "mediaError", "data": { "message": err.to_string() } }).to_string(),
                ))
                .await;
            return;
        }
    };

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_client_message(&state, &room, &session_id, &user_id, &device, default_transport_kind, &text)
                    .await;
            }
            Ok(Message::Ping(data)) => {
                let mut guard = sender.lock().await;
                let _ = guard.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => break,
            Err(err) => {
                warn!(session_id, user_id, %err, "websocket error");
                break;
            }
            _ => {}
        }
    }

    state.ws_storage.remove(&session_id, &user_id, &sender);
    registry.leave(&session_id, &user_id).await;
    info!(session_id, user_id, "websocket disconnected");
}

#[derive(Debug, Deserialize)]
struct ToggleDevicePayload {
    action: String,
    kind: String,
}

async fn handle_client_message(
    state: &AppState,
    room: &Arc<meshcast_media::Room>,
    session_id: &str,
    user_id: &str,
    default_device: &str,
    default_transport_kind: TransportKind,
    text: &str,
) {
    let Ok(envelope) = serde_json::from_str::<Value>(text) else {
        debug!(session_id, user_id, "discarding malformed websocket frame");
        return;
    };

    let event = envelope.get("event").and_then(Value::as_str).unwrap_or("");
    let data = envelope.get("data").cloned().unwrap_or(Value::Null);

    match event {
        "ping" => {
            super::dispatcher::send_to_user(&state.ws_storage, session_id, user_id, "pong", Value::Null).await;
        }
        "ack" => {
            if let Some(request_id) = envelope.get("request_id").and_then(Value::as_str) {
                state.ws_storage.resolve_ack(request_id, data);
            }
        }
        "addClient" => {
            let transport_kind = data
                .get("kind")
                .and_then(Value::as_str)
                .and_then(TransportKind::parse)
                .unwrap_or(default_transport_kind);
            match room
                .add_client(user_id.to_string(), default_device.to_string(), transport_kind)
                .await
            {
                Ok(()) => {
                    super::dispatcher::send_to_user(
                        &state.ws_storage,
                        session_id,
                        user_id,
                        "addClientResult",
                        json!({ "ok": true }),
                    )
                    .await;
                }
                Err(err) => send_error(&state.ws_storage, session_id, user_id, &err.to_string()).await,
            }
        }
        "joinRoom" => {
            let Some(rtp_caps_value) = data.get("rtp_capabilities").cloned() else {
                send_error(&state.ws_storage, session_id, user_id, "missing rtp_capabilities").await;
                return;
            };
            let rtp_capabilities = match serde_json::from_value(rtp_caps_value) {
                Ok(caps) => caps,
                Err(_) => {
                    send_error(&state.ws_storage, session_id, user_id, "invalid rtp_capabilities").await;
                    return;
                }
            };
            let producer_capabilities = data
                .get("producer_capabilities")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            match room.join_room(user_id, rtp_capabilities, producer_capabilities).await {
                Ok(payload) => {
                    super::dispatcher::send_to_user(&state.ws_storage, session_id, user_id, "joinRoomResult", payload)
                        .await;
                }
                Err(err) => send_error(&state.ws_storage, session_id, user_id, &err.to_string()).await,
            }
        }
        "mediaRoomInfo" => {
            let stats = room.stats().await;
            super::dispatcher::send_to_user(&state.ws_storage, session_id, user_id, "mediaRoomInfo", stats).await;
        }
        "mediaRoomClients" => {
            let stats = room.stats().await;
            let clients = stats.get("clients").cloned().unwrap_or_default();
            super::dispatcher::send_to_user(&state.ws_storage, session_id, user_id, "mediaRoomClients", clients)
                .await;
        }
        "mediaReconfigure" => {
            if let Err(err) = state.registry.reconfigure_room(session_id).await {
                send_error(&state.ws_storage, session_id, user_id, &err.to_string()).await;
            }
        }
        "toggleDevice" => {
            let Ok(payload) = serde_json::from_value::<ToggleDevicePayload>(data) else {
                send_error(&state.ws_storage, session_id, user_id, "invalid toggleDevice payload").await;
                return;
            };
            meshcast_media::RoomNotifier::broadcast(
                &*state.ws_storage,
                session_id,
                Some(user_id),
                "toggleDevice",
                json!({ "sender": user_id, "action": payload.action, "kind": payload.kind }),
            )
            .await;
        }
        "media" => {
            let action_name = data.get("action").and_then(Value::as_str).unwrap_or("").to_string();
            let action = match MediaAction::from_payload(data) {
                Ok(action) => action,
                Err(_) => {
                    send_error(
                        &state.ws_storage,
                        session_id,
                        user_id,
                        &MediaError::UnknownAction(action_name).to_string(),
                    )
                    .await;
                    return;
                }
            };
            match room.dispatch(user_id, action).await {
                Ok(result) => {
                    super::dispatcher::send_to_user(&state.ws_storage, session_id, user_id, "mediaResult", result)
                        .await;
                }
                Err(err) => send_error(&state.ws_storage, session_id, user_id, &err.to_string()).await,
            }
        }
        other => {
            debug!(session_id, user_id, event = other, "unhandled websocket event");
        }
    }
}

