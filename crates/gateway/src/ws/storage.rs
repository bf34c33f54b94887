use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::SinkExt;
use futures::stream::SplitSink;
use meshcast_media::MediaError;
use serde_json::{Value, json};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

pub type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

const ACK_TIMEOUT: Duration = Duration::from_secs(20);
const ACK_RETRIES: u32 = 3;

/// Tracks every live websocket connection, scoped by room, and every
/// `request`/ack pair awaiting a client reply. The only thing that makes a
/// [`meshcast_media::Room`] able to reach a socket.
pub struct WsStorage {
    connections: DashMap<String, DashMap<String, Vec<WsSender>>>,
    pending_acks: DashMap<String, oneshot::Sender<Value>>,
}

impl WsStorage {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            pending_acks: DashMap::new(),
        }
    }

    pub fn add(&self, session_id: &str, user_id: &str, sender: WsSender) {
        self.connections
            .entry(session_id.to_string())
            .or_default()
            .entry(user_id.to_string())
            .or_default()
            .push(sender);
    }

    pub fn remove(&self, session_id: &str, user_id: &str, sender: &WsSender) {
        if let Some(users) = self.connections.get(session_id) {
            if let Some(mut senders) = users.get_mut(user_id) {
                senders.retain(|s| !Arc::ptr_eq(s, sender));
                let empty = senders.is_empty();
                drop(senders);
                if empty {
                    users.remove(user_id);
                }
            }
        }
    }

    fn get_senders(&self, session_id: &str, user_id: &str) -> Vec<WsSender> {
        self.connections
            .get(session_id)
            .and_then(|users| users.get(user_id).map(|s| s.clone()))
            .unwrap_or_default()
    }

    fn user_ids(&self, session_id: &str, except_user_id: Option<&str>) -> Vec<String> {
        self.connections
            .get(session_id)
            .map(|users| {
                users
                    .iter()
                    .map(|entry| entry.key().clone())
                    .filter(|id| Some(id.as_str()) != except_user_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn send_raw(&self, session_id: &str, user_id: &str, message: &Value) {
        let text = serde_json::to_string(message).unwrap_or_default();
        for sender in self.get_senders(session_id, user_id) {
            let mut guard = sender.lock().await;
            if let Err(err) = guard.send(Message::text(text.clone())).await {
                warn!(session_id, user_id, %err, "failed to send websocket message");
            }
        }
    }

    /// Called from the inbound message loop when a client acks a `request`
    /// by echoing its `request_id`.
    pub fn resolve_ack(&self, request_id: &str, payload: Value) {
        if let Some((_, tx)) = self.pending_acks.remove(request_id) {
            let _ = tx.send(payload);
        } else {
            debug!(request_id, "ack received for unknown or already-timed-out request");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .iter()
            .map(|session| session.value().iter().map(|u| u.value().len()).sum::<usize>())
            .sum()
    }
}

impl Default for WsStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl meshcast_media::RoomNotifier for WsStorage {
    async fn broadcast(&self, session_id: &str, except_user_id: Option<&str>, event: &str, payload: Value) {
        let message = json!({ "event": event, "data": payload });
        for user_id in self.user_ids(session_id, except_user_id) {
            self.send_raw(session_id, &user_id, &message).await;
        }
    }

    async fn notify(&self, session_id: &str, user_id: &str, event: &str, payload: Value) {
        let message = json!({ "event": event, "data": payload });
        self.send_raw(session_id, user_id, &message).await;
    }

    async fn request(&self, session_id: &str, user_id: &str, event: &str, payload: Value) -> Result<Value, MediaError> {
        for attempt in 0..ACK_RETRIES {
            let request_id = nanoid::nanoid!();
            let (tx, rx) = oneshot::channel();
            self.pending_acks.insert(request_id.clone(), tx);

            let message = json!({ "event": event, "request_id": request_id, "data": payload.clone() });
            self.send_raw(session_id, user_id, &message).await;

            match tokio::time::timeout(ACK_TIMEOUT, rx).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(_)) => {
                    // sender dropped without a value; treat like a timeout and retry
                }
                Err(_) => {
                    self.pending_acks.remove(&request_id);
                    debug!(session_id, user_id, event, attempt, "ack wait timed out, retrying");
                }
            }
        }
        Err(MediaError::RequestTimeout)
    }
}
