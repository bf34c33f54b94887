use async_trait::async_trait;
use serde_json::Value;

/// The room's only way of reaching participants' sockets. Implemented by the
/// gateway crate over its websocket connection table; kept as a trait here
/// so this crate never depends on axum or any transport detail.
///
/// `broadcast` reaches every member of `session_id` except `except_user_id`;
/// `broadcast_all` reaches every member including the sender; `notify` reaches
/// exactly one participant. Within one room, calls to a given peer are
/// delivered in the order they were issued — implementations must not
/// reorder or parallelize sends to the same user.
#[async_trait]
pub trait RoomNotifier: Send + Sync {
    async fn broadcast(
        &self,
        session_id: &str,
        except_user_id: Option<&str>,
        event: &str,
        payload: Value,
    );

    async fn broadcast_all(&self, session_id: &str, event: &str, payload: Value) {
        self.broadcast(session_id, None, event, payload).await;
    }

    async fn notify(&self, session_id: &str, user_id: &str, event: &str, payload: Value);

    /// Sends a request the peer must ack (the push-consume `newConsumer`
    /// flow). Three retries, 20s each; `Err(MediaError::RequestTimeout)` on
    /// final timeout.
    async fn request(
        &self,
        session_id: &str,
        user_id: &str,
        event: &str,
        payload: Value,
    ) -> Result<Value, crate::error::MediaError>;
}

/// No-op notifier used in tests that exercise room state transitions without
/// a live gateway.
pub struct NullNotifier;

#[async_trait]
impl RoomNotifier for NullNotifier {
    async fn broadcast(&self, _: &str, _: Option<&str>, _: &str, _: Value) {}
    async fn notify(&self, _: &str, _: &str, _: &str, _: Value) {}
    async fn request(&self, _: &str, _: &str, _: &str, _: Value) -> Result<Value, crate::error::MediaError> {
        Ok(Value::Null)
    }
}
