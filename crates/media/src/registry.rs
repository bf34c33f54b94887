use std::sync::Arc;

use dashmap::DashMap;
use mediasoup::rtp_parameters::RtpCodecCapability;
use tracing::info;

use crate::error::{MediaError, RoomInitError};
use crate::notify::RoomNotifier;
use crate::room::Room;
use crate::transport::TransportConfig;
use crate::worker_pool::{WorkerLoad, WorkerPool};

/// Owns every live room and the worker pool they're scheduled onto. One
/// instance per process; shared through the gateway's application state.
pub struct RoomRegistry {
    pool: Arc<WorkerPool>,
    codecs: Vec<RtpCodecCapability>,
    transport_config: TransportConfig,
    notifier: Arc<dyn RoomNotifier>,
    rooms: DashMap<String, Arc<Room>>,
}

impl RoomRegistry {
    pub fn new(
        pool: Arc<WorkerPool>,
        codecs: Vec<RtpCodecCapability>,
        transport_config: TransportConfig,
        notifier: Arc<dyn RoomNotifier>,
    ) -> Self {
        Self {
            pool,
            codecs,
            transport_config,
            notifier,
            rooms: DashMap::new(),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(session_id).map(|entry| entry.clone())
    }

    /// `initSession`: if a room for `session_id` already exists, returns it
    /// unchanged with `existed = true` and mutates nothing. Otherwise picks
    /// the least-loaded worker, creates a router and audio observer on it,
    /// and registers the room, returning `existed = false`.
    pub async fn init_session(&self, session_id: &str) -> Result<(Arc<Room>, bool), RoomInitError> {
        if let Some(room) = self.get(session_id) {
            return Ok((room, true));
        }

        let worker_index = self.pool.pick_least_loaded(&self.worker_loads().await);
        let room = Room::create(
            session_id.to_string(),
            worker_index,
            &self.pool,
            self.notifier.clone(),
            self.codecs.clone(),
            self.transport_config.clone(),
        )
        .await?;

        // Another task may have won the race to create this room first;
        // prefer whichever one ended up in the map.
        match self.rooms.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => Ok((existing.get().clone(), true)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(room.clone());
                info!(session_id, worker_index, "room registered");
                Ok((room, false))
            }
        }
    }

    /// `reConfigureMedia`: moves `session_id`'s room onto a different worker
    /// than the one it currently runs on. No-op (returns `Ok(())`) if the
    /// room doesn't exist.
    pub async fn reconfigure_room(&self, session_id: &str) -> Result<(), RoomInitError> {
        let Some(room) = self.get(session_id) else {
            return Ok(());
        };
        let current = room.worker_load().await.worker_index;
        let loads = self.worker_loads().await;
        let mut new_index = self.pool.pick_least_loaded(&loads);
        if new_index == current && self.pool.len() > 1 {
            new_index = (new_index + 1) % self.pool.len() as u32;
        }
        room.reconfigure(new_index, &self.pool).await
    }

    pub fn find(&self, session_id: &str) -> Result<Arc<Room>, MediaError> {
        self.get(session_id).ok_or(MediaError::RoomNotFound)
    }

    /// Removes a participant from their room, dropping the room entirely
    /// once it has no participants left.
    pub async fn leave(&self, session_id: &str, user_id: &str) {
        let Some(room) = self.get(session_id) else {
            return;
        };
        room.remove_client(user_id).await;
        if room.is_empty().await {
            room.close().await;
            self.rooms.remove(session_id);
            info!(session_id, "room dropped, empty");
        }
    }

    pub async fn worker_loads(&self) -> Vec<WorkerLoad> {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|entry| entry.value().clone()).collect();
        let mut loads = Vec::with_capacity(rooms.len());
        for room in rooms {
            loads.push(room.worker_load().await);
        }
        loads
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub async fn stats(&self) -> serde_json::Value {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|entry| entry.value().clone()).collect();
        let mut room_stats = Vec::with_capacity(rooms.len());
        for room in &rooms {
            room_stats.push(room.stats().await);
        }

        let worker_stats: Vec<serde_json::Value> = self
            .pool
            .stats()
            .into_iter()
            .map(|(pid, load)| {
                serde_json::json!({
                    "pid": pid,
                    "worker_index": load.worker_index,
                    "participant_count": load.participant_count,
                    "room_count": load.room_count,
                })
            })
            .collect();

        serde_json::json!({
            "rooms": room_stats,
            "workers": worker_stats,
        })
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
