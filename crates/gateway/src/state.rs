use std::sync::Arc;

use meshcast_config::Settings;
use meshcast_media::{RoomRegistry, TransportConfig, WorkerPool, codecs::build_media_codecs};

use crate::ws::storage::WsStorage;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub registry: Arc<RoomRegistry>,
    pub ws_storage: Arc<WsStorage>,
}

impl AppState {
    pub async fn new(settings: Settings) -> anyhow::Result<Self> {
        let pool = Arc::new(WorkerPool::start(&settings.worker_pool).await?);
        let codecs = build_media_codecs(&settings.router.media_codecs);
        let transport_config = TransportConfig::new(&settings.webrtc_transport);
        let ws_storage = Arc::new(WsStorage::new());
        let registry = Arc::new(RoomRegistry::new(
            pool,
            codecs,
            transport_config,
            ws_storage.clone(),
        ));

        Ok(Self {
            settings,
            registry,
            ws_storage,
        })
    }
}
