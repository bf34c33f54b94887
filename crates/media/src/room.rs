use std::collections::HashMap;
use std::sync::{Arc, Weak};

use mediasoup::audio_level_observer::{
    AudioLevelObserver, AudioLevelObserverAddProducerOptions, AudioLevelObserverOptions,
};
use mediasoup::consumer::{Consumer, ConsumerLayers, ConsumerOptions, ConsumerType};
use mediasoup::data_structures::DtlsState;
use mediasoup::producer::{Producer, ProducerId, ProducerOptions};
use mediasoup::router::{Router, RouterOptions};
use mediasoup::rtp_observer::RtpObserver;
use mediasoup::rtp_parameters::{MediaKind, RtpCapabilities, RtpCodecCapability};
use mediasoup::webrtc_transport::{WebRtcTransport, WebRtcTransportRemoteParameters};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::commands::MediaAction;
use crate::error::{MediaError, RoomInitError};
use crate::notify::RoomNotifier;
use crate::participant::{MediaTag, Participant, TransportKind};
use crate::transport::TransportConfig;
use crate::worker_pool::{WorkerLoad, WorkerPool};

/// Everything about a room that changes as clients join, produce and leave.
/// Guarded by a single async mutex: handlers acquire it for their
/// synchronous bookkeeping, release it around any worker RPC or client ack
/// wait, then re-acquire and re-validate before committing a result. This
/// keeps the total order of mutating commands for one room intact without
/// blocking the room for the duration of a slow client ack.
struct RoomState {
    worker_index: u32,
    router: Router,
    audio_observer: AudioLevelObserver,
    participants: HashMap<String, Participant>,
    /// `producer_id.to_string() -> (owner user_id, tag)`, used to resolve a
    /// producer back to its owner for pull-consume and for the audio
    /// observer's volume events, without relying on mediasoup app data.
    producer_owners: HashMap<String, (String, MediaTag)>,
    /// Set for the gap between tearing down the old router and binding the
    /// new one during `reconfigure`; `dispatch` fails fast with
    /// `RoomReconfiguring` instead of racing a worker call against it.
    reconfiguring: bool,
}

/// One conferencing room: one mediasoup router, one audio level observer,
/// and the set of participants currently admitted to it. Lives for as long
/// as it has at least one participant; the registry drops it once empty.
pub struct Room {
    session_id: String,
    notifier: Arc<dyn RoomNotifier>,
    codecs: Vec<RtpCodecCapability>,
    transport_config: TransportConfig,
    self_weak: Weak<Room>,
    state: Mutex<RoomState>,
}

impl Room {
    pub async fn create(
        session_id: String,
        worker_index: u32,
        pool: &WorkerPool,
        notifier: Arc<dyn RoomNotifier>,
        codecs: Vec<RtpCodecCapability>,
        transport_config: TransportConfig,
    ) -> Result<Arc<Room>, RoomInitError> {
        let slot = pool
            .slot(worker_index)
            .ok_or_else(|| RoomInitError::Router("worker index out of range".to_string()))?;

        let router = slot
            .worker
            .create_router(RouterOptions::new(codecs.clone()))
            .await
            .map_err(|e| RoomInitError::Router(e.to_string()))?;

        let mut observer_options = AudioLevelObserverOptions::default();
        observer_options.max_entries = std::num::NonZeroU16::new(1).unwrap();
        observer_options.threshold = -80;
        observer_options.interval = 800;
        let audio_observer = router
            .create_audio_level_observer(observer_options)
            .await
            .map_err(|e| RoomInitError::AudioObserver(e.to_string()))?;

        let room = Arc::new_cyclic(|weak| Room {
            session_id: session_id.clone(),
            notifier,
            codecs,
            transport_config,
            self_weak: weak.clone(),
            state: Mutex::new(RoomState {
                worker_index,
                router,
                audio_observer,
                participants: HashMap::new(),
                producer_owners: HashMap::new(),
                reconfiguring: false,
            }),
        });

        room.wire_audio_observer().await;
        info!(session_id, worker_index, "room created");
        Ok(room)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn wire_audio_observer(self: &Arc<Self>) {
        let guard = self.state.lock().await;
        let observer = guard.audio_observer.clone();
        drop(guard);

        let room_volumes = Arc::downgrade(self);
        observer
            .on_volumes(move |volumes| {
                let Some(room) = room_volumes.upgrade() else {
                    return;
                };
                let Some(entry) = volumes.first() else {
                    return;
                };
                let producer_id = entry.producer.id().to_string();
                let volume = entry.volume;
                tokio::spawn(async move {
                    room.on_dominant_speaker(producer_id, volume).await;
                });
            })
            .detach();

        let room_silence = Arc::downgrade(self);
        observer
            .on_silence(move || {
                let Some(room) = room_silence.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    room.broadcast_active_speaker(None).await;
                });
            })
            .detach();
    }

    async fn on_dominant_speaker(&self, producer_id: String, _volume: i8) {
        let guard = self.state.lock().await;
        let owner = guard.producer_owners.get(&producer_id).map(|(u, _)| u.clone());
        drop(guard);
        self.broadcast_active_speaker(owner).await;
    }

    async fn broadcast_active_speaker(&self, user_id: Option<String>) {
        self.notifier
            .broadcast(
                &self.session_id,
                None,
                "mediaActiveSpeaker",
                json!({ "user_id": user_id }),
            )
            .await;
    }

    /// `addClient`: registers a participant slot. Does not create any
    /// transport or mark the participant joined.
    pub async fn add_client(
        &self,
        user_id: String,
        device: String,
        transport_kind: TransportKind,
    ) -> Result<(), MediaError> {
        let mut guard = self.state.lock().await;
        if guard.participants.contains_key(&user_id) {
            return Err(MediaError::DuplicateParticipant(user_id));
        }
        guard
            .participants
            .insert(user_id.clone(), Participant::new(user_id, device, transport_kind));
        Ok(())
    }

    /// `joinRoom`: marks the participant joined, stores its RTP
    /// capabilities and the four producer/global enable flags, and
    /// push-consumes every already-live producer from every other joined
    /// participant onto it. Returns `{ user_id, peers_info }` describing
    /// every peer already in the room.
    pub async fn join_room(
        self: &Arc<Self>,
        user_id: &str,
        rtp_capabilities: RtpCapabilities,
        producer_capabilities: crate::commands::ProducerCapabilities,
    ) -> Result<Value, MediaError> {
        let (existing_producers, peers_info) = {
            let mut guard = self.state.lock().await;
            {
                let participant = guard
                    .participants
                    .get_mut(user_id)
                    .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
                if participant.joined {
                    return Err(MediaError::AlreadyJoined(user_id.to_string()));
                }
                participant.joined = true;
                participant.rtp_capabilities = Some(rtp_capabilities);
                participant.producer_audio_enabled = producer_capabilities.producer_audio_enabled;
                participant.producer_video_enabled = producer_capabilities.producer_video_enabled;
                participant.global_audio_enabled = producer_capabilities.global_audio_enabled;
                participant.global_video_enabled = producer_capabilities.global_video_enabled;
            }

            let existing_producers = guard
                .participants
                .iter()
                .filter(|(id, p)| id.as_str() != user_id && p.joined)
                .flat_map(|(owner_id, p)| {
                    p.live_producers()
                        .into_iter()
                        .map(|(tag, producer)| (owner_id.clone(), tag, producer.clone()))
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>();

            let peers_info: Vec<Value> = guard
                .participants
                .iter()
                .filter(|(id, p)| id.as_str() != user_id && p.joined)
                .map(|(id, p)| {
                    json!({
                        "id": id,
                        "kind": match p.transport_kind {
                            TransportKind::Producer => "producer",
                            TransportKind::Consumer => "consumer",
                        },
                        "screen_sharing": p.screen_sharing,
                    })
                })
                .collect();

            (existing_producers, peers_info)
        };

        for (owner_id, tag, producer) in existing_producers {
            if let Err(err) = self.push_consume(user_id, &owner_id, tag, &producer).await {
                warn!(%err, user_id, owner_id, %tag, "failed to push-consume existing producer on join");
            }
        }

        self.notifier
            .broadcast_all(
                &self.session_id,
                "mediaClientConnected",
                json!({ "user_id": user_id }),
            )
            .await;

        Ok(json!({ "user_id": user_id, "peers_info": peers_info }))
    }

    /// Tears one participant down and notifies the rest of the room.
    pub async fn remove_client(self: &Arc<Self>, user_id: &str) {
        let had_producers = {
            let mut guard = self.state.lock().await;
            let Some(mut participant) = guard.participants.remove(user_id) else {
                return;
            };
            let producer_ids: Vec<String> = participant
                .live_producers()
                .into_iter()
                .map(|(_, p)| p.id().to_string())
                .collect();
            for id in &producer_ids {
                guard.producer_owners.remove(id);
            }
            participant.teardown();
            !producer_ids.is_empty()
        };

        self.notifier
            .broadcast(
                &self.session_id,
                Some(user_id),
                "mediaClientDisconnect",
                json!({ "user_id": user_id }),
            )
            .await;

        if had_producers {
            self.apply_bitrate_governance().await;
        }
    }

    /// Whether this room has any participants left; the registry uses this
    /// to decide when to drop a room entirely.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.participants.is_empty()
    }

    pub async fn worker_load(&self) -> WorkerLoad {
        let guard = self.state.lock().await;
        WorkerLoad {
            worker_index: guard.worker_index,
            participant_count: guard.participants.len(),
            room_count: 1,
        }
    }

    /// `{ id, worker, clients, group_by_device }` (§6). `clients` carries
    /// every participant's produce flags; `group_by_device` tallies
    /// participants by their `device` string.
    pub async fn stats(&self) -> Value {
        let guard = self.state.lock().await;
        let clients: Vec<Value> = guard
            .participants
            .values()
            .map(|p| {
                json!({
                    "id": p.user_id,
                    "device": p.device,
                    "produce_audio": p.producer_slot(MediaTag::Audio).is_some(),
                    "produce_video": p.producer_slot(MediaTag::Video).is_some()
                        || p.producer_slot(MediaTag::Screen).is_some(),
                })
            })
            .collect();

        let mut group_by_device: HashMap<String, u32> = HashMap::new();
        for p in guard.participants.values() {
            *group_by_device.entry(p.device.clone()).or_insert(0) += 1;
        }

        json!({
            "id": self.session_id,
            "worker": guard.worker_index,
            "clients": clients,
            "group_by_device": group_by_device,
        })
    }

    /// Closes the whole room: every participant's media and transports, in
    /// participant order. The router and audio observer close when this
    /// `Room`'s last `Arc` drops.
    pub async fn close(&self) {
        let mut guard = self.state.lock().await;
        let remaining: Vec<String> = guard.participants.keys().cloned().collect();
        for (_, mut participant) in guard.participants.drain() {
            participant.teardown();
        }
        guard.producer_owners.clear();
        drop(guard);

        for user_id in remaining {
            self.notifier
                .notify(&self.session_id, &user_id, "mediaDisconnectMember", Value::Null)
                .await;
        }
        info!(session_id = %self.session_id, "room closed");
    }

    /// `reConfigureMedia`: moves this room onto a different worker without
    /// dropping its participant records. Closes every participant's media
    /// handles plus the current router and observer, binds the new worker,
    /// builds a fresh router and observer, then broadcasts `mediaReconfigure`
    /// so clients renegotiate. While in flight, `dispatch` rejects commands
    /// with `RoomReconfiguring`.
    pub async fn reconfigure(
        self: &Arc<Self>,
        new_worker_index: u32,
        pool: &WorkerPool,
    ) -> Result<(), RoomInitError> {
        {
            let mut guard = self.state.lock().await;
            guard.reconfiguring = true;
            for participant in guard.participants.values_mut() {
                participant.teardown();
            }
            guard.producer_owners.clear();
        }

        let slot = pool
            .slot(new_worker_index)
            .ok_or_else(|| RoomInitError::Router("worker index out of range".to_string()))?;

        let router = slot
            .worker
            .create_router(RouterOptions::new(self.codecs.clone()))
            .await
            .map_err(|e| RoomInitError::Router(e.to_string()))?;

        let mut observer_options = AudioLevelObserverOptions::default();
        observer_options.max_entries = std::num::NonZeroU16::new(1).unwrap();
        observer_options.threshold = -80;
        observer_options.interval = 800;
        let audio_observer = router
            .create_audio_level_observer(observer_options)
            .await
            .map_err(|e| RoomInitError::AudioObserver(e.to_string()))?;

        {
            let mut guard = self.state.lock().await;
            guard.worker_index = new_worker_index;
            guard.router = router;
            guard.audio_observer = audio_observer;
            guard.reconfiguring = false;
        }

        self.wire_audio_observer().await;

        self.notifier
            .broadcast_all(&self.session_id, "mediaReconfigure", Value::Null)
            .await;

        self.apply_bitrate_governance().await;
        info!(session_id = %self.session_id, new_worker_index, "room reconfigured onto new worker");
        Ok(())
    }

    /// The `speakMsClient` dispatcher: one exhaustive match over the closed
    /// command set, mirrored 1:1 from [`MediaAction`].
    pub async fn dispatch(
        self: &Arc<Self>,
        user_id: &str,
        action: MediaAction,
    ) -> Result<Value, MediaError> {
        if self.state.lock().await.reconfiguring {
            return Err(MediaError::RoomReconfiguring);
        }
        match action {
            MediaAction::GetRouterRtpCapabilities => self.get_router_rtp_capabilities().await,
            MediaAction::CreateWebRtcTransport { transport_kind } => {
                self.create_webrtc_transport(user_id, transport_kind.into()).await
            }
            MediaAction::ConnectWebRtcTransport {
                transport_kind,
                dtls_parameters,
            } => {
                self.connect_webrtc_transport(user_id, transport_kind.into(), dtls_parameters)
                    .await
            }
            MediaAction::Produce {
                kind,
                tag,
                rtp_parameters,
            } => {
                self.produce(user_id, kind.as_media_kind(), tag.into(), rtp_parameters)
                    .await
            }
            MediaAction::Consume {
                producer_id,
                rtp_capabilities,
            } => self.consume(user_id, producer_id, rtp_capabilities).await,
            MediaAction::RestartIce { transport_kind } => {
                self.restart_ice(user_id, transport_kind.into()).await
            }
            MediaAction::RequestConsumerKeyFrame { consumer_id } => {
                self.request_consumer_key_frame(user_id, &consumer_id).await
            }
            MediaAction::GetTransportStats { transport_kind } => {
                self.get_transport_stats(user_id, transport_kind.into()).await
            }
            MediaAction::GetProducerStats { tag } => {
                self.get_producer_stats(user_id, tag.into()).await
            }
            MediaAction::GetConsumerStats { consumer_id } => {
                self.get_consumer_stats(user_id, &consumer_id).await
            }
            MediaAction::GetAudioProducerIds => self.get_producer_ids(MediaKind::Audio).await,
            MediaAction::GetVideoProducerIds => self.get_producer_ids(MediaKind::Video).await,
            MediaAction::ProducerClose { tag } => self.producer_close(user_id, tag.into()).await,
            MediaAction::ProducerPause { tag, is_global } => {
                self.producer_pause(user_id, tag.into(), is_global).await
            }
            MediaAction::ProducerResume { tag, is_global } => {
                self.producer_resume(user_id, tag.into(), is_global).await
            }
            MediaAction::AllProducerClose { kind } => self.all_producer_close(kind.as_media_kind()).await,
            MediaAction::AllProducerPause { kind, is_global } => {
                self.all_producer_pause(kind.as_media_kind(), is_global).await
            }
            MediaAction::AllProducerResume { kind, is_global } => {
                self.all_producer_resume(kind.as_media_kind(), is_global).await
            }
        }
    }

    async fn get_router_rtp_capabilities(&self) -> Result<Value, MediaError> {
        let guard = self.state.lock().await;
        serde_json::to_value(guard.router.rtp_capabilities())
            .map_err(|_| MediaError::Worker("failed to serialize rtp capabilities".to_string()))
    }

    async fn create_webrtc_transport(
        &self,
        user_id: &str,
        kind: TransportKind,
    ) -> Result<Value, MediaError> {
        let router = {
            let guard = self.state.lock().await;
            if !guard.participants.contains_key(user_id) {
                return Err(MediaError::ParticipantNotFound(user_id.to_string()));
            }
            guard.router.clone()
        };

        let transport = self
            .transport_config
            .create_transport(&router)
            .await
            .map_err(|e| MediaError::Worker(e.to_string()))?;

        let response = json!({
            "id": transport.id().to_string(),
            "ice_parameters": transport.ice_parameters(),
            "ice_candidates": transport.ice_candidates(),
            "dtls_parameters": transport.dtls_parameters(),
        });

        self.wire_transport(transport.clone(), user_id.to_string(), kind);

        let mut guard = self.state.lock().await;
        let Some(participant) = guard.participants.get_mut(user_id) else {
            return Err(MediaError::ParticipantNotFound(user_id.to_string()));
        };
        match kind {
            TransportKind::Producer => participant.producer_transport = Some(transport),
            TransportKind::Consumer => participant.consumer_transport = Some(transport),
        }

        Ok(response)
    }

    fn wire_transport(&self, transport: WebRtcTransport, user_id: String, kind: TransportKind) {
        let room_weak = self.self_weak.clone();
        let transport_id = transport.id();
        transport
            .on_dtls_state_change(move |state| {
                if matches!(state, DtlsState::Closed | DtlsState::Failed) {
                    let Some(room) = room_weak.upgrade() else {
                        return;
                    };
                    let user_id = user_id.clone();
                    tokio::spawn(async move {
                        room.handle_transport_closed(&user_id, kind, transport_id).await;
                    });
                }
            })
            .detach();
    }

    async fn handle_transport_closed(
        &self,
        user_id: &str,
        kind: TransportKind,
        transport_id: mediasoup::transport::TransportId,
    ) {
        let mut guard = self.state.lock().await;
        if let Some(participant) = guard.participants.get_mut(user_id) {
            let slot = match kind {
                TransportKind::Producer => &mut participant.producer_transport,
                TransportKind::Consumer => &mut participant.consumer_transport,
            };
            if slot.as_ref().map(|t| t.id()) == Some(transport_id) {
                slot.take();
                warn!(user_id, ?kind, "webrtc transport closed unexpectedly");
            }
        }
    }

    async fn connect_webrtc_transport(
        &self,
        user_id: &str,
        kind: TransportKind,
        dtls_parameters: mediasoup::data_structures::DtlsParameters,
    ) -> Result<Value, MediaError> {
        let transport = {
            let guard = self.state.lock().await;
            let participant = guard
                .participants
                .get(user_id)
                .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
            let slot = match kind {
                TransportKind::Producer => &participant.producer_transport,
                TransportKind::Consumer => &participant.consumer_transport,
            };
            slot.clone().ok_or(MediaError::TransportNotFound)?
        };

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::Worker(e.to_string()))?;

        Ok(json!({ "connected": true }))
    }

    async fn produce(
        self: &Arc<Self>,
        user_id: &str,
        kind: MediaKind,
        tag: MediaTag,
        rtp_parameters: mediasoup::rtp_parameters::RtpParameters,
    ) -> Result<Value, MediaError> {
        let transport = {
            let guard = self.state.lock().await;
            let participant = guard
                .participants
                .get(user_id)
                .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
            participant
                .producer_transport
                .clone()
                .ok_or(MediaError::TransportNotFound)?
        };

        let mut options = ProducerOptions::new(kind, rtp_parameters);
        options.paused = tag != MediaTag::Screen;

        let producer = transport
            .produce(options)
            .await
            .map_err(|e| MediaError::Worker(e.to_string()))?;

        self.wire_producer(producer.clone(), user_id.to_string(), tag);

        if kind == MediaKind::Audio {
            let guard = self.state.lock().await;
            let _ = guard
                .audio_observer
                .add_producer(AudioLevelObserverAddProducerOptions::new(producer.id()))
                .await;
        }

        let producer_id = producer.id();
        let other_joined = {
            let mut guard = self.state.lock().await;
            let Some(participant) = guard.participants.get_mut(user_id) else {
                return Err(MediaError::ParticipantNotFound(user_id.to_string()));
            };
            *participant.producer_slot_mut(tag) = Some(producer.clone());
            if tag == MediaTag::Screen {
                participant.screen_sharing = true;
            }
            guard
                .producer_owners
                .insert(producer_id.to_string(), (user_id.to_string(), tag));

            guard
                .participants
                .iter()
                .filter(|(id, p)| id.as_str() != user_id && p.joined)
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>()
        };

        for subscriber in other_joined {
            if let Err(err) = self.push_consume(&subscriber, user_id, tag, &producer).await {
                warn!(%err, subscriber, user_id, %tag, "failed to push-consume new producer");
            }
        }

        self.apply_bitrate_governance().await;

        self.notifier
            .broadcast(
                &self.session_id,
                Some(user_id),
                "mediaProduce",
                json!({ "user_id": user_id, "tag": tag.as_str(), "producer_id": producer_id.to_string() }),
            )
            .await;

        Ok(json!({ "id": producer_id.to_string() }))
    }

    fn wire_producer(&self, producer: Producer, user_id: String, tag: MediaTag) {
        let room_weak = self.self_weak.clone();
        let session_id = self.session_id.clone();
        let notify_user_id = user_id.clone();
        producer
            .on_video_orientation_change(move |orientation| {
                let Some(room) = room_weak.upgrade() else {
                    return;
                };
                let notifier = room.notifier.clone();
                let session_id = session_id.clone();
                let user_id = notify_user_id.clone();
                tokio::spawn(async move {
                    notifier
                        .broadcast(
                            &session_id,
                            None,
                            "mediaVideoOrientationChange",
                            json!({ "user_id": user_id, "tag": tag.as_str(), "rotation": orientation.rotation }),
                        )
                        .await;
                });
            })
            .detach();

        producer
            .on_score(move |scores| {
                debug!(?scores, user_id = %user_id, %tag, "producer score update");
            })
            .detach();
    }

    /// Push-consume: creates a paused consumer for `subscriber` on
    /// `owner`'s producer, sends `newConsumer` and waits for the client's
    /// ack, then resumes. Silently skips subscribers whose declared RTP
    /// capabilities cannot consume this producer.
    async fn push_consume(
        self: &Arc<Self>,
        subscriber: &str,
        owner: &str,
        tag: MediaTag,
        producer: &Producer,
    ) -> Result<(), MediaError> {
        let (transport, rtp_capabilities, router) = {
            let guard = self.state.lock().await;
            let participant = guard
                .participants
                .get(subscriber)
                .ok_or_else(|| MediaError::ParticipantNotFound(subscriber.to_string()))?;
            let transport = participant
                .consumer_transport
                .clone()
                .ok_or(MediaError::TransportNotFound)?;
            let rtp_capabilities = participant
                .rtp_capabilities
                .clone()
                .ok_or(MediaError::CannotConsume)?;
            (transport, rtp_capabilities, guard.router.clone())
        };

        if !router.can_consume(&producer.id(), &rtp_capabilities) {
            return Ok(());
        }

        let mut options = ConsumerOptions::new(producer.id(), rtp_capabilities);
        options.paused = true;
        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| MediaError::Worker(e.to_string()))?;

        self.finish_preferred_layers(&consumer).await;
        let consumer = self.wire_consumer(consumer, subscriber.to_string(), owner.to_string(), tag);

        let still_valid = {
            let mut guard = self.state.lock().await;
            let producer_still_live = guard
                .participants
                .get(owner)
                .map(|p| p.producer_slot(tag).as_ref().map(|p| p.id()) == Some(producer.id()))
                .unwrap_or(false);
            match guard.participants.get_mut(subscriber) {
                Some(participant) if producer_still_live && participant.joined => {
                    participant
                        .consumer_map_mut(tag)
                        .insert(producer.id().to_string(), consumer.clone());
                    true
                }
                _ => false,
            }
        };

        if !still_valid {
            return Ok(());
        }

        if tag == MediaTag::Audio {
            let _ = consumer.set_priority(255).await;
        }

        let payload = json!({
            "user_id": owner,
            "tag": tag.as_str(),
            "producer_id": producer.id().to_string(),
            "consumer_id": consumer.id().to_string(),
            "kind": consumer.kind(),
            "rtp_parameters": consumer.rtp_parameters(),
        });

        let ack = self
            .notifier
            .request(&self.session_id, subscriber, "newConsumer", payload)
            .await;

        let mut guard = self.state.lock().await;
        let Some(participant) = guard.participants.get_mut(subscriber) else {
            return Ok(());
        };
        match ack {
            Ok(_) => {
                drop(guard);
                let _ = consumer.resume().await;
            }
            Err(err) => {
                participant.consumer_map_mut(tag).remove(&producer.id().to_string());
                warn!(%err, subscriber, owner, %tag, "client never acked newConsumer, closing it");
            }
        }

        Ok(())
    }

    async fn finish_preferred_layers(&self, consumer: &Consumer) {
        if consumer.kind() == MediaKind::Video && consumer.r#type() == ConsumerType::Simulcast {
            let _ = consumer
                .set_preferred_layers(ConsumerLayers {
                    spatial_layer: 2,
                    temporal_layer: Some(2),
                })
                .await;
        }
    }

    fn wire_consumer(
        &self,
        consumer: Consumer,
        subscriber: String,
        owner: String,
        tag: MediaTag,
    ) -> Consumer {
        let room_weak = self.self_weak.clone();
        let consumer_id = consumer.id();
        {
            let room_weak = room_weak.clone();
            let subscriber = subscriber.clone();
            consumer
                .on_producer_close(move || {
                    let Some(room) = room_weak.upgrade() else {
                        return;
                    };
                    let subscriber = subscriber.clone();
                    tokio::spawn(async move {
                        room.remove_consumer(&subscriber, tag, consumer_id, true)
                            .await;
                    });
                })
                .detach();
        }
        {
            let room_weak = room_weak.clone();
            let subscriber = subscriber.clone();
            consumer
                .on_transport_close(move || {
                    let Some(room) = room_weak.upgrade() else {
                        return;
                    };
                    let subscriber = subscriber.clone();
                    tokio::spawn(async move {
                        room.remove_consumer(&subscriber, tag, consumer_id, false).await;
                    });
                })
                .detach();
        }
        {
            let room_weak = room_weak.clone();
            let subscriber = subscriber.clone();
            let owner = owner.clone();
            consumer
                .on_pause(move || {
                    let Some(room) = room_weak.upgrade() else {
                        return;
                    };
                    let notifier = room.notifier.clone();
                    let session_id = room.session_id.clone();
                    let subscriber = subscriber.clone();
                    let owner = owner.clone();
                    tokio::spawn(async move {
                        notifier
                            .notify(
                                &session_id,
                                &subscriber,
                                "consumerPaused",
                                json!({ "user_id": owner, "tag": tag.as_str() }),
                            )
                            .await;
                    });
                })
                .detach();
        }
        {
            let room_weak = room_weak.clone();
            let subscriber = subscriber.clone();
            let owner = owner.clone();
            consumer
                .on_resume(move || {
                    let Some(room) = room_weak.upgrade() else {
                        return;
                    };
                    let notifier = room.notifier.clone();
                    let session_id = room.session_id.clone();
                    let subscriber = subscriber.clone();
                    let owner = owner.clone();
                    tokio::spawn(async move {
                        notifier
                            .notify(
                                &session_id,
                                &subscriber,
                                "consumerResumed",
                                json!({ "user_id": owner, "tag": tag.as_str() }),
                            )
                            .await;
                    });
                })
                .detach();
        }
        {
            let room_weak = room_weak.clone();
            let subscriber = subscriber.clone();
            let owner = owner.clone();
            consumer
                .on_score(move |score| {
                    let Some(room) = room_weak.upgrade() else {
                        return;
                    };
                    let notifier = room.notifier.clone();
                    let session_id = room.session_id.clone();
                    let subscriber = subscriber.clone();
                    let owner = owner.clone();
                    tokio::spawn(async move {
                        notifier
                            .notify(
                                &session_id,
                                &subscriber,
                                "consumerScore",
                                json!({ "user_id": owner, "tag": tag.as_str(), "score": score }),
                            )
                            .await;
                    });
                })
                .detach();
        }
        {
            let room_weak = room_weak.clone();
            let subscriber = subscriber.clone();
            let owner = owner.clone();
            consumer
                .on_layers_change(move |layers| {
                    let Some(room) = room_weak.upgrade() else {
                        return;
                    };
                    let notifier = room.notifier.clone();
                    let session_id = room.session_id.clone();
                    let subscriber = subscriber.clone();
                    let owner = owner.clone();
                    tokio::spawn(async move {
                        notifier
                            .notify(
                                &session_id,
                                &subscriber,
                                "consumersLayersChanged",
                                json!({ "user_id": owner, "tag": tag.as_str(), "layers": layers }),
                            )
                            .await;
                    });
                })
                .detach();
        }

        consumer
    }

    async fn remove_consumer(
        &self,
        subscriber: &str,
        tag: MediaTag,
        consumer_id: mediasoup::consumer::ConsumerId,
        owner_producer_closed: bool,
    ) {
        let mut guard = self.state.lock().await;
        let Some(participant) = guard.participants.get_mut(subscriber) else {
            return;
        };
        participant
            .consumer_map_mut(tag)
            .retain(|_, c| c.id() != consumer_id);
        drop(guard);

        if owner_producer_closed {
            let payload = json!({ "tag": tag.as_str() });
            self.notifier
                .notify(&self.session_id, subscriber, "mediaProducerClose", payload.clone())
                .await;
            self.notifier
                .notify(&self.session_id, subscriber, "consumerClosed", payload)
                .await;
        }
    }

    /// Pull-consume: the client-initiated, idempotent fallback. Returns the
    /// existing consumer's parameters if one for this producer already
    /// exists rather than creating a duplicate.
    async fn consume(
        &self,
        user_id: &str,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<Value, MediaError> {
        let (owner, tag) = {
            let guard = self.state.lock().await;
            guard
                .producer_owners
                .get(&producer_id.to_string())
                .cloned()
                .ok_or(MediaError::ProducerNotFound)?
        };

        let producer = {
            let guard = self.state.lock().await;
            guard
                .participants
                .get(&owner)
                .and_then(|p| p.producer_slot(tag).clone())
                .ok_or(MediaError::ProducerNotFound)?
        };

        {
            let guard = self.state.lock().await;
            let participant = guard
                .participants
                .get(user_id)
                .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
            if let Some(existing) = participant.consumer_map(tag).get(&producer_id.to_string()) {
                return Ok(json!({
                    "producer_id": producer_id.to_string(),
                    "id": existing.id().to_string(),
                    "kind": existing.kind(),
                    "rtp_parameters": existing.rtp_parameters(),
                    "type": existing.r#type(),
                    "producer_paused": producer.paused(),
                }));
            }
        }

        let (transport, router) = {
            let guard = self.state.lock().await;
            let participant = guard
                .participants
                .get(user_id)
                .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
            let transport = participant
                .consumer_transport
                .clone()
                .ok_or(MediaError::TransportNotFound)?;
            (transport, guard.router.clone())
        };

        if !router.can_consume(&producer_id, &rtp_capabilities) {
            return Err(MediaError::CannotConsume);
        }

        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = producer.paused();
        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| MediaError::Worker(e.to_string()))?;

        self.finish_preferred_layers(&consumer).await;
        let consumer = self.wire_consumer(consumer, user_id.to_string(), owner.clone(), tag);
        if tag == MediaTag::Audio {
            let _ = consumer.set_priority(255).await;
        }
        if consumer.kind() == MediaKind::Video {
            consumer.resume().await.map_err(|e| MediaError::Worker(e.to_string()))?;
        }

        let response = json!({
            "producer_id": producer_id.to_string(),
            "id": consumer.id().to_string(),
            "kind": consumer.kind(),
            "rtp_parameters": consumer.rtp_parameters(),
            "type": consumer.r#type(),
            "producer_paused": producer.paused(),
        });

        let mut guard = self.state.lock().await;
        if let Some(participant) = guard.participants.get_mut(user_id) {
            participant
                .consumer_map_mut(tag)
                .insert(producer_id.to_string(), consumer);
        }

        Ok(response)
    }

    async fn restart_ice(&self, user_id: &str, kind: TransportKind) -> Result<Value, MediaError> {
        let transport = {
            let guard = self.state.lock().await;
            let participant = guard
                .participants
                .get(user_id)
                .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
            let slot = match kind {
                TransportKind::Producer => &participant.producer_transport,
                TransportKind::Consumer => &participant.consumer_transport,
            };
            slot.clone().ok_or(MediaError::TransportNotFound)?
        };

        let ice_parameters = transport
            .restart_ice()
            .await
            .map_err(|e| MediaError::Worker(e.to_string()))?;

        Ok(json!({ "ice_parameters": ice_parameters }))
    }

    async fn request_consumer_key_frame(&self, user_id: &str, consumer_id: &str) -> Result<Value, MediaError> {
        let consumer = self.find_consumer(user_id, consumer_id).await?;
        consumer
            .request_key_frame()
            .await
            .map_err(|e| MediaError::Worker(e.to_string()))?;
        Ok(json!({ "requested": true }))
    }

    async fn find_consumer(&self, user_id: &str, consumer_id: &str) -> Result<Consumer, MediaError> {
        let guard = self.state.lock().await;
        let participant = guard
            .participants
            .get(user_id)
            .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
        for tag in [MediaTag::Audio, MediaTag::Video, MediaTag::Screen] {
            for consumer in participant.consumer_map(tag).values() {
                if consumer.id().to_string() == consumer_id {
                    return Ok(consumer.clone());
                }
            }
        }
        Err(MediaError::ConsumerNotFound)
    }

    async fn get_transport_stats(&self, user_id: &str, kind: TransportKind) -> Result<Value, MediaError> {
        let transport = {
            let guard = self.state.lock().await;
            let participant = guard
                .participants
                .get(user_id)
                .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
            let slot = match kind {
                TransportKind::Producer => &participant.producer_transport,
                TransportKind::Consumer => &participant.consumer_transport,
            };
            slot.clone().ok_or(MediaError::TransportNotFound)?
        };
        let stats = transport
            .get_stats()
            .await
            .map_err(|e| MediaError::Worker(e.to_string()))?;
        serde_json::to_value(stats).map_err(|_| MediaError::Worker("stats serialization failed".to_string()))
    }

    async fn get_producer_stats(&self, user_id: &str, tag: MediaTag) -> Result<Value, MediaError> {
        let producer = {
            let guard = self.state.lock().await;
            let participant = guard
                .participants
                .get(user_id)
                .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
            participant.producer_slot(tag).clone().ok_or(MediaError::ProducerNotFound)?
        };
        let stats = producer
            .get_stats()
            .await
            .map_err(|e| MediaError::Worker(e.to_string()))?;
        serde_json::to_value(stats).map_err(|_| MediaError::Worker("stats serialization failed".to_string()))
    }

    async fn get_consumer_stats(&self, user_id: &str, consumer_id: &str) -> Result<Value, MediaError> {
        let consumer = self.find_consumer(user_id, consumer_id).await?;
        let stats = consumer
            .get_stats()
            .await
            .map_err(|e| MediaError::Worker(e.to_string()))?;
        serde_json::to_value(stats).map_err(|_| MediaError::Worker("stats serialization failed".to_string()))
    }

    async fn get_producer_ids(&self, kind: MediaKind) -> Result<Value, MediaError> {
        let guard = self.state.lock().await;
        let tags: &[MediaTag] = match kind {
            MediaKind::Audio => &[MediaTag::Audio],
            MediaKind::Video => &[MediaTag::Video, MediaTag::Screen],
        };
        let ids: Vec<Value> = guard
            .participants
            .values()
            .flat_map(|p| {
                tags.iter().filter_map(move |tag| {
                    p.producer_slot(*tag)
                        .as_ref()
                        .map(|producer| json!({ "user_id": p.user_id, "tag": tag.as_str(), "producer_id": producer.id().to_string() }))
                })
            })
            .collect();
        Ok(json!({ "producers": ids }))
    }

    async fn producer_close(self: &Arc<Self>, user_id: &str, tag: MediaTag) -> Result<Value, MediaError> {
        let closed = {
            let mut guard = self.state.lock().await;
            let participant = guard
                .participants
                .get_mut(user_id)
                .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;
            let producer = participant.producer_slot_mut(tag).take();
            if tag == MediaTag::Screen {
                participant.screen_sharing = false;
            }
            if let Some(producer) = &producer {
                guard.producer_owners.remove(&producer.id().to_string());
            }
            producer.is_some()
        };

        if closed {
            self.apply_bitrate_governance().await;
            self.notifier
                .broadcast(
                    &self.session_id,
                    Some(user_id),
                    "mediaProducerClose",
                    json!({ "user_id": user_id, "tag": tag.as_str() }),
                )
                .await;
        }

        Ok(json!({ "closed": closed }))
    }

    /// `producerPause`. A locally-initiated (`is_global: false`) pause is a
    /// no-op if the kind is already globally muted: the global mute already
    /// wins, and a local toggle underneath it must not look like it
    /// succeeded. A global pause always wins and always pauses the wire.
    async fn producer_pause(&self, user_id: &str, tag: MediaTag, is_global: bool) -> Result<Value, MediaError> {
        let producer = {
            let participant = self
                .state
                .lock()
                .await;
            let participant = participant
                .participants
                .get(user_id)
                .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;

            if !is_global && !participant.global_enabled(tag) {
                return Ok(json!({ "paused": false, "skipped": true }));
            }
            participant.producer_slot(tag).clone()
        };

        let Some(producer) = producer.filter(|p| !p.paused()) else {
            return Ok(json!({ "paused": false, "skipped": true }));
        };

        producer.pause().await.map_err(|e| MediaError::Worker(e.to_string()))?;

        {
            let mut guard = self.state.lock().await;
            if let Some(participant) = guard.participants.get_mut(user_id) {
                if is_global {
                    match tag {
                        MediaTag::Audio => participant.global_audio_enabled = false,
                        MediaTag::Video => participant.global_video_enabled = false,
                        MediaTag::Screen => {}
                    }
                }
                participant.set_producer_enabled(tag, false);
            }
        }

        self.notifier
            .broadcast(
                &self.session_id,
                Some(user_id),
                "mediaProducerPause",
                json!({ "user_id": user_id, "tag": tag.as_str(), "is_global": is_global }),
            )
            .await;

        Ok(json!({ "paused": true }))
    }

    async fn producer_resume(&self, user_id: &str, tag: MediaTag, is_global: bool) -> Result<Value, MediaError> {
        let (producer, skip) = {
            let mut guard = self.state.lock().await;
            let participant = guard
                .participants
                .get_mut(user_id)
                .ok_or_else(|| MediaError::ParticipantNotFound(user_id.to_string()))?;

            if !is_global && !participant.global_enabled(tag) {
                return Ok(json!({ "resumed": false, "skipped": true }));
            }

            if is_global {
                match tag {
                    MediaTag::Audio => participant.global_audio_enabled = true,
                    MediaTag::Video => participant.global_video_enabled = true,
                    MediaTag::Screen => {}
                }
            }
            participant.set_producer_enabled(tag, true);
            (participant.producer_slot(tag).clone(), false)
        };

        if skip {
            return Ok(json!({ "resumed": false, "skipped": true }));
        }

        let Some(producer) = producer else {
            self.notifier
                .notify(&self.session_id, user_id, "mediaReproduce", json!({ "tag": tag.as_str() }))
                .await;
            return Ok(json!({ "resumed": false, "reproduce": true }));
        };

        producer.resume().await.map_err(|e| MediaError::Worker(e.to_string()))?;

        self.notifier
            .broadcast(
                &self.session_id,
                Some(user_id),
                "mediaProducerResume",
                json!({ "user_id": user_id, "tag": tag.as_str(), "is_global": is_global }),
            )
            .await;

        Ok(json!({ "resumed": true }))
    }

    /// Tags a `MediaKind` maps onto for the bulk `allProducer*` actions:
    /// audio only ever touches the audio slot, video touches both the
    /// camera and screen-share slots.
    fn tags_for_kind(kind: MediaKind) -> &'static [MediaTag] {
        match kind {
            MediaKind::Audio => &[MediaTag::Audio],
            MediaKind::Video => &[MediaTag::Video, MediaTag::Screen],
        }
    }

    /// `allProducerClose`: iterates every participant in the room, closing
    /// their producer(s) of `kind`. Closed producers belonging to someone
    /// other than the caller are a reproduce hint to their own owner.
    async fn all_producer_close(self: &Arc<Self>, kind: MediaKind) -> Result<Value, MediaError> {
        let targets: Vec<(String, MediaTag)> = {
            let guard = self.state.lock().await;
            guard
                .participants
                .values()
                .flat_map(|p| {
                    Self::tags_for_kind(kind)
                        .iter()
                        .filter(move |tag| p.producer_slot(**tag).is_some())
                        .map(move |tag| (p.user_id.clone(), *tag))
                })
                .collect()
        };
        for (user_id, tag) in targets {
            self.producer_close(&user_id, tag).await?;
            self.notifier
                .notify(&self.session_id, &user_id, "mediaReproduce", json!({ "tag": tag.as_str() }))
                .await;
        }
        Ok(json!({ "closed": true }))
    }

    async fn all_producer_pause(&self, kind: MediaKind, is_global: bool) -> Result<Value, MediaError> {
        let targets: Vec<String> = {
            let guard = self.state.lock().await;
            guard.participants.keys().cloned().collect()
        };
        for user_id in targets {
            for tag in Self::tags_for_kind(kind) {
                self.producer_pause(&user_id, *tag, is_global).await?;
            }
        }
        Ok(json!({ "paused": true }))
    }

    async fn all_producer_resume(&self, kind: MediaKind, is_global: bool) -> Result<Value, MediaError> {
        let targets: Vec<String> = {
            let guard = self.state.lock().await;
            guard.participants.keys().cloned().collect()
        };
        for user_id in targets {
            for tag in Self::tags_for_kind(kind) {
                self.producer_resume(&user_id, *tag, is_global).await?;
            }
        }
        Ok(json!({ "resumed": true }))
    }

    /// Recomputes and applies the incoming bitrate cap on every live
    /// producer-side transport in the room. Cheap enough to call
    /// after every topology change; mediasoup no-ops a repeated identical
    /// cap.
    async fn apply_bitrate_governance(&self) {
        let guard = self.state.lock().await;
        let producer_count: u32 = guard
            .participants
            .values()
            .map(|p| p.producer_count() as u32)
            .sum();

        let cap = crate::bitrate::compute_max_incoming_bitrate(
            producer_count,
            self.transport_config.maximum_available_outgoing_bitrate,
            self.transport_config.minimum_available_outgoing_bitrate,
            self.transport_config.factor_incoming_bitrate,
        );
        let cap = self.transport_config.max_incoming_bitrate_override.unwrap_or(cap);

        let transports: Vec<WebRtcTransport> = guard
            .participants
            .values()
            .filter_map(|p| p.producer_transport.clone())
            .collect();
        drop(guard);

        for transport in transports {
            if let Err(err) = transport.set_max_incoming_bitrate(cap).await {
                warn!(%err, "failed to apply incoming bitrate cap");
            }
        }
    }
}
