use thiserror::Error;

/// Fatal to the worker pool / process startup. Partial pools are never
/// accepted: if any worker fails to spawn, the whole pool init fails.
#[derive(Debug, Error)]
pub enum WorkerInitError {
    #[error("failed to spawn mediasoup worker {index}: {message}")]
    Spawn { index: u32, message: String },
}

/// Aborts a single room admission without affecting the pool or other rooms.
#[derive(Debug, Error)]
pub enum RoomInitError {
    #[error("failed to create router: {0}")]
    Router(String),
    #[error("failed to create audio level observer: {0}")]
    AudioObserver(String),
}

/// Errors returned on the per-request channel as `{ "error": ... }`. Never
/// disconnects the socket; see the taxonomy in the design notes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("participant '{0}' already exists in this room")]
    DuplicateParticipant(String),
    #[error("participant '{0}' has already joined")]
    AlreadyJoined(String),
    #[error("participant '{0}' not found")]
    ParticipantNotFound(String),
    #[error("transport not found")]
    TransportNotFound,
    #[error("producer not found")]
    ProducerNotFound,
    #[error("consumer not found")]
    ConsumerNotFound,
    #[error("cannot consume: capability mismatch or missing producer")]
    CannotConsume,
    #[error("room is reconfiguring onto a different worker")]
    RoomReconfiguring,
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("request timed out waiting for client ack")]
    RequestTimeout,
    #[error("room not found")]
    RoomNotFound,
    #[error("mediasoup request failed: {0}")]
    Worker(String),
}
