pub mod bitrate;
pub mod codecs;
pub mod commands;
pub mod error;
pub mod notify;
pub mod participant;
pub mod registry;
pub mod room;
pub mod transport;
pub mod worker_pool;

pub use commands::{MediaAction, ProducerCapabilities};
pub use error::{MediaError, RoomInitError, WorkerInitError};
pub use notify::{NullNotifier, RoomNotifier};
pub use participant::{MediaTag, Participant, TransportKind};
pub use registry::RoomRegistry;
pub use room::Room;
pub use transport::TransportConfig;
pub use worker_pool::{WorkerLoad, WorkerPool};
