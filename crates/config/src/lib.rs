mod settings;

pub use settings::{
    AppSettings, ListenIpSettings, MediaCodecSettings, RouterSettings, Settings,
    WebRtcTransportSettings, WorkerPoolSettings,
};
