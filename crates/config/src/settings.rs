use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level configuration for the signaling core.
///
/// Loaded once at startup from `config/default.{toml,yaml,json}`, optionally
/// overlaid with `config/local.*`, then overlaid again with `MESHCAST__*`
/// environment variables. Nothing here is re-read after [`Settings::load`]
/// returns; a config change requires a restart.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub app: AppSettings,
    pub worker_pool: WorkerPoolSettings,
    pub router: RouterSettings,
    pub webrtc_transport: WebRtcTransportSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// `worker = { rtc_min_port, rtc_max_port, log_level, log_tags, ... }` from the spec.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerPoolSettings {
    /// Number of mediasoup worker processes to spawn. `None` means "CPU count".
    #[serde(default)]
    pub size: Option<u32>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_tags")]
    pub log_tags: Vec<String>,
    #[serde(default)]
    pub dtls_certificate_file: Option<String>,
    #[serde(default)]
    pub dtls_private_key_file: Option<String>,
}

impl WorkerPoolSettings {
    /// Resolves [`Self::size`] against the host's CPU count.
    pub fn resolved_size(&self) -> u32 {
        self.size.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        })
    }
}

/// `router.media_codecs` — ordered, sent to every worker when a router is created.
#[derive(Debug, Deserialize, Clone)]
pub struct RouterSettings {
    #[serde(default = "default_media_codecs")]
    pub media_codecs: Vec<MediaCodecSettings>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MediaCodecSettings {
    pub kind: String,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default)]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ListenIpSettings {
    pub ip: String,
    #[serde(default)]
    pub announced_ip: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebRtcTransportSettings {
    #[serde(default = "default_listen_ips")]
    pub listen_ips: Vec<ListenIpSettings>,
    pub initial_available_outgoing_bitrate: u32,
    pub minimum_available_outgoing_bitrate: u32,
    pub maximum_available_outgoing_bitrate: u32,
    pub factor_incoming_bitrate: u32,
    #[serde(default)]
    pub max_sctp_message_size: Option<u32>,
    #[serde(default)]
    pub max_incoming_bitrate: Option<u32>,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::default()
                    .separator("__")
                    .prefix("MESHCAST"),
            )
            .set_default("app.host", "0.0.0.0")?
            .set_default("app.port", 3000)?
            .set_default("worker_pool.rtc_min_port", 40000)?
            .set_default("worker_pool.rtc_max_port", 49999)?
            .set_default(
                "webrtc_transport.initial_available_outgoing_bitrate",
                600_000,
            )?
            .set_default(
                "webrtc_transport.minimum_available_outgoing_bitrate",
                100_000,
            )?
            .set_default(
                "webrtc_transport.maximum_available_outgoing_bitrate",
                5_000_000,
            )?
            .set_default("webrtc_transport.factor_incoming_bitrate", 2)?
            .build()?;

        config.try_deserialize()
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_tags() -> Vec<String> {
    ["info", "ice", "dtls", "rtp", "srtp", "rtcp"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_listen_ips() -> Vec<ListenIpSettings> {
    vec![ListenIpSettings {
        ip: "0.0.0.0".to_string(),
        announced_ip: None,
    }]
}

/// Opus audio plus VP8/H264 video, matching the codec set every mediasoup
/// router in this deployment advertises unless overridden in `config/*`.
fn default_media_codecs() -> Vec<MediaCodecSettings> {
    let mut h264_params = BTreeMap::new();
    h264_params.insert("level-asymmetry-allowed".to_string(), 1.into());
    h264_params.insert("packetization-mode".to_string(), 1.into());
    h264_params.insert("profile-level-id".to_string(), "42e01f".into());

    vec![
        MediaCodecSettings {
            kind: "audio".to_string(),
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
            parameters: BTreeMap::new(),
        },
        MediaCodecSettings {
            kind: "video".to_string(),
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: BTreeMap::new(),
        },
        MediaCodecSettings {
            kind: "video".to_string(),
            mime_type: "video/H264".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: h264_params,
        },
    ]
}
