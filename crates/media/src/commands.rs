use mediasoup::data_structures::DtlsParameters;
use mediasoup::producer::ProducerId;
use mediasoup::rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters};
use serde::Deserialize;
use serde_json::Value;

use crate::participant::{MediaTag, TransportKind};

/// The four enable flags `joinRoom` seeds onto a participant (§4.2):
/// per-user publish intent for audio/video, plus the room-scoped global
/// mute for each. All default to enabled so a client that omits a field
/// doesn't accidentally start muted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerCapabilities {
    #[serde(default = "default_true")]
    pub producer_audio_enabled: bool,
    #[serde(default = "default_true")]
    pub producer_video_enabled: bool,
    #[serde(default = "default_true")]
    pub global_audio_enabled: bool,
    #[serde(default = "default_true")]
    pub global_video_enabled: bool,
}

impl Default for ProducerCapabilities {
    fn default() -> Self {
        Self {
            producer_audio_enabled: true,
            producer_video_enabled: true,
            global_audio_enabled: true,
            global_video_enabled: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// The closed set of `speakMsClient` actions. A sum type plus an
/// exhaustive match in [`crate::room::Room::dispatch`], not a dynamic action
/// name -> handler map: a new action is a new variant, not a new string that
/// could silently go unhandled.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "camelCase")]
pub enum MediaAction {
    GetRouterRtpCapabilities,

    CreateWebRtcTransport {
        transport_kind: TransportKindWire,
    },
    ConnectWebRtcTransport {
        transport_kind: TransportKindWire,
        dtls_parameters: DtlsParameters,
    },

    Produce {
        kind: MediaKindWire,
        tag: MediaTagWire,
        rtp_parameters: RtpParameters,
    },
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },

    RestartIce {
        transport_kind: TransportKindWire,
    },
    RequestConsumerKeyFrame {
        consumer_id: String,
    },

    GetTransportStats {
        transport_kind: TransportKindWire,
    },
    GetProducerStats {
        tag: MediaTagWire,
    },
    GetConsumerStats {
        consumer_id: String,
    },

    GetAudioProducerIds,
    GetVideoProducerIds,

    ProducerClose {
        tag: MediaTagWire,
    },
    ProducerPause {
        tag: MediaTagWire,
        #[serde(default)]
        is_global: bool,
    },
    ProducerResume {
        tag: MediaTagWire,
        #[serde(default)]
        is_global: bool,
    },

    AllProducerClose {
        kind: MediaKindWire,
    },
    AllProducerPause {
        kind: MediaKindWire,
        #[serde(default)]
        is_global: bool,
    },
    AllProducerResume {
        kind: MediaKindWire,
        #[serde(default)]
        is_global: bool,
    },
}

impl MediaAction {
    /// Parses a `speakMsClient` payload of shape `{ action, data }` into a
    /// typed command. Unknown `action` strings produce
    /// `MediaError::UnknownAction` at the call site rather than here, since
    /// serde reports them as a generic deserialize failure.
    pub fn from_payload(payload: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(payload)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKindWire {
    Producer,
    Consumer,
}

impl From<TransportKindWire> for TransportKind {
    fn from(value: TransportKindWire) -> Self {
        match value {
            TransportKindWire::Producer => TransportKind::Producer,
            TransportKindWire::Consumer => TransportKind::Consumer,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKindWire {
    Audio,
    Video,
}

impl MediaKindWire {
    pub fn as_media_kind(self) -> MediaKind {
        match self {
            MediaKindWire::Audio => MediaKind::Audio,
            MediaKindWire::Video => MediaKind::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaTagWire {
    Audio,
    Video,
    #[serde(rename = "screen-media")]
    ScreenMedia,
}

impl From<MediaTagWire> for MediaTag {
    fn from(value: MediaTagWire) -> Self {
        match value {
            MediaTagWire::Audio => MediaTag::Audio,
            MediaTagWire::Video => MediaTag::Video,
            MediaTagWire::ScreenMedia => MediaTag::Screen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_zero_argument_actions() {
        let payload = serde_json::json!({ "action": "getRouterRtpCapabilities" });
        assert!(matches!(
            MediaAction::from_payload(payload).unwrap(),
            MediaAction::GetRouterRtpCapabilities
        ));
    }

    #[test]
    fn parses_producer_pause_with_default_is_global() {
        let payload = serde_json::json!({
            "action": "producerPause",
            "data": { "tag": "audio" }
        });
        match MediaAction::from_payload(payload).unwrap() {
            MediaAction::ProducerPause { tag, is_global } => {
                assert!(matches!(tag, MediaTagWire::Audio));
                assert!(!is_global);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_action_names() {
        let payload = serde_json::json!({ "action": "doSomethingElse" });
        assert!(MediaAction::from_payload(payload).is_err());
    }
}
