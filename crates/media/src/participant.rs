use std::collections::HashMap;
use std::fmt;

use mediasoup::consumer::Consumer;
use mediasoup::producer::Producer;
use mediasoup::rtp_parameters::RtpCapabilities;
use mediasoup::webrtc_transport::WebRtcTransport;

/// Selects which of the three producer slots / consumer maps an operation
/// targets. Named `media_tag` in the wire protocol (`"audio"`, `"video"`,
/// `"screen-media"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaTag {
    Audio,
    Video,
    Screen,
}

impl MediaTag {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaTag::Audio => "audio",
            MediaTag::Video => "video",
            MediaTag::Screen => "screen-media",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "audio" => Some(MediaTag::Audio),
            "video" => Some(MediaTag::Video),
            "screen-media" => Some(MediaTag::Screen),
            _ => None,
        }
    }
}

impl fmt::Display for MediaTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which transport kind this connection negotiated at handshake time
/// (`addClient.query.kind`). Orthogonal to which producer/consumer slots end
/// up populated — both transports may still be created regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Producer,
    Consumer,
}

impl TransportKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "producer" => Some(TransportKind::Producer),
            "consumer" => Some(TransportKind::Consumer),
            _ => None,
        }
    }
}

/// Per-user state inside a room (§3). Created by `addClient`, not yet
/// `joined` until `joinRoom` runs. Owns every mediasoup handle that belongs
/// to this user; tearing a participant down closes them in a fixed order:
/// producers, then consumers, then transports.
pub struct Participant {
    pub user_id: String,
    pub device: String,
    pub transport_kind: TransportKind,
    pub rtp_capabilities: Option<RtpCapabilities>,
    pub joined: bool,

    pub producer_transport: Option<WebRtcTransport>,
    pub consumer_transport: Option<WebRtcTransport>,

    producer_audio: Option<Producer>,
    producer_video: Option<Producer>,
    producer_screen: Option<Producer>,

    consumers_audio: HashMap<String, Consumer>,
    consumers_video: HashMap<String, Consumer>,
    consumers_screen: HashMap<String, Consumer>,

    pub producer_audio_enabled: bool,
    pub producer_video_enabled: bool,
    pub global_audio_enabled: bool,
    pub global_video_enabled: bool,
    pub screen_sharing: bool,
}

impl Participant {
    pub fn new(user_id: String, device: String, transport_kind: TransportKind) -> Self {
        Self {
            user_id,
            device,
            transport_kind,
            rtp_capabilities: None,
            joined: false,
            producer_transport: None,
            consumer_transport: None,
            producer_audio: None,
            producer_video: None,
            producer_screen: None,
            consumers_audio: HashMap::new(),
            consumers_video: HashMap::new(),
            consumers_screen: HashMap::new(),
            producer_audio_enabled: true,
            producer_video_enabled: true,
            global_audio_enabled: true,
            global_video_enabled: true,
            screen_sharing: false,
        }
    }

    pub fn producer_slot(&self, tag: MediaTag) -> &Option<Producer> {
        match tag {
            MediaTag::Audio => &self.producer_audio,
            MediaTag::Video => &self.producer_video,
            MediaTag::Screen => &self.producer_screen,
        }
    }

    pub fn producer_slot_mut(&mut self, tag: MediaTag) -> &mut Option<Producer> {
        match tag {
            MediaTag::Audio => &mut self.producer_audio,
            MediaTag::Video => &mut self.producer_video,
            MediaTag::Screen => &mut self.producer_screen,
        }
    }

    pub fn consumer_map(&self, tag: MediaTag) -> &HashMap<String, Consumer> {
        match tag {
            MediaTag::Audio => &self.consumers_audio,
            MediaTag::Video => &self.consumers_video,
            MediaTag::Screen => &self.consumers_screen,
        }
    }

    pub fn consumer_map_mut(&mut self, tag: MediaTag) -> &mut HashMap<String, Consumer> {
        match tag {
            MediaTag::Audio => &mut self.consumers_audio,
            MediaTag::Video => &mut self.consumers_video,
            MediaTag::Screen => &mut self.consumers_screen,
        }
    }

    pub fn producer_enabled(&self, tag: MediaTag) -> bool {
        match tag {
            MediaTag::Audio => self.producer_audio_enabled,
            MediaTag::Video => self.producer_video_enabled,
            MediaTag::Screen => true,
        }
    }

    pub fn set_producer_enabled(&mut self, tag: MediaTag, enabled: bool) {
        match tag {
            MediaTag::Audio => self.producer_audio_enabled = enabled,
            MediaTag::Video => self.producer_video_enabled = enabled,
            MediaTag::Screen => {}
        }
    }

    pub fn global_enabled(&self, tag: MediaTag) -> bool {
        match tag {
            MediaTag::Audio => self.global_audio_enabled,
            MediaTag::Video => self.global_video_enabled,
            MediaTag::Screen => true,
        }
    }

    /// Every currently-live producer on this participant, tagged.
    pub fn live_producers(&self) -> Vec<(MediaTag, &Producer)> {
        [
            (MediaTag::Audio, &self.producer_audio),
            (MediaTag::Video, &self.producer_video),
            (MediaTag::Screen, &self.producer_screen),
        ]
        .into_iter()
        .filter_map(|(tag, slot)| slot.as_ref().map(|p| (tag, p)))
        .collect()
    }

    pub fn producer_count(&self) -> usize {
        self.live_producers().len()
    }

    /// Tears this participant's media down in the order the invariants
    /// require: producers, then consumers, then transports. Dropping a
    /// mediasoup handle is what actually closes it worker-side.
    pub fn teardown(&mut self) {
        self.producer_audio.take();
        self.producer_video.take();
        self.producer_screen.take();
        self.screen_sharing = false;

        self.consumers_audio.clear();
        self.consumers_video.clear();
        self.consumers_screen.clear();

        self.producer_transport.take();
        self.consumer_transport.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_participant_is_not_joined_and_has_no_media() {
        let p = Participant::new("u1".into(), "web".into(), TransportKind::Producer);
        assert!(!p.joined);
        assert_eq!(p.producer_count(), 0);
        assert!(!p.screen_sharing);
    }

    #[test]
    fn media_tag_round_trips_through_wire_strings() {
        for tag in [MediaTag::Audio, MediaTag::Video, MediaTag::Screen] {
            assert_eq!(MediaTag::parse(tag.as_str()), Some(tag));
        }
        assert_eq!(MediaTag::parse("bogus"), None);
    }
}
