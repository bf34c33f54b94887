use mediasoup::rtp_parameters::{
    MimeTypeAudio, MimeTypeVideo, RtcpFeedback, RtpCodecCapability, RtpCodecParametersParameters,
};
use meshcast_config::MediaCodecSettings;
use std::num::NonZeroU8;
use std::num::NonZeroU32;

/// Translates configured codec entries into the capability list a router is
/// created with. Order is preserved; it determines payload type preference.
pub fn build_media_codecs(settings: &[MediaCodecSettings]) -> Vec<RtpCodecCapability> {
    settings
        .iter()
        .filter_map(|codec| build_one(codec))
        .collect()
}

fn build_one(codec: &MediaCodecSettings) -> Option<RtpCodecCapability> {
    let clock_rate = NonZeroU32::new(codec.clock_rate)?;
    let parameters = parameters_from_map(codec);

    match codec.kind.as_str() {
        "audio" => {
            let mime_type = audio_mime_type(&codec.mime_type)?;
            let channels = NonZeroU8::new(codec.channels.unwrap_or(2))?;
            Some(RtpCodecCapability::Audio {
                mime_type,
                preferred_payload_type: None,
                clock_rate,
                channels,
                parameters,
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            })
        }
        "video" => {
            let mime_type = video_mime_type(&codec.mime_type)?;
            Some(RtpCodecCapability::Video {
                mime_type,
                preferred_payload_type: None,
                clock_rate,
                parameters,
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            })
        }
        _ => None,
    }
}

fn parameters_from_map(codec: &MediaCodecSettings) -> RtpCodecParametersParameters {
    let mut params = RtpCodecParametersParameters::default();
    for (key, value) in &codec.parameters {
        if let Some(n) = value.as_u64() {
            params.insert(key.clone(), (n as u32).into());
        } else if let Some(s) = value.as_str() {
            params.insert(key.clone(), s.into());
        }
    }
    params
}

fn audio_mime_type(mime: &str) -> Option<MimeTypeAudio> {
    match mime.to_ascii_lowercase().as_str() {
        "audio/opus" => Some(MimeTypeAudio::Opus),
        _ => None,
    }
}

fn video_mime_type(mime: &str) -> Option<MimeTypeVideo> {
    match mime.to_ascii_lowercase().as_str() {
        "video/vp8" => Some(MimeTypeVideo::Vp8),
        "video/vp9" => Some(MimeTypeVideo::Vp9),
        "video/h264" => Some(MimeTypeVideo::H264),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn builds_opus_and_video_codecs_in_order() {
        let settings = vec![
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
        ];

        let codecs = build_media_codecs(&settings);
        assert_eq!(codecs.len(), 2);
        assert!(matches!(codecs[0], RtpCodecCapability::Audio { .. }));
        assert!(matches!(codecs[1], RtpCodecCapability::Video { .. }));
    }

    #[test]
    fn skips_unrecognized_codecs() {
        let settings = vec![MediaCodecSettings {
            kind: "audio".to_string(),
            mime_type: "audio/g722".to_string(),
            clock_rate: 8_000,
            channels: Some(1),
            parameters: BTreeMap::new(),
        }];
        assert!(build_media_codecs(&settings).is_empty());
    }
}
