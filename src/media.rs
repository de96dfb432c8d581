//! WebRTC engine construction: codecs, header extensions, ICE servers.

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};

pub fn create_webrtc_api() -> API {
    let mut media_engine = MediaEngine::default();

    // Opus with FEC and low latency settings
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    ..Default::default()
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .unwrap_or_else(|e| {
            panic!("Failed to register Opus codec: {}", e);
        });

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "video/VP8".to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "".to_owned(),
                    ..Default::default()
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .unwrap_or_else(|e| {
            panic!("Failed to register VP8 codec: {}", e);
        });

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "video/H264".to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line:
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                            .to_owned(),
                    ..Default::default()
                },
                payload_type: 102,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .unwrap_or_else(|e| {
            panic!("Failed to register H264 codec: {}", e);
        });

    // The mid / rtp-stream-id extensions are what lets the engine
    // demultiplex simulcast layers onto distinct remote tracks.
    let extensions = vec![
        "urn:ietf:params:rtp-hdrext:sdes:mid",
        "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id",
        "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id",
        "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
        "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
        "urn:ietf:params:rtp-hdrext:ssrc-audio-level",
        "urn:ietf:params:rtp-hdrext:toffset",
        "urn:3gpp:video-orientation",
    ];

    for extension in extensions {
        let _ = media_engine.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: extension.to_string(),
            },
            RTPCodecType::Video,
            None,
        );
        let _ = media_engine.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: extension.to_string(),
            },
            RTPCodecType::Audio,
            None,
        );
    }

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).unwrap();

    APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build()
}

pub fn rtc_config(stun_servers: &[String]) -> RTCConfiguration {
    let ice_servers = if stun_servers.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls: stun_servers.to_vec(),
            ..Default::default()
        }]
    };
    RTCConfiguration {
        ice_servers,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    #[tokio::test]
    async fn test_api_creates_peer_connections() {
        let api = create_webrtc_api();
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        pc.close().await.unwrap();
    }

    #[test]
    fn test_rtc_config_carries_stun_servers() {
        let config = rtc_config(&["stun:stun.example.org:3478".to_string()]);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls[0], "stun:stun.example.org:3478");
    }
}
