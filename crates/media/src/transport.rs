use std::net::IpAddr;
use std::str::FromStr;

use mediasoup::data_structures::ListenInfo;
use mediasoup::router::Router;
use mediasoup::sctp_parameters::NumSctpStreams;
use mediasoup::transport::Protocol;
use mediasoup::webrtc_transport::{
    WebRtcTransport, WebRtcTransportListenInfos, WebRtcTransportOptions,
};
use meshcast_config::WebRtcTransportSettings;

/// Resolved, router-independent copy of `webrtc_transport` settings, cheap
/// to clone into every `Room`.
#[derive(Clone)]
pub struct TransportConfig {
    listen_ips: Vec<(IpAddr, Option<String>)>,
    pub initial_available_outgoing_bitrate: u32,
    pub minimum_available_outgoing_bitrate: u32,
    pub maximum_available_outgoing_bitrate: u32,
    pub factor_incoming_bitrate: u32,
    pub max_sctp_message_size: Option<u32>,
    pub max_incoming_bitrate_override: Option<u32>,
}

impl TransportConfig {
    pub fn new(settings: &WebRtcTransportSettings) -> Self {
        let listen_ips = settings
            .listen_ips
            .iter()
            .filter_map(|entry| {
                IpAddr::from_str(&entry.ip)
                    .ok()
                    .map(|ip| (ip, entry.announced_ip.clone()))
            })
            .collect::<Vec<_>>();

        let listen_ips = if listen_ips.is_empty() {
            vec![(IpAddr::from_str("0.0.0.0").unwrap(), None)]
        } else {
            listen_ips
        };

        Self {
            listen_ips,
            initial_available_outgoing_bitrate: settings.initial_available_outgoing_bitrate,
            minimum_available_outgoing_bitrate: settings.minimum_available_outgoing_bitrate,
            maximum_available_outgoing_bitrate: settings.maximum_available_outgoing_bitrate,
            factor_incoming_bitrate: settings.factor_incoming_bitrate.max(1),
            max_sctp_message_size: settings.max_sctp_message_size,
            max_incoming_bitrate_override: settings.max_incoming_bitrate,
        }
    }

    /// Creates one WebRTC transport: UDP preferred, TCP as fallback, SCTP
    /// enabled for the data channel.
    pub async fn create_transport(
        &self,
        router: &Router,
    ) -> Result<WebRtcTransport, mediasoup::messages::RequestError> {
        let mut listen_infos: Option<WebRtcTransportListenInfos> = None;
        for (ip, announced_ip) in &self.listen_ips {
            for protocol in [Protocol::Udp, Protocol::Tcp] {
                let info = ListenInfo {
                    protocol,
                    ip: *ip,
                    announced_address: announced_ip.clone(),
                    port: None,
                    port_range: None,
                    flags: None,
                    send_buffer_size: None,
                    recv_buffer_size: None,
                    expose_internal_ip: false,
                };
                listen_infos = Some(match listen_infos {
                    None => WebRtcTransportListenInfos::new(info),
                    Some(infos) => infos.insert(info),
                });
            }
        }

        let mut options = WebRtcTransportOptions::new(
            listen_infos.expect("at least one listen ip is always configured"),
        );
        options.enable_udp = true;
        options.enable_tcp = true;
        options.prefer_udp = true;
        options.initial_available_outgoing_bitrate = self.initial_available_outgoing_bitrate;
        if let Some(max_message_size) = self.max_sctp_message_size {
            options.enable_sctp = true;
            options.num_sctp_streams = NumSctpStreams::default();
            options.max_sctp_message_size = max_message_size;
        }

        router.create_webrtc_transport(options).await
    }
}
