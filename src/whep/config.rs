//! WebRTC configuration for WHEP playback

use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;

use crate::config::ConnectionConfig;

/// Public STUN servers - Google and Cloudflare, no TURN
pub mod public_ice {
    pub const GOOGLE_STUN: &[&str] = &[
        "stun:stun.l.google.com:19302",
        "stun:stun1.l.google.com:19302",
    ];

    pub const CLOUDFLARE_STUN: &str = "stun:stun.cloudflare.com:3478";

    /// All public STUN servers, Google first
    pub fn stun_servers() -> Vec<String> {
        GOOGLE_STUN
            .iter()
            .copied()
            .chain(std::iter::once(CLOUDFLARE_STUN))
            .map(String::from)
            .collect()
    }
}

/// Default STUN list used when the config does not name any
pub fn default_stun_servers() -> Vec<String> {
    public_ice::stun_servers()
}

/// Peer connection settings derived from the connection config
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// Upper bound for ICE candidate gathering before the offer is sent
    pub gathering_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            gathering_timeout: Duration::from_millis(2000),
        }
    }
}

impl PeerConfig {
    pub fn from_connection(config: &ConnectionConfig) -> Self {
        let stun_servers = if config.stun_servers.is_empty() {
            default_stun_servers()
        } else {
            config.stun_servers.clone()
        };

        Self {
            stun_servers,
            ..Default::default()
        }
    }

    /// Build the webrtc-rs configuration: STUN only, media lines bundled
    pub fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            ..Default::default()
        }
    }
}
