//! WebRTC peer connection management (receive-only)

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use super::config::PeerConfig;
use super::signaling::{SdpAnswer, SdpOffer};
use super::sink::VideoSink;
use super::state::{Failure, FailureKind};
use crate::error::{AppError, Result};

/// Link state reported by a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    New,
    Checking,
    /// ICE connected or completed
    Connected,
    /// ICE disconnected/failed or peer connection failed
    Failed(Failure),
    Closed,
}

/// Map an ICE state change to a link state; `None` means no change
pub fn link_from_ice(state: RTCIceConnectionState) -> Option<LinkState> {
    match state {
        RTCIceConnectionState::Checking => Some(LinkState::Checking),
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            Some(LinkState::Connected)
        }
        RTCIceConnectionState::Disconnected => Some(LinkState::Failed(Failure::new(
            FailureKind::Ice,
            "ICE disconnected",
        ))),
        RTCIceConnectionState::Failed => Some(LinkState::Failed(Failure::new(
            FailureKind::Ice,
            "ICE failed",
        ))),
        _ => None,
    }
}

/// Map a peer connection state change to a link state
pub fn link_from_peer(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::Failed => Some(LinkState::Failed(Failure::new(
            FailureKind::Peer,
            "peer connection failed",
        ))),
        _ => None,
    }
}

/// One receive-only media session as seen by the controller
#[async_trait]
pub trait MediaPeer: Send + Sync {
    /// Create the local offer and set it as local description
    async fn create_offer(&self) -> Result<SdpOffer>;

    /// Apply the server's answer as remote description
    async fn apply_answer(&self, answer: &SdpAnswer) -> Result<()>;

    /// Link state notifications
    fn link_state(&self) -> watch::Receiver<LinkState>;

    /// Release the connection and detach the sink; idempotent
    async fn close(&self);
}

/// Creates a fresh peer per connection attempt
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, session_id: &str, sink: Arc<dyn VideoSink>) -> Result<Arc<dyn MediaPeer>>;
}

/// Receive-only peer connection wrapper
pub struct PeerConnection {
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    sink: Arc<dyn VideoSink>,
    /// Sink attachment generation owned by this peer
    attachment: Arc<Mutex<Option<u64>>>,
    state: Arc<watch::Sender<LinkState>>,
    state_rx: watch::Receiver<LinkState>,
    first_frame_at: Arc<Mutex<Option<Instant>>>,
    closed: Arc<AtomicBool>,
    gathering_timeout: Duration,
}

impl PeerConnection {
    /// Create a peer with one recvonly video transceiver
    pub async fn new(config: &PeerConfig, session_id: String, sink: Arc<dyn VideoSink>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = api
            .new_peer_connection(config.rtc_configuration())
            .await
            .map_err(|e| {
                AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
            })?;
        let pc = Arc::new(pc);

        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(|e| AppError::WebRtcError(format!("Failed to add video transceiver: {}", e)))?;

        let (state_tx, state_rx) = watch::channel(LinkState::New);

        let peer = Self {
            session_id,
            pc,
            sink,
            attachment: Arc::new(Mutex::new(None)),
            state: Arc::new(state_tx),
            state_rx,
            first_frame_at: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            gathering_timeout: config.gathering_timeout,
        };

        peer.setup_event_handlers();

        Ok(peer)
    }

    fn setup_event_handlers(&self) {
        // ICE connection state
        let state = self.state.clone();
        let session_id = self.session_id.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                let state = state.clone();
                let session_id = session_id.clone();
                Box::pin(async move {
                    debug!("Peer {} ICE state: {}", session_id, s);
                    if let Some(link) = link_from_ice(s) {
                        update_link(&state, link);
                    }
                })
            }));

        // Peer connection state
        let state = self.state.clone();
        let session_id = self.session_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = state.clone();
                let session_id = session_id.clone();
                Box::pin(async move {
                    info!("Peer {} connection state: {}", session_id, s);
                    if let Some(link) = link_from_peer(s) {
                        update_link(&state, link);
                    }
                })
            }));

        // Remote track -> sink
        let sink = self.sink.clone();
        let attachment = self.attachment.clone();
        let first_frame_at = self.first_frame_at.clone();
        let closed = self.closed.clone();
        let session_id = self.session_id.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                // Checked under the attachment lock so close() cannot race an attach
                let mut owned = attachment.lock();
                if closed.load(Ordering::SeqCst) {
                    debug!("Peer {}: track arrived after close, dropped", session_id);
                } else if track.kind() != RTPCodecType::Video {
                    debug!("Peer {}: ignoring {} track", session_id, track.kind());
                } else {
                    info!(
                        "Peer {}: received video track {} ({})",
                        session_id,
                        track.id(),
                        track.codec().capability.mime_type
                    );
                    *owned = Some(sink.attach(track));
                    first_frame_at.lock().get_or_insert_with(Instant::now);
                }
                drop(owned);

                Box::pin(async {})
            },
        ));
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// When the remote track was attached to the sink
    pub fn first_frame_at(&self) -> Option<Instant> {
        *self.first_frame_at.lock()
    }
}

/// Apply a link update unless the peer is already closed or failed
fn update_link(state: &watch::Sender<LinkState>, link: LinkState) {
    state.send_if_modified(|current| {
        if matches!(current, LinkState::Closed | LinkState::Failed(_)) || *current == link {
            return false;
        }
        *current = link;
        true
    });
}

#[async_trait]
impl MediaPeer for PeerConnection {
    async fn create_offer(&self) -> Result<SdpOffer> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create offer: {}", e)))?;

        // WHEP has no trickle here: wait for candidates so they ride in the offer
        let mut gathering = self.pc.gathering_complete_promise().await;

        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))?;

        if tokio::time::timeout(self.gathering_timeout, gathering.recv())
            .await
            .is_err()
        {
            debug!(
                "Peer {}: ICE gathering not complete after {:?}, sending partial offer",
                self.session_id, self.gathering_timeout
            );
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| AppError::WebRtcError("No local description".to_string()))?;

        Ok(SdpOffer::new(local.sdp))
    }

    async fn apply_answer(&self, answer: &SdpAnswer) -> Result<()> {
        let sdp = RTCSessionDescription::answer(answer.sdp.clone())
            .map_err(|e| AppError::WebRtcError(format!("Invalid SDP answer: {}", e)))?;

        self.pc.set_remote_description(sdp).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to set remote description: {}", e))
        })?;

        Ok(())
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(generation) = self.attachment.lock().take() {
            self.sink.detach(generation);
        }
        self.state.send_replace(LinkState::Closed);

        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer {}: {}", self.session_id, e);
        } else {
            debug!("Peer {} closed", self.session_id);
        }
    }
}

/// Factory producing webrtc-rs peers
pub struct WebRtcPeerFactory {
    config: PeerConfig,
}

impl WebRtcPeerFactory {
    pub fn new(config: PeerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(&self, session_id: &str, sink: Arc<dyn VideoSink>) -> Result<Arc<dyn MediaPeer>> {
        let peer = PeerConnection::new(&self.config, session_id.to_string(), sink).await?;
        Ok(Arc::new(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whep::sink::RtpVideoSink;

    #[test]
    fn test_ice_state_mapping() {
        assert_eq!(
            link_from_ice(RTCIceConnectionState::Connected),
            Some(LinkState::Connected)
        );
        assert_eq!(
            link_from_ice(RTCIceConnectionState::Completed),
            Some(LinkState::Connected)
        );
        assert!(matches!(
            link_from_ice(RTCIceConnectionState::Disconnected),
            Some(LinkState::Failed(Failure { kind: FailureKind::Ice, .. }))
        ));
        assert!(matches!(
            link_from_ice(RTCIceConnectionState::Failed),
            Some(LinkState::Failed(Failure { kind: FailureKind::Ice, .. }))
        ));
        assert_eq!(link_from_ice(RTCIceConnectionState::New), None);
    }

    #[test]
    fn test_peer_state_mapping() {
        assert!(matches!(
            link_from_peer(RTCPeerConnectionState::Failed),
            Some(LinkState::Failed(Failure { kind: FailureKind::Peer, .. }))
        ));
        assert_eq!(link_from_peer(RTCPeerConnectionState::Connected), None);
    }

    #[test]
    fn test_update_link_is_sticky_after_failure() {
        let (tx, rx) = watch::channel(LinkState::New);
        update_link(&tx, LinkState::Checking);
        update_link(&tx, LinkState::Failed(Failure::new(FailureKind::Ice, "ICE failed")));
        update_link(&tx, LinkState::Connected);
        assert!(matches!(*rx.borrow(), LinkState::Failed(_)));
    }

    #[tokio::test]
    async fn test_offer_is_recvonly_video() {
        let sink: Arc<dyn VideoSink> = Arc::new(RtpVideoSink::new("test"));
        let config = PeerConfig {
            stun_servers: vec![],
            gathering_timeout: Duration::from_millis(500),
        };
        let peer = PeerConnection::new(&config, "offer-test".to_string(), sink)
            .await
            .unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("a=recvonly"));
        assert!(!offer.sdp.contains("m=audio"));

        peer.close().await;
        peer.close().await;
        assert_eq!(*peer.link_state().borrow(), LinkState::Closed);
    }
}
