//! WHEP stream connection manager
//!
//! Receives a camera's video over WebRTC from a WHEP media server and keeps
//! the session alive:
//! - SDP offer/answer over HTTP (`POST {base}/{camera}/whep`)
//! - Receive-only video peer (webrtc-rs) feeding a host sink
//! - Stall detection from sink playback signals
//! - Bounded fixed-delay reconnect with manual retry
//!
//! Architecture:
//! ```text
//! TileRegistry
//!     |
//!     +-- StreamTile (one per tile)
//!             |
//!             v
//!     ReconnectionController ---- ConnectionStateMachine
//!        |        |        \
//!        v        v         v
//!   Signaler  MediaPeer  HealthMonitor
//!   (WHEP)        |         ^
//!                 v         | playing / time / stalled / error
//!             VideoSink ----+
//! ```

pub mod config;
pub mod controller;
pub mod health;
pub mod peer;
pub mod registry;
pub mod signaling;
pub mod sink;
pub mod state;
pub mod tile;

pub use config::PeerConfig;
pub use controller::{ControlCommand, ReconnectionController, SessionDeps};
pub use health::{HealthMonitor, HealthState};
pub use peer::{LinkState, MediaPeer, PeerConnection, PeerFactory, WebRtcPeerFactory};
pub use registry::TileRegistry;
pub use signaling::{SdpAnswer, SdpOffer, Signaler, WhepSignaling};
pub use sink::{RtpVideoSink, SinkEvent, VideoSink};
pub use state::{ConnectionState, Failure, FailureKind, StatusBadge, TileStatus};
pub use tile::StreamTile;
