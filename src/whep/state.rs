//! Connection state machine
//!
//! `ConnectionStateMachine` is the only place connection state and the
//! retry counter change. The async controller calls its transition
//! functions; everything else reads snapshots.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use typeshare::typeshare;

/// Tile connection state
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

/// Where a failure came from
///
/// Every kind gets the same retry policy; the kind is kept for logs
/// and host notifications only.
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// WHEP HTTP exchange failed
    Signaling,
    /// ICE disconnected/failed or never connected
    Ice,
    /// Peer connection failed or could not be set up
    Peer,
    /// No frame progress within the stall timeout
    Stall,
    /// Sink reported a playback error
    Playback,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Signaling => write!(f, "signaling"),
            FailureKind::Ice => write!(f, "ice"),
            FailureKind::Peer => write!(f, "peer"),
            FailureKind::Stall => write!(f, "stall"),
            FailureKind::Playback => write!(f, "playback"),
        }
    }
}

/// A normalized failure with a human-readable reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
}

impl Failure {
    pub fn new(kind: FailureKind, reason: impl std::fmt::Display) -> Self {
        Self {
            kind,
            reason: reason.to_string(),
        }
    }

    pub fn stalled() -> Self {
        Self::new(FailureKind::Stall, "stream stalled")
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

/// Rejected transition
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid transition: {action} while {from}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub action: &'static str,
}

/// What happens after a failure is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Another automatic attempt follows after the reconnect delay
    RetryScheduled { attempt: u32 },
    /// Retries exhausted; only a manual retry leaves `Error`
    Exhausted,
}

/// Explicit connection state machine with bounded retry
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    retry_count: u32,
    max_attempts: u32,
    last_failure: Option<Failure>,
}

impl ConnectionStateMachine {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            retry_count: 0,
            max_attempts,
            last_failure: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn last_failure(&self) -> Option<&Failure> {
        self.last_failure.as_ref()
    }

    /// In `Error` with no automatic retry left
    pub fn is_exhausted(&self) -> bool {
        self.state == ConnectionState::Error && self.retry_count >= self.max_attempts
    }

    /// `disconnected -> connecting` (mount) or `error -> connecting` (scheduled retry)
    pub fn begin_connect(&mut self) -> Result<(), InvalidTransition> {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Error if !self.is_exhausted() => {}
            from => {
                return Err(InvalidTransition {
                    from,
                    action: "begin_connect",
                })
            }
        }
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// `connecting -> connected`; the retry counter starts over
    pub fn mark_connected(&mut self) -> Result<(), InvalidTransition> {
        if self.state != ConnectionState::Connecting {
            return Err(InvalidTransition {
                from: self.state,
                action: "mark_connected",
            });
        }
        self.state = ConnectionState::Connected;
        self.retry_count = 0;
        self.last_failure = None;
        Ok(())
    }

    /// `connecting | connected -> error`
    ///
    /// The counter grows by one per failure and saturates at the maximum.
    /// Reaching the maximum makes the error terminal.
    pub fn record_failure(&mut self, failure: Failure) -> Result<FailureOutcome, InvalidTransition> {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return Err(InvalidTransition {
                from: self.state,
                action: "record_failure",
            });
        }

        self.state = ConnectionState::Error;
        self.last_failure = Some(failure);
        self.retry_count = (self.retry_count + 1).min(self.max_attempts);

        if self.retry_count < self.max_attempts {
            Ok(FailureOutcome::RetryScheduled {
                attempt: self.retry_count,
            })
        } else {
            Ok(FailureOutcome::Exhausted)
        }
    }

    /// User-initiated retry: always allowed, counter reset first
    pub fn manual_retry(&mut self) {
        self.retry_count = 0;
        self.last_failure = None;
        self.state = ConnectionState::Connecting;
    }

    /// Teardown: back to `disconnected` with nothing carried over
    pub fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.retry_count = 0;
        self.last_failure = None;
    }
}

/// Status badge rendered on a tile
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusBadge {
    /// Not mounted / torn down
    Idle,
    /// First attempt in flight
    Connecting,
    /// Waiting for or running an automatic retry
    Reconnecting,
    /// Connected and frames are flowing
    Live,
    /// Connected but playback stalled
    Buffering,
    /// Retries exhausted; show "Retry Connection"
    Failed,
}

/// Snapshot of one tile for the host UI
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileStatus {
    pub tile_id: String,
    pub stream_id: String,
    pub camera_key: String,
    pub state: ConnectionState,
    pub retry_count: u32,
    pub max_attempts: u32,
    /// Short reason text of the last failure
    pub last_error: Option<String>,
    pub healthy: bool,
    pub badge: StatusBadge,
    /// Whether the "Retry Connection" action should be offered
    pub retry_available: bool,
}

impl TileStatus {
    pub fn idle(tile_id: &str, stream_id: &str, camera_key: &str, max_attempts: u32) -> Self {
        Self {
            tile_id: tile_id.to_string(),
            stream_id: stream_id.to_string(),
            camera_key: camera_key.to_string(),
            state: ConnectionState::Disconnected,
            retry_count: 0,
            max_attempts,
            last_error: None,
            healthy: false,
            badge: StatusBadge::Idle,
            retry_available: false,
        }
    }

    /// Refresh the machine-derived fields
    pub fn apply(&mut self, machine: &ConnectionStateMachine, healthy: bool) {
        self.state = machine.state();
        self.retry_count = machine.retry_count();
        self.max_attempts = machine.max_attempts();
        self.last_error = machine.last_failure().map(|f| f.reason.clone());
        self.healthy = machine.state() == ConnectionState::Connected && healthy;
        self.retry_available = machine.is_exhausted();
        self.badge = match machine.state() {
            ConnectionState::Disconnected => StatusBadge::Idle,
            ConnectionState::Connecting if machine.retry_count() == 0 => StatusBadge::Connecting,
            ConnectionState::Connecting => StatusBadge::Reconnecting,
            ConnectionState::Connected if self.healthy => StatusBadge::Live,
            ConnectionState::Connected => StatusBadge::Buffering,
            ConnectionState::Error if machine.is_exhausted() => StatusBadge::Failed,
            ConnectionState::Error => StatusBadge::Reconnecting,
        };
    }
}
