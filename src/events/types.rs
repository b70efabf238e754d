//! Tile event types
//!
//! Defines every event the connection manager broadcasts to the host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StreamDescriptor;
use crate::whep::state::{ConnectionState, FailureKind};

/// Tile event enumeration
///
/// Serialized as:
/// ```json
/// {
///   "event": "tile.state_changed",
///   "data": { "tile_id": "gate", "stream_id": "gate", "state": "connected", ... }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum TileEvent {
    /// Connection state changed
    #[serde(rename = "tile.state_changed")]
    StateChanged {
        tile_id: String,
        stream_id: String,
        state: ConnectionState,
        retry_count: u32,
        at: DateTime<Utc>,
    },

    /// Playback health flipped (live <-> buffering)
    #[serde(rename = "tile.health_changed")]
    HealthChanged {
        tile_id: String,
        stream_id: String,
        healthy: bool,
        at: DateTime<Utc>,
    },

    /// An automatic reconnect is scheduled
    #[serde(rename = "tile.reconnecting")]
    Reconnecting {
        tile_id: String,
        stream_id: String,
        /// Failures so far (1-based)
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        at: DateTime<Utc>,
    },

    /// Host error notification `(error, stream identity)`
    ///
    /// Fired when retries are exhausted, or on every hard failure when the
    /// tile is configured with `error_notification = every_failure`.
    #[serde(rename = "tile.failed")]
    Failed {
        tile_id: String,
        stream: StreamDescriptor,
        kind: FailureKind,
        error: String,
        /// True once no automatic retry will follow
        terminal: bool,
        at: DateTime<Utc>,
    },

    /// Tile was unmounted or swapped to another camera
    #[serde(rename = "tile.removed")]
    Removed {
        tile_id: String,
        stream_id: String,
        at: DateTime<Utc>,
    },
}

impl TileEvent {
    /// Get the event name (for filtering)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "tile.state_changed",
            Self::HealthChanged { .. } => "tile.health_changed",
            Self::Reconnecting { .. } => "tile.reconnecting",
            Self::Failed { .. } => "tile.failed",
            Self::Removed { .. } => "tile.removed",
        }
    }

    /// Tile the event belongs to
    pub fn tile_id(&self) -> &str {
        match self {
            Self::StateChanged { tile_id, .. }
            | Self::HealthChanged { tile_id, .. }
            | Self::Reconnecting { tile_id, .. }
            | Self::Failed { tile_id, .. }
            | Self::Removed { tile_id, .. } => tile_id,
        }
    }

    /// Check if event name matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `tile.*` matches all tile events
    /// - `tile.failed` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if topic.ends_with(".*") {
            let prefix = topic.trim_end_matches(".*");
            event_name.starts_with(prefix)
        } else {
            event_name == topic
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> TileEvent {
        TileEvent::Failed {
            tile_id: "gate".to_string(),
            stream: StreamDescriptor::new("gate", "cam-gate"),
            kind: FailureKind::Stall,
            error: "stream stalled".to_string(),
            terminal: true,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_event_name() {
        assert_eq!(failed().event_name(), "tile.failed");
        assert_eq!(failed().tile_id(), "gate");
    }

    #[test]
    fn test_matches_topic() {
        let event = failed();
        assert!(event.matches_topic("*"));
        assert!(event.matches_topic("tile.*"));
        assert!(event.matches_topic("tile.failed"));
        assert!(!event.matches_topic("tile.state_changed"));
        assert!(!event.matches_topic("system.*"));
    }

    #[test]
    fn test_serialization() {
        let event = TileEvent::StateChanged {
            tile_id: "yard".to_string(),
            stream_id: "yard".to_string(),
            state: ConnectionState::Connected,
            retry_count: 0,
            at: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("tile.state_changed"));
        assert!(json.contains("\"connected\""));

        let back: TileEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, TileEvent::StateChanged { .. }));
    }
}
