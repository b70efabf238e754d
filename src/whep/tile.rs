//! Stream tile: one camera session bound to one sink

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::controller::{ControlCommand, ControllerHandle, ReconnectionController, SessionDeps};
use super::health::HealthState;
use super::sink::VideoSink;
use super::state::TileStatus;
use crate::config::{ConnectionConfig, StreamDescriptor};
use crate::error::{AppError, Result};
use crate::events::EventBus;

/// Connection manager of a single tile
///
/// Owns the controller task. `shutdown` cancels it and waits until the
/// peer is closed and the sink released; dropping the tile only cancels.
pub struct StreamTile {
    tile_id: String,
    descriptor: StreamDescriptor,
    sink: Arc<dyn VideoSink>,
    handle: ControllerHandle,
    task: JoinHandle<()>,
}

impl StreamTile {
    /// Validate the descriptor and start connecting
    pub fn spawn(
        tile_id: impl Into<String>,
        descriptor: StreamDescriptor,
        config: ConnectionConfig,
        deps: SessionDeps,
        sink: Arc<dyn VideoSink>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let tile_id = tile_id.into();
        Self::validate(&tile_id, &descriptor, &config)?;

        let (controller, handle) = ReconnectionController::new(
            tile_id.clone(),
            descriptor.clone(),
            config,
            deps,
            sink.clone(),
            events,
        );
        let task = tokio::spawn(controller.run());

        Ok(Self {
            tile_id,
            descriptor,
            sink,
            handle,
            task,
        })
    }

    /// Check that a tile could be spawned with these settings
    pub fn validate(
        tile_id: &str,
        descriptor: &StreamDescriptor,
        config: &ConnectionConfig,
    ) -> Result<()> {
        if descriptor.camera_key.trim().is_empty() {
            return Err(AppError::Config(format!(
                "Tile {}: camera key is empty",
                tile_id
            )));
        }
        config.validate()
    }

    pub fn tile_id(&self) -> &str {
        &self.tile_id
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn sink(&self) -> Arc<dyn VideoSink> {
        self.sink.clone()
    }

    pub fn status(&self) -> TileStatus {
        self.handle.status.borrow().clone()
    }

    /// Status receiver for hosts that render on change
    pub fn watch_status(&self) -> watch::Receiver<TileStatus> {
        self.handle.status.clone()
    }

    pub fn health(&self) -> HealthState {
        *self.handle.health.borrow()
    }

    /// Manual retry; accepted in any state
    pub async fn retry(&self) -> Result<()> {
        self.handle
            .commands
            .send(ControlCommand::Retry)
            .await
            .map_err(|_| AppError::Internal(format!("Tile {} is not running", self.tile_id)))
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Tear the session down and wait for it to finish
    pub async fn shutdown(mut self) {
        self.handle.cancel.cancel();
        if let Err(e) = (&mut self.task).await {
            warn!("Tile {}: controller task ended abnormally: {}", self.tile_id, e);
        }
        debug!("Tile {}: shut down", self.tile_id);
    }
}

impl Drop for StreamTile {
    fn drop(&mut self) {
        self.handle.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whep::controller::tests::{MockPeerFactory, MockSignaler, Reply, TestSink};
    use crate::whep::state::{ConnectionState, StatusBadge};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn deps(signaler: &Arc<MockSignaler>, peers: &Arc<MockPeerFactory>) -> SessionDeps {
        SessionDeps {
            signaler: signaler.clone(),
            peers: peers.clone(),
        }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("http://media.local:8889")
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_connect_and_shutdown() {
        let signaler = MockSignaler::new(Reply::Answer);
        let peers = MockPeerFactory::new(true);
        let tile = StreamTile::spawn(
            "t1",
            StreamDescriptor::new("lobby", "lobby"),
            config(),
            deps(&signaler, &peers),
            TestSink::new(),
            Arc::new(EventBus::new()),
        )
        .unwrap();

        let mut status = tile.watch_status();
        status
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(tile.status().badge, StatusBadge::Live);
        assert!(tile.health().healthy);
        assert!(tile.is_running());

        tile.shutdown().await;
        assert_eq!(peers.closed.load(Ordering::SeqCst), 1);
        assert_eq!(status.borrow().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_rejects_empty_camera_key() {
        let signaler = MockSignaler::new(Reply::Answer);
        let peers = MockPeerFactory::new(true);
        let result = StreamTile::spawn(
            "t1",
            StreamDescriptor::new("blank", "  "),
            config(),
            deps(&signaler, &peers),
            TestSink::new(),
            Arc::new(EventBus::new()),
        );
        assert!(matches!(result, Err(AppError::Config(_))));
        assert_eq!(peers.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_rejects_missing_base_url() {
        let signaler = MockSignaler::new(Reply::Answer);
        let peers = MockPeerFactory::new(true);
        let result = StreamTile::spawn(
            "t1",
            StreamDescriptor::new("lobby", "lobby"),
            ConnectionConfig::default(),
            deps(&signaler, &peers),
            TestSink::new(),
            Arc::new(EventBus::new()),
        );
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_terminal_failure() {
        let signaler = MockSignaler::new(Reply::Reject(404));
        let peers = MockPeerFactory::new(true);
        let cfg = ConnectionConfig {
            max_reconnect_attempts: 1,
            ..config()
        };
        let tile = StreamTile::spawn(
            "t1",
            StreamDescriptor::new("dock", "dock"),
            cfg,
            deps(&signaler, &peers),
            TestSink::new(),
            Arc::new(EventBus::new()),
        )
        .unwrap();

        let mut status = tile.watch_status();
        status.wait_for(|s| s.retry_available).await.unwrap();
        assert_eq!(signaler.call_count(), 1);

        // Stays terminal with no further attempts
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(signaler.call_count(), 1);

        signaler.set_reply(Reply::Answer);
        tile.retry().await.unwrap();
        status
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(signaler.call_count(), 2);

        tile.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_controller() {
        let signaler = MockSignaler::new(Reply::Hang);
        let peers = MockPeerFactory::new(true);
        let tile = StreamTile::spawn(
            "t1",
            StreamDescriptor::new("yard", "yard"),
            config(),
            deps(&signaler, &peers),
            TestSink::new(),
            Arc::new(EventBus::new()),
        )
        .unwrap();
        let mut status = tile.watch_status();
        status
            .wait_for(|s| s.state == ConnectionState::Connecting)
            .await
            .unwrap();

        drop(tile);
        status
            .wait_for(|s| s.state == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert_eq!(peers.applied.load(Ordering::SeqCst), 0);
    }
}
