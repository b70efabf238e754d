//! Tile registry: one connection manager per mounted tile

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::controller::SessionDeps;
use super::health::HealthState;
use super::sink::VideoSink;
use super::state::TileStatus;
use super::tile::StreamTile;
use crate::config::{ConnectionConfig, StreamDescriptor};
use crate::error::{AppError, Result};
use crate::events::{EventBus, TileEvent};

/// Connection settings shared by every tile
#[derive(Clone)]
struct Settings {
    config: ConnectionConfig,
    deps: SessionDeps,
}

/// Tile registry
///
/// Mount, identity change and unmount are serialized by the registry lock:
/// the old session is fully torn down before a new one starts on the
/// same sink.
pub struct TileRegistry {
    settings: parking_lot::RwLock<Settings>,
    events: Arc<EventBus>,
    tiles: RwLock<HashMap<String, StreamTile>>,
}

impl TileRegistry {
    /// Registry using WHEP over HTTP and webrtc-rs peers
    pub fn new(config: ConnectionConfig, events: Arc<EventBus>) -> Result<Self> {
        let deps = SessionDeps::from_config(&config)?;
        Ok(Self::with_deps(config, deps, events))
    }

    /// Registry with caller-supplied collaborators
    pub fn with_deps(config: ConnectionConfig, deps: SessionDeps, events: Arc<EventBus>) -> Self {
        Self {
            settings: parking_lot::RwLock::new(Settings { config, deps }),
            events,
            tiles: RwLock::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        self.settings.read().config.clone()
    }

    /// Mount a tile; an existing tile with the same id is torn down first
    pub async fn mount(
        &self,
        tile_id: &str,
        descriptor: StreamDescriptor,
        sink: Arc<dyn VideoSink>,
    ) -> Result<TileStatus> {
        self.check(tile_id, &descriptor)?;
        let mut tiles = self.tiles.write().await;

        if let Some(old) = tiles.remove(tile_id) {
            debug!("Tile {} remounted, tearing down previous session", tile_id);
            old.shutdown().await;
        }

        let tile = self.spawn_tile(tile_id, descriptor, sink)?;
        let status = tile.status();
        info!(
            "Tile {} mounted (camera {})",
            tile_id,
            tile.descriptor().camera_key
        );
        tiles.insert(tile_id.to_string(), tile);
        Ok(status)
    }

    /// Apply a new descriptor
    ///
    /// A different `camera_key` tears the session down and mounts a fresh
    /// one on the same sink. Returns whether the tile was remounted.
    pub async fn update(&self, tile_id: &str, descriptor: StreamDescriptor) -> Result<bool> {
        let mut tiles = self.tiles.write().await;

        let current = tiles
            .get(tile_id)
            .ok_or_else(|| AppError::NotFound(format!("Tile not found: {}", tile_id)))?;
        if current.descriptor().same_camera(&descriptor) {
            return Ok(false);
        }
        // Reject before the running session is touched
        self.check(tile_id, &descriptor)?;

        let Some(old) = tiles.remove(tile_id) else {
            return Ok(false);
        };
        let sink = old.sink();
        let old_stream = old.descriptor().id.clone();
        info!(
            "Tile {}: camera changed {} -> {}",
            tile_id,
            old.descriptor().camera_key,
            descriptor.camera_key
        );
        old.shutdown().await;
        self.publish_removed(tile_id, old_stream);

        let tile = self.spawn_tile(tile_id, descriptor, sink)?;
        tiles.insert(tile_id.to_string(), tile);
        Ok(true)
    }

    /// Tear a tile down; unknown ids are ignored
    pub async fn unmount(&self, tile_id: &str) -> Result<()> {
        let mut tiles = self.tiles.write().await;

        if let Some(tile) = tiles.remove(tile_id) {
            let stream_id = tile.descriptor().id.clone();
            tile.shutdown().await;
            self.publish_removed(tile_id, stream_id);
            info!("Tile {} unmounted", tile_id);
        }

        Ok(())
    }

    /// Manual retry of one tile
    pub async fn retry(&self, tile_id: &str) -> Result<()> {
        let tiles = self.tiles.read().await;
        let tile = tiles
            .get(tile_id)
            .ok_or_else(|| AppError::NotFound(format!("Tile not found: {}", tile_id)))?;
        tile.retry().await
    }

    /// Manual retry of every tile that ran out of attempts; returns their ids
    pub async fn retry_exhausted(&self) -> Vec<String> {
        let tiles = self.tiles.read().await;
        let mut retried = Vec::new();

        for (tile_id, tile) in tiles.iter() {
            if !tile.status().retry_available {
                continue;
            }
            match tile.retry().await {
                Ok(()) => retried.push(tile_id.clone()),
                Err(e) => warn!("Tile {}: retry failed: {}", tile_id, e),
            }
        }

        retried.sort();
        retried
    }

    pub async fn status(&self, tile_id: &str) -> Option<TileStatus> {
        self.tiles.read().await.get(tile_id).map(|t| t.status())
    }

    /// Snapshots of all tiles, ordered by tile id
    pub async fn statuses(&self) -> Vec<TileStatus> {
        let tiles = self.tiles.read().await;
        let mut statuses: Vec<TileStatus> = tiles.values().map(|t| t.status()).collect();
        statuses.sort_by(|a, b| a.tile_id.cmp(&b.tile_id));
        statuses
    }

    pub async fn health(&self, tile_id: &str) -> Option<HealthState> {
        self.tiles.read().await.get(tile_id).map(|t| t.health())
    }

    pub async fn descriptor(&self, tile_id: &str) -> Option<StreamDescriptor> {
        self.tiles
            .read()
            .await
            .get(tile_id)
            .map(|t| t.descriptor().clone())
    }

    pub async fn tile_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tiles.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn tile_count(&self) -> usize {
        self.tiles.read().await.len()
    }

    /// Switch connection settings and remount every tile with them
    pub async fn reconfigure(&self, config: ConnectionConfig) -> Result<()> {
        config.validate()?;
        let deps = SessionDeps::from_config(&config)?;
        self.reconfigure_with(config, deps).await
    }

    async fn reconfigure_with(&self, config: ConnectionConfig, deps: SessionDeps) -> Result<()> {
        let mut tiles = self.tiles.write().await;
        *self.settings.write() = Settings { config, deps };

        let ids: Vec<String> = tiles.keys().cloned().collect();
        for id in ids {
            if let Some(old) = tiles.remove(&id) {
                let descriptor = old.descriptor().clone();
                let sink = old.sink();
                old.shutdown().await;
                let tile = self.spawn_tile(&id, descriptor, sink)?;
                tiles.insert(id, tile);
            }
        }

        info!("Connection settings applied to {} tiles", tiles.len());
        Ok(())
    }

    /// Tear every tile down
    pub async fn shutdown(&self) {
        let mut tiles = self.tiles.write().await;
        let count = tiles.len();

        let stop_futures = tiles.drain().map(|(tile_id, tile)| async move {
            let stream_id = tile.descriptor().id.clone();
            tile.shutdown().await;
            (tile_id, stream_id)
        });
        for (tile_id, stream_id) in futures::future::join_all(stop_futures).await {
            self.publish_removed(&tile_id, stream_id);
        }

        info!("Tile registry shut down ({} tiles)", count);
    }

    fn check(&self, tile_id: &str, descriptor: &StreamDescriptor) -> Result<()> {
        StreamTile::validate(tile_id, descriptor, &self.settings.read().config)
    }

    fn spawn_tile(
        &self,
        tile_id: &str,
        descriptor: StreamDescriptor,
        sink: Arc<dyn VideoSink>,
    ) -> Result<StreamTile> {
        let settings = self.settings.read().clone();
        StreamTile::spawn(
            tile_id,
            descriptor,
            settings.config,
            settings.deps,
            sink,
            self.events.clone(),
        )
    }

    fn publish_removed(&self, tile_id: &str, stream_id: String) {
        self.events.publish(TileEvent::Removed {
            tile_id: tile_id.to_string(),
            stream_id,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whep::controller::tests::{MockPeerFactory, MockSignaler, Reply, TestSink};
    use crate::whep::state::ConnectionState;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Fixture {
        registry: TileRegistry,
        signaler: Arc<MockSignaler>,
        peers: Arc<MockPeerFactory>,
    }

    fn fixture(reply: Reply) -> Fixture {
        let signaler = MockSignaler::new(reply);
        let peers = MockPeerFactory::new(true);
        let deps = SessionDeps {
            signaler: signaler.clone(),
            peers: peers.clone(),
        };
        let registry = TileRegistry::with_deps(
            ConnectionConfig::new("http://media.local:8889"),
            deps,
            Arc::new(EventBus::new()),
        );
        Fixture {
            registry,
            signaler,
            peers,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_and_statuses() {
        let f = fixture(Reply::Answer);
        f.registry
            .mount("b", StreamDescriptor::new("yard", "yard"), TestSink::new())
            .await
            .unwrap();
        f.registry
            .mount("a", StreamDescriptor::new("gate", "gate"), TestSink::new())
            .await
            .unwrap();
        settle().await;

        let statuses = f.registry.statuses().await;
        let ids: Vec<&str> = statuses.iter().map(|s| s.tile_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(statuses
            .iter()
            .all(|s| s.state == ConnectionState::Connected));
        assert_eq!(f.registry.tile_count().await, 2);
        assert!(f.registry.health("a").await.unwrap().healthy);

        f.registry.shutdown().await;
        assert_eq!(f.registry.tile_count().await, 0);
        assert_eq!(f.peers.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_rejects_invalid_descriptor() {
        let f = fixture(Reply::Answer);
        let result = f
            .registry
            .mount("a", StreamDescriptor::new("gate", ""), TestSink::new())
            .await;
        assert!(matches!(result, Err(AppError::Config(_))));
        assert_eq!(f.registry.tile_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_same_camera_is_noop() {
        let f = fixture(Reply::Answer);
        f.registry
            .mount("a", StreamDescriptor::new("gate", "gate"), TestSink::new())
            .await
            .unwrap();
        settle().await;

        let renamed = StreamDescriptor::new("gate", "gate").with_title("Main gate");
        assert!(!f.registry.update("a", renamed).await.unwrap());
        settle().await;
        assert_eq!(f.peers.created.load(Ordering::SeqCst), 1);
        assert_eq!(f.signaler.call_count(), 1);

        f.registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_camera_change_remounts_on_same_sink() {
        let f = fixture(Reply::Answer);
        let mut events = f.registry.events().subscribe();
        let sink = TestSink::new();
        f.registry
            .mount("a", StreamDescriptor::new("gate", "gate"), sink.clone())
            .await
            .unwrap();
        settle().await;
        assert_eq!(sink.hub.listener_count(), 1);

        let swapped = StreamDescriptor::new("dock", "site/dock");
        assert!(f.registry.update("a", swapped).await.unwrap());

        // Old session fully released before the new one starts
        assert_eq!(f.peers.closed.load(Ordering::SeqCst), 1);
        settle().await;

        let status = f.registry.status("a").await.unwrap();
        assert_eq!(status.camera_key, "site/dock");
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.retry_count, 0);
        assert_eq!(sink.hub.listener_count(), 1);

        let keys: Vec<String> = f.signaler.calls().into_iter().map(|(_, k)| k).collect();
        assert_eq!(keys, vec!["gate".to_string(), "site/dock".to_string()]);

        let mut removed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TileEvent::Removed { stream_id, .. } = event {
                removed.push(stream_id);
            }
        }
        assert_eq!(removed, vec!["gate".to_string()]);

        f.registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_unknown_tile() {
        let f = fixture(Reply::Answer);
        let result = f
            .registry
            .update("missing", StreamDescriptor::new("gate", "gate"))
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_rejects_invalid_descriptor_and_keeps_tile() {
        let f = fixture(Reply::Answer);
        let mut events = f.registry.events().subscribe();
        let sink = TestSink::new();
        f.registry
            .mount("a", StreamDescriptor::new("gate", "gate"), sink.clone())
            .await
            .unwrap();
        settle().await;

        let result = f
            .registry
            .update("a", StreamDescriptor::new("gate", "  "))
            .await;
        assert!(matches!(result, Err(AppError::Config(_))));
        settle().await;

        let status = f.registry.status("a").await.unwrap();
        assert_eq!(status.camera_key, "gate");
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(f.peers.closed.load(Ordering::SeqCst), 0);
        assert_eq!(f.peers.created.load(Ordering::SeqCst), 1);
        assert_eq!(sink.hub.listener_count(), 1);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, TileEvent::Removed { .. }));
        }

        f.registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remount_rejects_invalid_descriptor_and_keeps_tile() {
        let f = fixture(Reply::Answer);
        f.registry
            .mount("a", StreamDescriptor::new("gate", "gate"), TestSink::new())
            .await
            .unwrap();
        settle().await;

        let result = f
            .registry
            .mount("a", StreamDescriptor::new("gate", ""), TestSink::new())
            .await;
        assert!(matches!(result, Err(AppError::Config(_))));
        assert_eq!(
            f.registry.status("a").await.unwrap().state,
            ConnectionState::Connected
        );
        assert_eq!(f.peers.closed.load(Ordering::SeqCst), 0);

        f.registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmount_mid_connect() {
        let f = fixture(Reply::Hang);
        let mut events = f.registry.events().subscribe();
        let sink = TestSink::new();
        f.registry
            .mount("a", StreamDescriptor::new("gate", "gate"), sink.clone())
            .await
            .unwrap();
        while f.signaler.call_count() == 0 {
            settle().await;
        }

        f.registry.unmount("a").await.unwrap();
        assert!(f.registry.status("a").await.is_none());
        assert_eq!(f.peers.applied.load(Ordering::SeqCst), 0);
        assert_eq!(sink.hub.listener_count(), 0);

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            saw_failure |= matches!(event, TileEvent::Failed { .. });
        }
        assert!(!saw_failure);

        // Unknown ids are fine
        f.registry.unmount("a").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_routes_to_tile() {
        let f = fixture(Reply::Reject(404));
        let config = ConnectionConfig {
            max_reconnect_attempts: 1,
            ..f.registry.connection_config()
        };
        f.registry
            .reconfigure_with(
                config,
                SessionDeps {
                    signaler: f.signaler.clone(),
                    peers: f.peers.clone(),
                },
            )
            .await
            .unwrap();
        f.registry
            .mount("a", StreamDescriptor::new("gate", "gate"), TestSink::new())
            .await
            .unwrap();
        settle().await;
        assert!(f.registry.status("a").await.unwrap().retry_available);

        f.signaler.set_reply(Reply::Answer);
        f.registry.retry("a").await.unwrap();
        settle().await;
        assert_eq!(
            f.registry.status("a").await.unwrap().state,
            ConnectionState::Connected
        );

        assert!(matches!(
            f.registry.retry("missing").await,
            Err(AppError::NotFound(_))
        ));

        f.registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_only_touches_failed_tiles() {
        let f = fixture(Reply::Reject(404));
        let config = ConnectionConfig {
            max_reconnect_attempts: 1,
            ..f.registry.connection_config()
        };
        f.registry
            .reconfigure_with(
                config,
                SessionDeps {
                    signaler: f.signaler.clone(),
                    peers: f.peers.clone(),
                },
            )
            .await
            .unwrap();
        for id in ["b", "a"] {
            f.registry
                .mount(id, StreamDescriptor::new(id, id), TestSink::new())
                .await
                .unwrap();
        }
        settle().await;
        assert_eq!(f.signaler.call_count(), 2);

        f.signaler.set_reply(Reply::Answer);
        assert_eq!(f.registry.retry_exhausted().await, vec!["a", "b"]);
        settle().await;
        assert!(f
            .registry
            .statuses()
            .await
            .iter()
            .all(|s| s.state == ConnectionState::Connected));
        assert_eq!(f.signaler.call_count(), 4);

        // Connected tiles are left alone
        assert!(f.registry.retry_exhausted().await.is_empty());
        settle().await;
        assert_eq!(f.signaler.call_count(), 4);

        f.registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_remounts_tiles() {
        let f = fixture(Reply::Answer);
        f.registry
            .mount("a", StreamDescriptor::new("gate", "gate"), TestSink::new())
            .await
            .unwrap();
        settle().await;

        let config = ConnectionConfig {
            max_reconnect_attempts: 5,
            ..f.registry.connection_config()
        };
        f.registry
            .reconfigure_with(
                config,
                SessionDeps {
                    signaler: f.signaler.clone(),
                    peers: f.peers.clone(),
                },
            )
            .await
            .unwrap();
        settle().await;

        let status = f.registry.status("a").await.unwrap();
        assert_eq!(status.max_attempts, 5);
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(f.peers.created.load(Ordering::SeqCst), 2);

        f.registry.shutdown().await;
    }
}
