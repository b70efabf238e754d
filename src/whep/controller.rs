//! Reconnection controller
//!
//! One driver task per tile. It runs the connect sequence
//! (peer -> offer -> signaling -> answer -> ICE), hands a connected session
//! to the health monitor, and applies the bounded fixed-delay retry policy
//! when anything fails.
//!
//! ```text
//!            mount / manual retry
//!                    |
//!                    v
//!  +---------> connecting ---------> connected
//!  |               |                     |
//!  | delay         | failure             | failure
//!  | (count < max) v                     |
//!  +----------- error <------------------+
//!                  |
//!                  | count >= max
//!                  v
//!          terminal (manual retry only)
//! ```
//!
//! All state lives on the driver task. The owner talks to it through a
//! `CancellationToken` (teardown), a command channel (manual retry) and
//! reads `TileStatus` snapshots from a watch channel.

use chrono::Utc;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::PeerConfig;
use super::health::{HealthFailure, HealthMonitor, HealthMonitorConfig, HealthState};
use super::peer::{LinkState, MediaPeer, PeerFactory, WebRtcPeerFactory};
use super::signaling::{SdpAnswer, Signaler, WhepSignaling};
use super::sink::VideoSink;
use super::state::{
    ConnectionState, ConnectionStateMachine, Failure, FailureKind, FailureOutcome, TileStatus,
};
use crate::config::{ConnectionConfig, ErrorNotification, StreamDescriptor};
use crate::error::Result;
use crate::events::{EventBus, TileEvent};
use crate::utils::{LogThrottler, Throttle};

/// Interval for repeated failure logs of one tile
const FAILURE_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Collaborators of a session
#[derive(Clone)]
pub struct SessionDeps {
    pub signaler: Arc<dyn Signaler>,
    pub peers: Arc<dyn PeerFactory>,
}

impl SessionDeps {
    /// WHEP over HTTP and webrtc-rs peers
    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        Ok(Self {
            signaler: Arc::new(WhepSignaling::new(config)?),
            peers: Arc::new(WebRtcPeerFactory::new(PeerConfig::from_connection(config))),
        })
    }
}

/// Commands accepted by a running controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// User-initiated retry; resets the counter
    Retry,
}

/// Owner side of a controller
pub struct ControllerHandle {
    pub cancel: CancellationToken,
    pub commands: mpsc::Sender<ControlCommand>,
    pub status: watch::Receiver<TileStatus>,
    pub health: watch::Receiver<HealthState>,
}

/// Why a connect or supervise step ended
#[derive(Debug)]
enum Exit {
    Cancelled,
    ManualRetry,
    Failed(Failure),
}

/// Live peer of the current attempt
struct ActiveSession {
    id: String,
    peer: Arc<dyn MediaPeer>,
    answer: Option<SdpAnswer>,
}

pub struct ReconnectionController {
    tile_id: String,
    descriptor: StreamDescriptor,
    config: ConnectionConfig,
    deps: SessionDeps,
    sink: Arc<dyn VideoSink>,
    events: Arc<EventBus>,
    machine: ConnectionStateMachine,
    monitor: HealthMonitor,
    /// Hard failures of the current monitor run only
    failures: Option<mpsc::Receiver<HealthFailure>>,
    status: watch::Sender<TileStatus>,
    cancel: CancellationToken,
    commands: mpsc::Receiver<ControlCommand>,
    session: Option<ActiveSession>,
    throttler: LogThrottler,
}

impl ReconnectionController {
    pub fn new(
        tile_id: String,
        descriptor: StreamDescriptor,
        config: ConnectionConfig,
        deps: SessionDeps,
        sink: Arc<dyn VideoSink>,
        events: Arc<EventBus>,
    ) -> (Self, ControllerHandle) {
        let max_attempts = config.max_reconnect_attempts;
        let (status, status_rx) = watch::channel(TileStatus::idle(
            &tile_id,
            &descriptor.id,
            &descriptor.camera_key,
            max_attempts,
        ));
        let (commands_tx, commands) = mpsc::channel(8);
        let monitor = HealthMonitor::new(HealthMonitorConfig::from_connection(&config));
        let cancel = CancellationToken::new();

        let handle = ControllerHandle {
            cancel: cancel.clone(),
            commands: commands_tx,
            status: status_rx,
            health: monitor.watch(),
        };

        let controller = Self {
            tile_id,
            descriptor,
            config,
            deps,
            sink,
            events,
            machine: ConnectionStateMachine::new(max_attempts),
            monitor,
            failures: None,
            status,
            cancel,
            commands,
            session: None,
            throttler: LogThrottler::new(FAILURE_LOG_INTERVAL),
        };

        (controller, handle)
    }

    /// Drive the tile until cancelled
    pub async fn run(mut self) {
        info!(
            "Tile {}: connecting to camera {}",
            self.tile_id, self.descriptor.camera_key
        );
        if let Err(e) = self.machine.begin_connect() {
            error!("Tile {}: {}", self.tile_id, e);
            return;
        }
        self.publish_state();

        loop {
            let exit = match self.connect_once().await {
                Ok(()) => self.supervise().await,
                Err(exit) => exit,
            };

            let next = match exit {
                Exit::Cancelled => break,
                Exit::ManualRetry => Exit::ManualRetry,
                Exit::Failed(failure) => {
                    self.teardown_session().await;
                    match self.on_failure(failure) {
                        Some(delay) => match self.backoff(delay).await {
                            None => {
                                if let Err(e) = self.machine.begin_connect() {
                                    error!("Tile {}: {}", self.tile_id, e);
                                    break;
                                }
                                self.publish_state();
                                continue;
                            }
                            Some(exit) => exit,
                        },
                        None => self.wait_for_retry().await,
                    }
                }
            };

            match next {
                Exit::ManualRetry => self.manual_retry().await,
                _ => break,
            }
        }

        self.teardown_session().await;
        self.machine.reset();
        self.publish_state();
        debug!("Tile {}: controller stopped", self.tile_id);
    }

    /// One full connect sequence with a fresh peer
    async fn connect_once(&mut self) -> std::result::Result<(), Exit> {
        let session_id = format!("{}-{}", self.tile_id, Uuid::new_v4().simple());
        debug!("Tile {}: starting session {}", self.tile_id, session_id);

        let peers = self.deps.peers.clone();
        let signaler = self.deps.signaler.clone();
        let sink = self.sink.clone();
        let camera_key = self.descriptor.camera_key.clone();

        let peer = self
            .interruptible(peers.create(&session_id, sink))
            .await?
            .map_err(|e| Exit::Failed(Failure::new(FailureKind::Peer, e)))?;
        self.session = Some(ActiveSession {
            id: session_id,
            peer: peer.clone(),
            answer: None,
        });

        let offer = self
            .interruptible(peer.create_offer())
            .await?
            .map_err(|e| Exit::Failed(Failure::new(FailureKind::Peer, e)))?;

        let answer = self
            .interruptible(signaler.exchange(&camera_key, &offer))
            .await?
            .map_err(|e| Exit::Failed(Failure::new(FailureKind::Signaling, e)))?;
        if let Some(session) = self.session.as_mut() {
            session.answer = Some(answer.clone());
        }

        self.interruptible(peer.apply_answer(&answer))
            .await?
            .map_err(|e| Exit::Failed(Failure::new(FailureKind::Peer, e)))?;

        let ice_timeout = self.config.ice_connect_timeout();
        self.interruptible(wait_connected(peer.link_state(), ice_timeout))
            .await?
            .map_err(Exit::Failed)?;

        if let Err(e) = self.machine.mark_connected() {
            return Err(Exit::Failed(Failure::new(FailureKind::Peer, e)));
        }
        self.throttler.clear_prefix(&self.tile_id);
        self.failures = Some(self.monitor.start(self.sink.as_ref()));
        self.publish_state();
        info!(
            "Tile {}: connected to camera {}",
            self.tile_id, self.descriptor.camera_key
        );
        Ok(())
    }

    /// Watch a connected session until it fails or the owner intervenes
    async fn supervise(&mut self) -> Exit {
        let Some(peer) = self.session.as_ref().map(|s| s.peer.clone()) else {
            return Exit::Failed(Failure::new(FailureKind::Peer, "no active session"));
        };
        let mut link = peer.link_state();
        link.borrow_and_update();
        let mut health = self.monitor.watch();
        health.borrow_and_update();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Exit::Cancelled,
                cmd = self.commands.recv() => {
                    return match cmd {
                        Some(ControlCommand::Retry) => Exit::ManualRetry,
                        None => Exit::Cancelled,
                    };
                }
                Some(failure) = next_failure(&mut self.failures) => {
                    return Exit::Failed(failure.into());
                }
                changed = link.changed() => {
                    if changed.is_err() {
                        return Exit::Failed(Failure::new(FailureKind::Peer, "peer closed"));
                    }
                    let current = link.borrow_and_update().clone();
                    match current {
                        LinkState::Failed(failure) => return Exit::Failed(failure),
                        LinkState::Closed => {
                            return Exit::Failed(Failure::new(FailureKind::Peer, "peer closed"));
                        }
                        _ => {}
                    }
                }
                Ok(()) = health.changed() => {
                    let healthy = health.borrow_and_update().healthy;
                    self.on_health_changed(healthy);
                }
            }
        }
    }

    /// Race `fut` against teardown and manual retry
    async fn interruptible<F: Future>(&mut self, fut: F) -> std::result::Result<F::Output, Exit> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Exit::Cancelled),
            cmd = self.commands.recv() => match cmd {
                Some(ControlCommand::Retry) => Err(Exit::ManualRetry),
                None => Err(Exit::Cancelled),
            },
            output = fut => Ok(output),
        }
    }

    /// Record a failure; returns the delay before the next attempt, or
    /// `None` once retries are exhausted
    fn on_failure(&mut self, failure: Failure) -> Option<Duration> {
        let outcome = match self.machine.record_failure(failure.clone()) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Tile {}: {}", self.tile_id, e);
                FailureOutcome::Exhausted
            }
        };
        self.publish_state();

        let delay = match outcome {
            FailureOutcome::RetryScheduled { attempt } => {
                let delay = self.retry_delay();
                let key = format!("{}:{}", self.tile_id, failure.kind);
                if let Throttle::Log { suppressed } = self.throttler.check(&key) {
                    warn!(
                        "Tile {}: {} failure: {} (attempt {}/{}, retry in {}ms{})",
                        self.tile_id,
                        failure.kind,
                        failure.reason,
                        attempt,
                        self.machine.max_attempts(),
                        delay.as_millis(),
                        suppressed_note(suppressed)
                    );
                }
                self.events.publish(TileEvent::Reconnecting {
                    tile_id: self.tile_id.clone(),
                    stream_id: self.descriptor.id.clone(),
                    attempt,
                    max_attempts: self.machine.max_attempts(),
                    delay_ms: delay.as_millis() as u64,
                    at: Utc::now(),
                });
                Some(delay)
            }
            FailureOutcome::Exhausted => {
                error!(
                    "Tile {}: {} failure: {}, giving up after {} attempts",
                    self.tile_id,
                    failure.kind,
                    failure.reason,
                    self.machine.retry_count()
                );
                None
            }
        };

        let terminal = delay.is_none();
        if terminal || self.config.error_notification == ErrorNotification::EveryFailure {
            self.events.publish(TileEvent::Failed {
                tile_id: self.tile_id.clone(),
                stream: self.descriptor.clone(),
                kind: failure.kind,
                error: failure.reason,
                terminal,
                at: Utc::now(),
            });
        }

        delay
    }

    fn retry_delay(&self) -> Duration {
        let base = self.config.reconnect_delay();
        match self.config.reconnect_jitter_ms {
            0 => base,
            jitter => base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter)),
        }
    }

    /// Single-shot reconnect timer; `None` when it fired
    async fn backoff(&mut self, delay: Duration) -> Option<Exit> {
        self.interruptible(tokio::time::sleep(delay)).await.err()
    }

    /// Terminal error: park until the user retries or the tile goes away
    async fn wait_for_retry(&mut self) -> Exit {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Exit::Cancelled,
            cmd = self.commands.recv() => match cmd {
                Some(ControlCommand::Retry) => Exit::ManualRetry,
                None => Exit::Cancelled,
            },
        }
    }

    async fn manual_retry(&mut self) {
        info!("Tile {}: manual retry", self.tile_id);
        self.teardown_session().await;
        self.throttler.clear_prefix(&self.tile_id);
        self.machine.manual_retry();
        self.publish_state();
    }

    /// Stop supervision and release the current peer
    async fn teardown_session(&mut self) {
        self.monitor.stop();
        self.failures = None;

        if let Some(session) = self.session.take() {
            debug!("Tile {}: closing session {}", self.tile_id, session.id);
            session.peer.close().await;
            if let Some(answer) = session.answer {
                let signaler = self.deps.signaler.clone();
                tokio::spawn(async move {
                    signaler.terminate(&answer).await;
                });
            }
        }
    }

    fn on_health_changed(&mut self, healthy: bool) {
        if self.machine.state() != ConnectionState::Connected {
            return;
        }
        if healthy {
            debug!("Tile {}: playback resumed", self.tile_id);
        } else {
            debug!("Tile {}: playback stalled, buffering", self.tile_id);
        }
        self.publish_state();
        self.events.publish(TileEvent::HealthChanged {
            tile_id: self.tile_id.clone(),
            stream_id: self.descriptor.id.clone(),
            healthy,
            at: Utc::now(),
        });
    }

    /// Push a status snapshot; emits `tile.state_changed` on transitions
    fn publish_state(&self) {
        let healthy = self.monitor.is_running() && self.monitor.state().healthy;
        let machine = &self.machine;
        let mut transitioned = false;
        self.status.send_modify(|status| {
            let before = (status.state, status.retry_count);
            status.apply(machine, healthy);
            transitioned = before != (status.state, status.retry_count);
        });

        if transitioned {
            debug!(
                "Tile {}: state {} (retry {}/{})",
                self.tile_id,
                self.machine.state(),
                self.machine.retry_count(),
                self.machine.max_attempts()
            );
            self.events.publish(TileEvent::StateChanged {
                tile_id: self.tile_id.clone(),
                stream_id: self.descriptor.id.clone(),
                state: self.machine.state(),
                retry_count: self.machine.retry_count(),
                at: Utc::now(),
            });
        }
    }
}

/// Wait for the link to come up, bounded by `timeout`
async fn wait_connected(
    mut link: watch::Receiver<LinkState>,
    timeout: Duration,
) -> std::result::Result<(), Failure> {
    let wait = async {
        loop {
            let current = link.borrow_and_update().clone();
            match current {
                LinkState::Connected => return Ok(()),
                LinkState::Failed(failure) => return Err(failure),
                LinkState::Closed => return Err(Failure::new(FailureKind::Peer, "peer closed")),
                LinkState::New | LinkState::Checking => {}
            }
            if link.changed().await.is_err() {
                return Err(Failure::new(FailureKind::Peer, "peer closed"));
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(Failure::new(
            FailureKind::Ice,
            format!("ICE not connected after {}ms", timeout.as_millis()),
        )),
    }
}

/// Next hard failure of the running monitor; pends while none is running
async fn next_failure(
    failures: &mut Option<mpsc::Receiver<HealthFailure>>,
) -> Option<HealthFailure> {
    match failures {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn suppressed_note(suppressed: u32) -> String {
    if suppressed > 0 {
        format!(", {} similar suppressed", suppressed)
    } else {
        String::new()
    }
}
