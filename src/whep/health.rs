//! Stream health monitor
//!
//! Supervises a connected session through sink playback signals:
//! - `playing` / `time progressed`: frame seen, healthy
//! - `stalled`: unhealthy (soft, rendered as buffering)
//! - no frame for longer than the stall timeout: hard failure
//! - sink `error`: hard failure
//!
//! Hard failures go to the controller over an mpsc channel. The monitor
//! never touches connection state itself.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::sink::{SinkEvent, SinkSubscription, VideoSink};
use super::state::{Failure, FailureKind};
use crate::config::ConnectionConfig;

/// Health monitor configuration
#[derive(Debug, Clone, Copy)]
pub struct HealthMonitorConfig {
    /// Period of the stall check
    pub check_interval: Duration,
    /// Silence longer than this is a dead stream
    pub stall_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(5000),
            stall_timeout: Duration::from_millis(12000),
        }
    }
}

impl HealthMonitorConfig {
    pub fn from_connection(config: &ConnectionConfig) -> Self {
        Self {
            check_interval: config.health_check_interval(),
            stall_timeout: config.stream_stall_timeout(),
        }
    }
}

/// Playback health as rendered by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthState {
    pub healthy: bool,
    pub last_frame_at: Instant,
}

impl HealthState {
    fn fresh() -> Self {
        Self {
            healthy: true,
            last_frame_at: Instant::now(),
        }
    }
}

/// Hard failure detected by the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthFailure {
    /// No frame progress for `silent_for`
    Stalled { silent_for: Duration },
    /// Sink reported a playback error
    Playback(String),
}

impl From<HealthFailure> for Failure {
    fn from(f: HealthFailure) -> Self {
        match f {
            HealthFailure::Stalled { .. } => Failure::stalled(),
            HealthFailure::Playback(msg) => {
                Failure::new(FailureKind::Playback, format!("playback error: {}", msg))
            }
        }
    }
}

/// Health monitor for one tile
///
/// `start` and `stop` may be called any number of times; the monitor is
/// also stopped when dropped. The health watch channel survives restarts
/// so the owner can keep a single receiver.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    state_tx: watch::Sender<HealthState>,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig) -> Self {
        let (state_tx, _) = watch::channel(HealthState::fresh());
        Self {
            config,
            state_tx,
            task: None,
        }
    }

    /// Begin supervising `sink`; any previous run is stopped first
    ///
    /// The stall clock starts now: a freshly connected stream gets a full
    /// stall timeout to deliver its first frame. The returned receiver
    /// carries the hard failure of this run only.
    pub fn start(&mut self, sink: &dyn VideoSink) -> mpsc::Receiver<HealthFailure> {
        self.stop();

        self.state_tx.send_replace(HealthState::fresh());
        let (failures_tx, failures_rx) = mpsc::channel(1);
        let subscription = sink.subscribe();
        let task = tokio::spawn(supervise(
            self.config,
            subscription,
            self.state_tx.clone(),
            failures_tx,
        ));
        self.task = Some(task);
        debug!(
            "Health monitor started (check {:?}, stall timeout {:?})",
            self.config.check_interval, self.config.stall_timeout
        );
        failures_rx
    }

    /// Stop the periodic check and drop the sink subscription
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn state(&self) -> HealthState {
        *self.state_tx.borrow()
    }

    /// Receiver notified when `healthy` flips
    pub fn watch(&self) -> watch::Receiver<HealthState> {
        self.state_tx.subscribe()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn supervise(
    config: HealthMonitorConfig,
    mut subscription: SinkSubscription,
    state_tx: watch::Sender<HealthState>,
    failures: mpsc::Sender<HealthFailure>,
) {
    let mut ticker =
        tokio::time::interval_at(Instant::now() + config.check_interval, config.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sink_open = true;

    loop {
        tokio::select! {
            event = subscription.recv(), if sink_open => match event {
                Some(SinkEvent::Playing) | Some(SinkEvent::TimeUpdate) => {
                    // Only wake watchers when healthy flips
                    state_tx.send_if_modified(|s| {
                        let flipped = !s.healthy;
                        s.healthy = true;
                        s.last_frame_at = Instant::now();
                        flipped
                    });
                }
                Some(SinkEvent::Stalled) => {
                    state_tx.send_if_modified(|s| std::mem::replace(&mut s.healthy, false));
                }
                Some(SinkEvent::Error(msg)) => {
                    warn!("Playback error: {}", msg);
                    state_tx.send_if_modified(|s| std::mem::replace(&mut s.healthy, false));
                    let _ = failures.send(HealthFailure::Playback(msg)).await;
                    return;
                }
                None => {
                    // Sink went away; the stall clock still runs
                    sink_open = false;
                }
            },
            _ = ticker.tick() => {
                let silent_for = state_tx.borrow().last_frame_at.elapsed();
                if silent_for > config.stall_timeout {
                    warn!("No frame progress for {:?}, stream stalled", silent_for);
                    state_tx.send_if_modified(|s| std::mem::replace(&mut s.healthy, false));
                    let _ = failures.send(HealthFailure::Stalled { silent_for }).await;
                    return;
                }
            }
        }
    }
}
