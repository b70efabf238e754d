//! Video sink: the rendering surface a tile's peer writes into
//!
//! The sink is supplied by the host and outlives sessions. A peer attaches
//! the received track; the sink turns media arrival into playback signals
//! (`playing`, `time progressed`, `stalled`, `error`) that the health
//! monitor subscribes to.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use webrtc::track::track_remote::TrackRemote;

/// Sink event channel capacity
const SINK_EVENT_CAPACITY: usize = 64;

/// Minimum spacing of `TimeUpdate` signals while frames flow
const TIME_UPDATE_INTERVAL: Duration = Duration::from_millis(250);

/// Playback signal emitted by a sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// Media started (or resumed after a stall)
    Playing,
    /// Playback position advanced
    TimeUpdate,
    /// Media stopped arriving; soft signal
    Stalled,
    /// Playback failed
    Error(String),
}

/// Listener registration on a sink
///
/// Dropping the subscription unregisters the listener.
pub struct SinkSubscription {
    rx: broadcast::Receiver<SinkEvent>,
}

impl SinkSubscription {
    /// Next event; `None` once the sink is gone
    ///
    /// A listener that fell behind skips to the newest events; liveness
    /// only cares about the latest signal.
    pub async fn recv(&mut self) -> Option<SinkEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Sink listener lagged, skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Fan-out of sink events to listeners
#[derive(Clone)]
pub struct SinkEventHub {
    tx: broadcast::Sender<SinkEvent>,
}

impl SinkEventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SINK_EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: SinkEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> SinkSubscription {
        SinkSubscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SinkEventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Rendering surface owned by the host
///
/// Only one track is attached at a time. `attach` returns a generation
/// number; `detach` with a stale generation is a no-op so a closing peer
/// cannot detach its successor's media.
pub trait VideoSink: Send + Sync {
    /// Attach a received track, replacing any previous one
    fn attach(&self, track: Arc<TrackRemote>) -> u64;

    /// Detach the track attached under `generation`
    fn detach(&self, generation: u64) -> bool;

    /// Register a playback listener
    fn subscribe(&self) -> SinkSubscription;

    /// Whether a track is attached right now
    fn is_attached(&self) -> bool;
}

/// Counters kept by `RtpVideoSink`
#[derive(Debug, Default)]
pub struct SinkStats {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    pub frames: AtomicU64,
}

/// Snapshot of `SinkStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStatsSnapshot {
    pub packets: u64,
    pub bytes: u64,
    pub frames: u64,
}

struct Attachment {
    generation: u64,
    track_id: String,
    reader: JoinHandle<()>,
}

/// Headless sink that consumes RTP from the attached track
///
/// Derives playback signals from packet flow:
/// - first packet: `Playing`
/// - advancing RTP timestamp: `TimeUpdate` (at most every 250 ms)
/// - no packet for `stall_gap`: `Stalled`, then `Playing` when media resumes
/// - read error: `Error`
pub struct RtpVideoSink {
    name: String,
    events: SinkEventHub,
    stall_gap: Duration,
    next_generation: AtomicU64,
    current: Mutex<Option<Attachment>>,
    stats: Arc<SinkStats>,
}

impl RtpVideoSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_stall_gap(name, Duration::from_secs(2))
    }

    pub fn with_stall_gap(name: impl Into<String>, stall_gap: Duration) -> Self {
        Self {
            name: name.into(),
            events: SinkEventHub::new(),
            stall_gap,
            next_generation: AtomicU64::new(1),
            current: Mutex::new(None),
            stats: Arc::new(SinkStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            packets: self.stats.packets.load(Ordering::Relaxed),
            bytes: self.stats.bytes.load(Ordering::Relaxed),
            frames: self.stats.frames.load(Ordering::Relaxed),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.events.listener_count()
    }

    fn spawn_reader(&self, track: Arc<TrackRemote>) -> JoinHandle<()> {
        let events = self.events.clone();
        let stats = self.stats.clone();
        let stall_gap = self.stall_gap;
        let name = self.name.clone();

        tokio::spawn(async move {
            let mut last_timestamp: Option<u32> = None;
            let mut last_update = Instant::now();
            let mut stalled = false;

            loop {
                match tokio::time::timeout(stall_gap, track.read_rtp()).await {
                    Err(_) => {
                        if !stalled {
                            debug!("Sink {}: no media for {:?}", name, stall_gap);
                            stalled = true;
                            events.emit(SinkEvent::Stalled);
                        }
                    }
                    Ok(Ok((packet, _))) => {
                        stats.packets.fetch_add(1, Ordering::Relaxed);
                        stats
                            .bytes
                            .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);

                        let ts = packet.header.timestamp;
                        match last_timestamp {
                            None => {
                                stats.frames.fetch_add(1, Ordering::Relaxed);
                                events.emit(SinkEvent::Playing);
                                last_update = Instant::now();
                            }
                            Some(prev) if prev != ts => {
                                stats.frames.fetch_add(1, Ordering::Relaxed);
                                if stalled {
                                    events.emit(SinkEvent::Playing);
                                    last_update = Instant::now();
                                } else if last_update.elapsed() >= TIME_UPDATE_INTERVAL {
                                    events.emit(SinkEvent::TimeUpdate);
                                    last_update = Instant::now();
                                }
                            }
                            Some(_) => {}
                        }
                        stalled = false;
                        last_timestamp = Some(ts);
                    }
                    Ok(Err(e)) => {
                        debug!("Sink {}: track read ended: {}", name, e);
                        events.emit(SinkEvent::Error(format!("track read failed: {}", e)));
                        break;
                    }
                }
            }
        })
    }
}

impl VideoSink for RtpVideoSink {
    fn attach(&self, track: Arc<TrackRemote>) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let track_id = track.id();
        let reader = self.spawn_reader(track);

        let previous = self.current.lock().replace(Attachment {
            generation,
            track_id: track_id.clone(),
            reader,
        });
        if let Some(previous) = previous {
            debug!(
                "Sink {}: replacing track {} (gen {})",
                self.name, previous.track_id, previous.generation
            );
            previous.reader.abort();
        }

        info!("Sink {}: attached track {} (gen {})", self.name, track_id, generation);
        generation
    }

    fn detach(&self, generation: u64) -> bool {
        let mut current = self.current.lock();
        match current.as_ref() {
            Some(a) if a.generation == generation => {
                if let Some(a) = current.take() {
                    a.reader.abort();
                    debug!("Sink {}: detached track {}", self.name, a.track_id);
                }
                true
            }
            _ => false,
        }
    }

    fn subscribe(&self) -> SinkSubscription {
        self.events.subscribe()
    }

    fn is_attached(&self) -> bool {
        self.current.lock().is_some()
    }
}

impl Drop for RtpVideoSink {
    fn drop(&mut self) {
        if let Some(a) = self.current.get_mut().take() {
            a.reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hub_fan_out() {
        let hub = SinkEventHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.listener_count(), 2);

        hub.emit(SinkEvent::Playing);
        hub.emit(SinkEvent::Error("decode".to_string()));

        assert_eq!(a.recv().await, Some(SinkEvent::Playing));
        assert_eq!(b.recv().await, Some(SinkEvent::Playing));
        assert_eq!(a.recv().await, Some(SinkEvent::Error("decode".to_string())));

        drop(a);
        drop(b);
        assert_eq!(hub.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_skips_lag() {
        let hub = SinkEventHub::new();
        let mut sub = hub.subscribe();

        for _ in 0..(SINK_EVENT_CAPACITY + 10) {
            hub.emit(SinkEvent::TimeUpdate);
        }
        hub.emit(SinkEvent::Stalled);

        let mut last = None;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(10), sub.recv()).await
        {
            last = Some(event);
        }
        assert_eq!(last, Some(SinkEvent::Stalled));
    }

    #[tokio::test]
    async fn test_subscription_ends_with_hub() {
        let hub = SinkEventHub::new();
        let mut sub = hub.subscribe();
        drop(hub);
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn test_rtp_sink_detach_without_track() {
        let sink = RtpVideoSink::new("gate");
        assert!(!sink.is_attached());
        assert!(!sink.detach(1));
        assert_eq!(sink.stats(), SinkStatsSnapshot::default());
        assert_eq!(sink.name(), "gate");
    }
}
