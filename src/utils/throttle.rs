//! Log throttling for repeated tile failures
//!
//! A wall of cameras pointed at a dead media server fails every tile in
//! lockstep. The throttler keeps one warning per key per interval and
//! counts what it swallowed so the next logged line can say so.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Entry {
    last_logged: Instant,
    suppressed: u32,
}

/// Per-key log throttler
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

/// Outcome of a throttle check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    /// Log now; carries how many messages were dropped since the last one
    Log { suppressed: u32 },
    /// Drop this message
    Suppress,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Check whether a message for `key` should be logged now
    pub fn check(&self, key: &str) -> Throttle {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                Throttle::Suppress
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                *entry = Entry {
                    last_logged: now,
                    suppressed: 0,
                };
                Throttle::Log { suppressed }
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Throttle::Log { suppressed: 0 }
            }
        }
    }

    /// Shorthand for `check(key) != Suppress`
    pub fn should_log(&self, key: &str) -> bool {
        !matches!(self.check(key), Throttle::Suppress)
    }

    /// Forget `key`, e.g. after the tile recovered
    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Drop every key starting with `prefix`
    pub fn clear_prefix(&self, prefix: &str) {
        self.entries.lock().retain(|k, _| !k.starts_with(prefix));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_throttling_counts_suppressed() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert_eq!(throttler.check("tile-1:signaling"), Throttle::Log { suppressed: 0 });
        assert_eq!(throttler.check("tile-1:signaling"), Throttle::Suppress);
        assert_eq!(throttler.check("tile-1:signaling"), Throttle::Suppress);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(throttler.check("tile-1:signaling"), Throttle::Log { suppressed: 2 });
    }

    #[test]
    fn test_different_keys() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("tile-1:ice"));
        assert!(throttler.should_log("tile-2:ice"));
        assert!(!throttler.should_log("tile-1:ice"));
        assert!(!throttler.should_log("tile-2:ice"));
    }

    #[test]
    fn test_clear_prefix() {
        let throttler = LogThrottler::with_secs(10);
        throttler.should_log("tile-1:ice");
        throttler.should_log("tile-1:stall");
        throttler.should_log("tile-2:ice");
        assert_eq!(throttler.len(), 3);

        throttler.clear_prefix("tile-1:");
        assert_eq!(throttler.len(), 1);
        assert!(throttler.should_log("tile-1:ice"));

        throttler.clear("tile-2:ice");
        assert!(throttler.should_log("tile-2:ice"));
    }

    #[test]
    fn test_default_is_empty() {
        let throttler = LogThrottler::default();
        assert!(throttler.is_empty());
        assert!(throttler.should_log("x"));
        assert!(!throttler.is_empty());
    }
}
