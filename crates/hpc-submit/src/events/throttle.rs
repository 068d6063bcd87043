//! Emission-side rate limiting for high-frequency progress streams.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-key rate limiter for progress events.
///
/// A key is a task id or job name. `allow` returns true at most once
/// per interval per key; callers publishing a terminal transition must
/// bypass the throttle entirely (publish unconditionally, then
/// `clear_key`) so observers never show stale in-progress state after
/// completion. The map is guarded by a single lock and cleared when the
/// emitting component stops, bounding memory.
pub struct EventThrottle {
    interval: Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl EventThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Whether an event for `key` may be emitted now.
    ///
    /// Records the emission time when it returns true, so delivered
    /// events on one key are bounded by `window / interval + 1` in any
    /// window.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().expect("throttle map poisoned");
        match last.get(key) {
            Some(prev) if now.duration_since(*prev) < self.interval => false,
            _ => {
                last.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Forget one key (call after its terminal event).
    pub fn clear_key(&self, key: &str) {
        self.last.lock().expect("throttle map poisoned").remove(key);
    }

    /// Forget every key (call on component stop).
    pub fn clear(&self) {
        self.last.lock().expect("throttle map poisoned").clear();
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.last.lock().expect("throttle map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_emission_always_allowed() {
        let throttle = EventThrottle::new(Duration::from_secs(60));
        assert!(throttle.allow("task-1"));
        assert!(throttle.allow("task-2"));
    }

    #[test]
    fn test_burst_is_bounded() {
        let throttle = EventThrottle::new(Duration::from_secs(60));
        let allowed = (0..100).filter(|_| throttle.allow("task-1")).count();
        assert_eq!(allowed, 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let throttle = EventThrottle::new(Duration::from_secs(60));
        assert!(throttle.allow("a"));
        assert!(!throttle.allow("a"));
        assert!(throttle.allow("b"));
    }

    #[test]
    fn test_allows_again_after_interval() {
        let throttle = EventThrottle::new(Duration::from_millis(10));
        assert!(throttle.allow("a"));
        std::thread::sleep(Duration::from_millis(15));
        assert!(throttle.allow("a"));
    }

    #[test]
    fn test_clear_key_bounds_memory() {
        let throttle = EventThrottle::new(Duration::from_secs(60));
        throttle.allow("a");
        throttle.allow("b");
        assert_eq!(throttle.tracked_keys(), 2);
        throttle.clear_key("a");
        assert_eq!(throttle.tracked_keys(), 1);
        throttle.clear();
        assert_eq!(throttle.tracked_keys(), 0);
    }

    #[test]
    fn test_window_bound() {
        // For a stream emitted faster than the interval, deliveries in a
        // window are bounded by window/interval + 1.
        let interval = Duration::from_millis(20);
        let throttle = EventThrottle::new(interval);
        let window = Duration::from_millis(100);

        let start = Instant::now();
        let mut delivered = 0;
        while start.elapsed() < window {
            if throttle.allow("hot-key") {
                delivered += 1;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let bound = (window.as_millis() / interval.as_millis()) as usize + 1;
        assert!(
            delivered <= bound,
            "delivered {} events, bound is {}",
            delivered,
            bound
        );
    }
}
