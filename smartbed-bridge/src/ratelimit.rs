//! Keyed de-dup window for noisy failure messages.
//!
//! A proxy that flaps can produce the same warning hundreds of times a
//! minute; callers gate those through `should_log` with a stable key.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct RateLimitedLog {
    window: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl RateLimitedLog {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// True when `key` has not been logged within the window. Marks the key.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        // opportunistic cleanup so the map does not grow forever
        if seen.len() > 256 {
            let window = self.window;
            seen.retain(|_, at| now.duration_since(*at) < window);
        }
        match seen.get(key) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                seen.insert(key.to_string(), now);
                true
            }
        }
    }
}

impl Default for RateLimitedLog {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedups_within_window() {
        let limiter = RateLimitedLog::new(Duration::from_secs(60));
        assert!(limiter.should_log("proxy:10.0.0.50"));
        assert!(!limiter.should_log("proxy:10.0.0.50"));
        assert!(limiter.should_log("proxy:10.0.0.51"));
    }

    #[test]
    fn reopens_after_window() {
        let limiter = RateLimitedLog::new(Duration::from_millis(0));
        assert!(limiter.should_log("k"));
        assert!(limiter.should_log("k"));
    }
}
