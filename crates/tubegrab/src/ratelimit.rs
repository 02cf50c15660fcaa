use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const UNKNOWN_CLIENT: &str = "unknown";

/// Client key from proxy headers: first `X-Forwarded-For` entry, then
/// `X-Real-IP`, then a shared `"unknown"` bucket
pub fn client_key(forwarded_for: Option<&str>, real_ip: Option<&str>) -> String {
    forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| real_ip.map(str::trim).filter(|v| !v.is_empty()))
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request limiter
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request from `key`. `Err` carries the time until the
    /// client's window resets.
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<(), Duration> {
        let mut windows = self.windows.lock();
        let window = self.window;
        windows.retain(|_, w| now.duration_since(w.started) < window);

        let entry = windows
            .entry(key.to_string())
            .or_insert(Window { started: now, count: 0 });

        if entry.count >= self.max_requests {
            let elapsed = now.duration_since(entry.started);
            return Err(window.saturating_sub(elapsed));
        }
        entry.count += 1;
        Ok(())
    }

    /// Clients with an open window
    pub fn tracked_clients(&self) -> usize {
        self.windows.lock().len()
    }
}
