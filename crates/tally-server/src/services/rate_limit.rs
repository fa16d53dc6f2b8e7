//! Per-client fixed-window rate limiting for the write route

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tally_core::ports::Clock;

struct Window {
    started: DateTime<Utc>,
    count: u32,
}

pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    /// `max_requests == 0` disables limiting
    pub fn new(max_requests: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_requests,
            window,
            clock,
            windows: DashMap::new(),
        }
    }

    /// Consume a slot for `client_id`. Returns false when the window is spent.
    pub fn check(&self, client_id: &str) -> bool {
        if self.max_requests == 0 {
            return true;
        }

        let now = self.clock.now();
        let mut window = self
            .windows
            .entry(client_id.to_string())
            .or_insert(Window {
                started: now,
                count: 0,
            });

        if now - window.started >= self.window {
            window.started = now;
            window.count = 0;
        }
        if window.count >= self.max_requests {
            return false;
        }
        window.count += 1;
        true
    }

    /// Drop windows that have fully elapsed
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now - window.started < self.window);
        before - self.windows.len()
    }
}
