use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Sliding-window limiter for inbound client messages, one window per
/// connection.
pub struct RateLimiter {
    max_messages: usize,
    window: Duration,
    windows: Mutex<HashMap<Uuid, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Allow at most `max_messages` within any `window`.
    pub fn new(max_messages: usize, window: Duration) -> Self {
        Self {
            max_messages,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record one message for `connection_id`.
    /// Returns `true` if allowed, `false` if rate limited. Rejected messages
    /// do not count against the window.
    pub fn check(&self, connection_id: Uuid) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let hits = windows.entry(connection_id).or_default();

        while let Some(&oldest) = hits.front() {
            if now.duration_since(oldest) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if hits.len() < self.max_messages {
            hits.push_back(now);
            true
        } else {
            false
        }
    }

    /// Forget a closed connection.
    pub fn remove(&self, connection_id: Uuid) {
        self.windows.lock().remove(&connection_id);
    }

    pub fn tracked(&self) -> usize {
        self.windows.lock().len()
    }
}
