//! Sliding-window rate limiting keyed by client address.
//!
//! In-memory and single-process. Every admission decision takes the same
//! mutex, so concurrent check-then-record sequences cannot interleave.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    history: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a request from `client_key` at `now` if it fits in the window.
    ///
    /// Expired timestamps are swept for every key first. A rejected request is
    /// not recorded, so it does not extend the client's penalty.
    pub fn admit(&self, client_key: &str, now: Instant) -> bool {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());

        let window = self.window;
        history.retain(|_, stamps| {
            while let Some(oldest) = stamps.front() {
                if now.saturating_duration_since(*oldest) >= window {
                    stamps.pop_front();
                } else {
                    break;
                }
            }
            !stamps.is_empty()
        });

        let stamps = history.entry(client_key.to_string()).or_default();
        if stamps.len() >= self.max_requests {
            debug!(
                "RateLimiter: rejecting {} ({} requests in {:?})",
                client_key,
                stamps.len(),
                window
            );
            return false;
        }
        stamps.push_back(now);
        true
    }
}
