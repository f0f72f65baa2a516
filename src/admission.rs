//! Admission control. A client may issue at most `max_requests` admitted
//! requests inside any trailing window of `window` length; the window is
//! recomputed on every check.
//!
//! State is per process. Multiple instances enforce their quotas
//! independently; a shared backend can be plugged in behind [`RateLimiter`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ahash::RandomState;
use axum::http::HeaderMap;
use dashmap::DashMap;

pub const DEFAULT_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_MAX_REQUESTS: usize = 10;

/// Admission decision for a client key. Implementations never fail: an
/// internal problem must resolve to a decision.
pub trait RateLimiter: Send + Sync {
    fn admit(&self, client_id: &str) -> bool;
}

/// In-memory sliding window keyed by client id.
pub struct SlidingWindowLimiter {
    window: Duration,
    max_requests: usize,
    entries: DashMap<String, VecDeque<Instant>, RandomState>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            entries: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Admission check against an explicit clock reading.
    pub fn admit_at(&self, client_id: &str, now: Instant) -> bool {
        let mut entry = self.entries.entry(client_id.to_string()).or_default();
        let stamps = entry.value_mut();
        // Timestamps are appended in order, so expired ones sit at the front.
        while let Some(oldest) = stamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }
        if stamps.len() >= self.max_requests {
            return false;
        }
        stamps.push_back(now);
        true
    }

    /// Number of tracked client keys.
    pub fn tracked_clients(&self) -> usize {
        self.entries.len()
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_WINDOW_MS),
            DEFAULT_MAX_REQUESTS,
        )
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn admit(&self, client_id: &str) -> bool {
        self.admit_at(client_id, Instant::now())
    }
}

/// Resolve the client key from proxy headers: first hop of
/// `x-forwarded-for`, then `x-real-ip`, then `"unknown"`.
pub fn client_id(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown")
        .to_string()
}
