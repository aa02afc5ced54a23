//! Sliding-window rate limiting for the admission endpoints.
//!
//! Short tokens are guessable and every pending session occupies a slot in the
//! token space, so both approvals and session creation are counted per client
//! address over a rolling window.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// A rate limiter with a per-key attempt budget over a rolling window.
#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    /// key → timestamps of recent attempts
    entries: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Record an attempt for `key` if it is within budget.
    ///
    /// Returns `true` if allowed, `false` if rate-limited.
    pub fn check_and_record(&mut self, key: &str) -> bool {
        self.check_and_record_at(key, Instant::now())
    }

    fn check_and_record_at(&mut self, key: &str, now: Instant) -> bool {
        let window = self.window;
        let attempts = self.entries.entry(key.to_string()).or_default();
        attempts.retain(|t| now.saturating_duration_since(*t) < window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }
        attempts.push(now);
        true
    }

    /// Drop keys whose attempts have all aged out.
    pub fn gc(&mut self) {
        self.gc_at(Instant::now());
    }

    fn gc_at(&mut self, now: Instant) {
        let window = self.window;
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.saturating_duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}

/// Rate limiters used by the HTTP surface.
#[derive(Debug)]
pub struct ServerRateLimits {
    /// Token approval attempts per client address.
    pub approve: RateLimiter,
    /// Pending session creations per client address.
    pub create: RateLimiter,
}

impl ServerRateLimits {
    pub fn new(approve_per_minute: u32, create_per_minute: u32) -> Self {
        Self {
            approve: RateLimiter::new(approve_per_minute, Duration::from_secs(60)),
            create: RateLimiter::new(create_per_minute, Duration::from_secs(60)),
        }
    }

    pub fn check_approve(&mut self, ip: &IpAddr) -> bool {
        self.approve.check_and_record(&ip.to_string())
    }

    pub fn check_create(&mut self, ip: &IpAddr) -> bool {
        self.create.check_and_record(&ip.to_string())
    }

    pub fn gc(&mut self) {
        self.approve.gc();
        self.create.gc();
    }
}
