//! Per-client admission control
//!
//! Counters use a fixed window: the first request from a client opens a window,
//! every request increments the count, and the count is reset when a request
//! observes that the stored window has expired.

use crate::config::Limits;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Key used for clients whose address could not be determined
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Process immediately
    Allow,
    /// Process after the throttle delay
    Throttle,
    /// Reject with 429
    Reject,
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    window_expiry: Instant,
}

/// Thresholds for the limiter
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub reject_threshold: u64,
    pub throttle_threshold: u64,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::from(&Limits::default())
    }
}

impl From<&Limits> for RateLimitConfig {
    fn from(limits: &Limits) -> Self {
        Self {
            reject_threshold: limits.rate_limit_threshold,
            throttle_threshold: limits.throttle_threshold,
            window: limits.window(),
        }
    }
}

/// Fixed-window counter store shared by every request in the coordinator
#[derive(Debug)]
pub struct RateLimiter {
    counters: DashMap<String, Counter>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            counters: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count a request from `client` and decide whether to admit it
    pub fn admit(&self, client: &str) -> Decision {
        self.admit_at(client, Instant::now())
    }

    /// Same as [`admit`](Self::admit) with an explicit clock reading
    pub fn admit_at(&self, client: &str, now: Instant) -> Decision {
        let count = {
            let mut entry = self.counters.entry(client.to_string()).or_insert(Counter {
                count: 0,
                window_expiry: now + self.config.window,
            });
            if now >= entry.window_expiry {
                entry.count = 0;
                entry.window_expiry = now + self.config.window;
            }
            entry.count += 1;
            entry.count
        };

        if count > self.config.reject_threshold {
            debug!(client, count, "Rate limit exceeded");
            Decision::Reject
        } else if count > self.config.throttle_threshold {
            debug!(client, count, "Throttling client");
            Decision::Throttle
        } else {
            Decision::Allow
        }
    }

    /// Current count for a client within its live window
    pub fn count(&self, client: &str) -> u64 {
        self.counters
            .get(client)
            .filter(|c| Instant::now() < c.window_expiry)
            .map(|c| c.count)
            .unwrap_or(0)
    }

    /// Drop counters whose window has expired, returning how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.counters.retain(|_, c| {
            let keep = now < c.window_expiry;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn tracked_clients(&self) -> usize {
        self.counters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default())
    }

    #[test]
    fn test_allow_then_throttle_then_reject() {
        let limiter = limiter();
        let now = Instant::now();

        for _ in 0..50 {
            assert_eq!(limiter.admit_at("1.2.3.4", now), Decision::Allow);
        }
        for _ in 0..50 {
            assert_eq!(limiter.admit_at("1.2.3.4", now), Decision::Throttle);
        }
        assert_eq!(limiter.admit_at("1.2.3.4", now), Decision::Reject);
    }

    #[test]
    fn test_window_reset_starts_fresh_count() {
        let limiter = limiter();
        let start = Instant::now();

        for _ in 0..101 {
            limiter.admit_at("client", start);
        }
        assert_eq!(limiter.admit_at("client", start), Decision::Reject);

        let later = start + Duration::from_secs(61);
        assert_eq!(limiter.admit_at("client", later), Decision::Allow);
        assert_eq!(limiter.count("client"), 1);
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..101 {
            limiter.admit_at("noisy", now);
        }
        assert_eq!(limiter.admit_at("noisy", now), Decision::Reject);
        assert_eq!(limiter.admit_at("quiet", now), Decision::Allow);
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn test_custom_thresholds() {
        let limiter = RateLimiter::new(RateLimitConfig {
            reject_threshold: 2,
            throttle_threshold: 1,
            window: Duration::from_secs(1),
        });
        let now = Instant::now();
        assert_eq!(limiter.admit_at(UNKNOWN_CLIENT, now), Decision::Allow);
        assert_eq!(limiter.admit_at(UNKNOWN_CLIENT, now), Decision::Throttle);
        assert_eq!(limiter.admit_at(UNKNOWN_CLIENT, now), Decision::Reject);
    }

    #[test]
    fn test_sweep_expired() {
        let limiter = RateLimiter::new(RateLimitConfig {
            reject_threshold: 100,
            throttle_threshold: 50,
            window: Duration::ZERO,
        });
        limiter.admit("a");
        limiter.admit("b");
        assert_eq!(limiter.sweep_expired(), 2);
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn test_sweep_concurrent_with_admits() {
        let limiter = std::sync::Arc::new(limiter());
        let clients: Vec<_> = (0..4)
            .map(|t| {
                let limiter = std::sync::Arc::clone(&limiter);
                std::thread::spawn(move || {
                    for i in 0..2_000 {
                        limiter.admit(&format!("10.{}.{}.{}", t, i / 256, i % 256));
                    }
                })
            })
            .collect();

        let mut swept = 0;
        while clients.iter().any(|h| !h.is_finished()) {
            swept += limiter.sweep_expired();
        }
        for client in clients {
            client.join().unwrap();
        }

        assert_eq!(swept, 0);
        assert_eq!(limiter.tracked_clients(), 8_000);
    }
}
