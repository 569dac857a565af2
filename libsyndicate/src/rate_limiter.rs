//! Per-account admission control for publish attempts
//!
//! Token bucket per (platform, account): bursts up to the bucket
//! capacity, refilled steadily at the platform's configured rate (e.g. a
//! Twitter-like 300 posts per 15 minutes with a burst of 10). Buckets
//! are created lazily on first use and cached for the process lifetime.
//! An optional rolling-day ceiling caps total volume regardless of
//! bucket state.
//!
//! [`RateLimiter::allow`] never blocks; [`RateLimiter::wait`] blocks
//! until a token is available or the caller's deadline elapses, without
//! side effects on timeout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::events::{Event, EventBus};

/// Granularity of the blocking wait loop.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Admission policy for one platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens refilled per window (e.g. 300)
    pub posts_per_window: u32,
    /// Window length in seconds (e.g. 900 for 15 minutes)
    pub window_secs: u64,
    /// Bucket capacity: the largest burst allowed
    pub burst: u32,
    /// Optional rolling-day ceiling across all bursts
    pub daily_cap: Option<u32>,
}

impl RateLimitConfig {
    fn tokens_per_second(&self) -> f64 {
        self.posts_per_window as f64 / self.window_secs.max(1) as f64
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    day_count: u32,
    day_start: DateTime<Utc>,
}

impl Bucket {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            tokens: config.burst as f64,
            last_refill: Instant::now(),
            day_count: 0,
            day_start: Utc::now(),
        }
    }

    fn refill(&mut self, config: &RateLimitConfig) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.tokens_per_second())
            .min(config.burst as f64);
        self.last_refill = now;

        // Day window rolls over relative to first use, not midnight
        let now_utc = Utc::now();
        if now_utc - self.day_start >= chrono::Duration::days(1) {
            self.day_count = 0;
            self.day_start = now_utc;
        }
    }

    /// Whether `n` tokens could be taken right now, without taking them.
    fn can_take(&self, config: &RateLimitConfig, n: u32) -> bool {
        if self.tokens < n as f64 {
            return false;
        }
        if let Some(cap) = config.daily_cap {
            if self.day_count + n > cap {
                return false;
            }
        }
        true
    }

    fn take(&mut self, n: u32) {
        self.tokens -= n as f64;
        self.day_count += n;
    }

    fn try_take(&mut self, config: &RateLimitConfig) -> bool {
        if !self.can_take(config, 1) {
            return false;
        }
        self.take(1);
        true
    }
}

/// Token-bucket rate limiter keyed by (platform, account).
pub struct RateLimiter {
    /// Platform-specific limits; platforms without an entry are unlimited
    limits: HashMap<String, RateLimitConfig>,
    buckets: Mutex<HashMap<(String, String), Bucket>>,
    events: EventBus,
}

impl RateLimiter {
    pub fn new(limits: HashMap<String, RateLimitConfig>, events: EventBus) -> Self {
        Self {
            limits,
            buckets: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Non-blocking admission check. Consumes a token and returns `true`
    /// when the attempt may proceed; emits a refusal event otherwise.
    /// Platforms without a configured limit are always admitted.
    pub async fn allow(&self, platform: &str, account_id: &str) -> bool {
        let config = match self.limits.get(platform) {
            Some(config) => config,
            None => return true,
        };

        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry((platform.to_string(), account_id.to_string()))
            .or_insert_with(|| Bucket::new(config));

        bucket.refill(config);
        if bucket.try_take(config) {
            true
        } else {
            debug!(platform, account_id, "Rate limit refused publish attempt");
            self.events.emit(Event::RateLimitRefused {
                platform: platform.to_string(),
                account_id: account_id.to_string(),
            });
            false
        }
    }

    /// Admission for a whole set of targets as one unit: every target
    /// gets a token, or none is consumed. A multi-target post publishes
    /// to all of its accounts in one attempt, so a refusal for one
    /// target must not burn tokens already granted to the others.
    ///
    /// Duplicate (platform, account) pairs each demand their own token.
    /// Emits a refusal event for the first target that cannot be
    /// admitted.
    pub async fn allow_all(&self, targets: &[(&str, &str)]) -> bool {
        let mut demand: HashMap<(String, String), u32> = HashMap::new();
        for (platform, account_id) in targets {
            if self.limits.contains_key(*platform) {
                *demand
                    .entry((platform.to_string(), account_id.to_string()))
                    .or_default() += 1;
            }
        }
        if demand.is_empty() {
            return true;
        }

        // One pass to check under the lock, one to consume; nothing is
        // taken unless every target admits.
        let mut buckets = self.buckets.lock().await;
        for ((platform, account_id), needed) in &demand {
            let config = &self.limits[platform];
            let bucket = buckets
                .entry((platform.clone(), account_id.clone()))
                .or_insert_with(|| Bucket::new(config));
            bucket.refill(config);
            if !bucket.can_take(config, *needed) {
                debug!(
                    platform = %platform,
                    account_id = %account_id,
                    "Rate limit refused publish attempt"
                );
                self.events.emit(Event::RateLimitRefused {
                    platform: platform.clone(),
                    account_id: account_id.clone(),
                });
                return false;
            }
        }
        for (key, needed) in demand {
            if let Some(bucket) = buckets.get_mut(&key) {
                bucket.take(needed);
            }
        }
        true
    }

    /// Block until a token is available or `timeout` elapses. Returns
    /// `true` if a token was consumed. A timeout has no side effects.
    pub async fn wait(&self, platform: &str, account_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.allow(platform, account_id).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(burst: u32, per_window: u32, window_secs: u64) -> HashMap<String, RateLimitConfig> {
        let mut map = HashMap::new();
        map.insert(
            "mastodon".to_string(),
            RateLimitConfig {
                posts_per_window: per_window,
                window_secs,
                burst,
                daily_cap: None,
            },
        );
        map
    }

    #[tokio::test]
    async fn test_burst_then_refusal() {
        let limiter = RateLimiter::new(limits(3, 300, 900), EventBus::new(10));
        for _ in 0..3 {
            assert!(limiter.allow("mastodon", "acct-1").await);
        }
        assert!(!limiter.allow("mastodon", "acct-1").await);
    }

    #[tokio::test]
    async fn test_unconfigured_platform_is_unlimited() {
        let limiter = RateLimiter::new(limits(1, 1, 900), EventBus::new(10));
        for _ in 0..50 {
            assert!(limiter.allow("bluesky", "acct-1").await);
        }
    }

    #[tokio::test]
    async fn test_accounts_have_independent_buckets() {
        let limiter = RateLimiter::new(limits(1, 300, 900), EventBus::new(10));
        assert!(limiter.allow("mastodon", "acct-1").await);
        assert!(!limiter.allow("mastodon", "acct-1").await);
        assert!(limiter.allow("mastodon", "acct-2").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_refills_over_time() {
        // 1 token per second, burst of 1
        let limiter = RateLimiter::new(limits(1, 60, 60), EventBus::new(10));
        assert!(limiter.allow("mastodon", "acct-1").await);
        assert!(!limiter.allow("mastodon", "acct-1").await);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(limiter.allow("mastodon", "acct-1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_burst() {
        let limiter = RateLimiter::new(limits(2, 60, 60), EventBus::new(10));
        tokio::time::advance(Duration::from_secs(3600)).await;

        assert!(limiter.allow("mastodon", "acct-1").await);
        assert!(limiter.allow("mastodon", "acct-1").await);
        assert!(!limiter.allow("mastodon", "acct-1").await);
    }

    #[tokio::test]
    async fn test_daily_cap_refuses_despite_tokens() {
        let mut map = HashMap::new();
        map.insert(
            "mastodon".to_string(),
            RateLimitConfig {
                posts_per_window: 300,
                window_secs: 900,
                burst: 10,
                daily_cap: Some(2),
            },
        );
        let limiter = RateLimiter::new(map, EventBus::new(10));

        assert!(limiter.allow("mastodon", "acct-1").await);
        assert!(limiter.allow("mastodon", "acct-1").await);
        // Tokens remain in the bucket, but the day ceiling is reached
        assert!(!limiter.allow("mastodon", "acct-1").await);
    }

    #[tokio::test]
    async fn test_allow_all_refusal_consumes_nothing() {
        let mut map = limits(1, 300, 900);
        map.insert(
            "bluesky".to_string(),
            RateLimitConfig {
                posts_per_window: 300,
                window_secs: 900,
                burst: 1,
                daily_cap: None,
            },
        );
        let limiter = RateLimiter::new(map, EventBus::new(10));

        // Exhaust bluesky, then ask for both platforms at once
        assert!(limiter.allow("bluesky", "acct-1").await);
        assert!(
            !limiter
                .allow_all(&[("mastodon", "acct-1"), ("bluesky", "acct-1")])
                .await
        );

        // The mastodon token was not burned by the refused pass
        assert!(limiter.allow("mastodon", "acct-1").await);
    }

    #[tokio::test]
    async fn test_allow_all_counts_duplicate_targets() {
        let limiter = RateLimiter::new(limits(1, 300, 900), EventBus::new(10));
        assert!(
            !limiter
                .allow_all(&[("mastodon", "acct-1"), ("mastodon", "acct-1")])
                .await
        );
        // Refusal left the single token in place
        assert!(limiter.allow_all(&[("mastodon", "acct-1")]).await);
    }

    #[tokio::test]
    async fn test_allow_all_admits_unconfigured_platforms() {
        let limiter = RateLimiter::new(limits(1, 300, 900), EventBus::new(10));
        for _ in 0..10 {
            assert!(
                limiter
                    .allow_all(&[("bluesky", "acct-1"), ("nostr", "acct-2")])
                    .await
            );
        }
    }

    #[tokio::test]
    async fn test_refusal_emits_event() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();
        let limiter = RateLimiter::new(limits(1, 300, 900), bus);

        assert!(limiter.allow("mastodon", "acct-1").await);
        assert!(!limiter.allow("mastodon", "acct-1").await);

        let event = receiver.recv().await.unwrap();
        assert!(matches!(
            event,
            Event::RateLimitRefused { platform, account_id }
                if platform == "mastodon" && account_id == "acct-1"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_until_token() {
        // 1 token per second
        let limiter = RateLimiter::new(limits(1, 60, 60), EventBus::new(10));
        assert!(limiter.allow("mastodon", "acct-1").await);

        // Paused clock auto-advances through the sleep, so the refill
        // arrives well inside the deadline.
        assert!(
            limiter
                .wait("mastodon", "acct-1", Duration::from_secs(5))
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        // Refill far slower than the deadline
        let limiter = RateLimiter::new(limits(1, 1, 86_400), EventBus::new(10));
        assert!(limiter.allow("mastodon", "acct-1").await);
        assert!(
            !limiter
                .wait("mastodon", "acct-1", Duration::from_millis(200))
                .await
        );
    }
}
