//! Adaptive per-identity delay driven by provider rate-limit headers.
//!
//! Each response reports how much of the window is used and when it resets.
//! From that the limiter derives how long one request's worth of budget
//! takes to regenerate, decays the recorded usage by the time elapsed since
//! the sample, and turns utilization into a delay with a fifth-power curve:
//! near zero at moderate use, climbing steeply close to the limit.
//!
//! State is process-local. Several replicas can still exceed the provider's
//! limit together. Each sample lives until its window resets, after which the
//! recorded usage has fully decayed and the identity is forgotten.

use std::time::{Duration, Instant};

use moka::sync::Cache;
use moka::Expiry;
use reqwest::header::HeaderMap;
use tracing::debug;

use crate::now_millis;

/// Delays are rounded down to a multiple of this many milliseconds.
pub const DELAY_STEP_MS: u64 = 200;

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

/// Identities tracked per limiter before the least useful ones are evicted.
pub const DEFAULT_MAX_TRACKED_IDS: u64 = 10_000;

/// Last rate-limit sample for one identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSample {
    pub limit: i64,
    pub remaining: i64,
    pub used: i64,
    pub reset_at_ms: i64,
    /// Milliseconds for one request's worth of budget to regenerate.
    pub until_next_refresh_ms: f64,
    pub sampled_at_ms: i64,
}

/// Delay for a sample at `now_ms`.
pub fn calculate_delay(sample: &RateLimitSample, now_ms: i64) -> u64 {
    let per_request = sample.until_next_refresh_ms;
    let elapsed = (now_ms - sample.sampled_at_ms).max(0) as f64;
    let corrected_used = (sample.used as f64 - elapsed / per_request).max(0.0).ceil();

    let utilization = if sample.limit <= 0 {
        1.0
    } else {
        corrected_used / sample.limit as f64
    };

    let raw = (per_request * utilization.powi(5)).max(0.0).min(per_request);
    let raw = raw as u64;
    raw - raw % DELAY_STEP_MS
}

impl RateLimitSample {
    /// Time from the sample until its window resets.
    fn window(&self) -> Duration {
        Duration::from_millis((self.reset_at_ms - self.sampled_at_ms).max(0) as u64)
    }
}

/// Expires each sample when its window resets.
struct WindowExpiry;

impl Expiry<String, RateLimitSample> for WindowExpiry {
    fn expire_after_create(
        &self,
        _id: &String,
        sample: &RateLimitSample,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(sample.window())
    }

    fn expire_after_update(
        &self,
        _id: &String,
        sample: &RateLimitSample,
        _updated_at: Instant,
        _remaining: Option<Duration>,
    ) -> Option<Duration> {
        Some(sample.window())
    }
}

/// Per-identity rate limiter.
pub struct RateLimiter {
    samples: Cache<String, RateLimitSample>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_TRACKED_IDS)
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limiter tracking at most `max_ids` identities.
    pub fn with_capacity(max_ids: u64) -> Self {
        let samples = Cache::builder()
            .max_capacity(max_ids)
            .expire_after(WindowExpiry)
            .build();
        Self { samples }
    }

    /// Record a sample taken now.
    pub fn update(&self, id: &str, limit: i64, remaining: i64, reset_at_ms: i64) {
        self.update_at(id, limit, remaining, reset_at_ms, now_millis());
    }

    /// Record a sample taken at `now_ms`.
    pub fn update_at(&self, id: &str, limit: i64, remaining: i64, reset_at_ms: i64, now_ms: i64) {
        let used = limit - remaining;
        let until_next_refresh_ms = (reset_at_ms - now_ms).max(1) as f64 / used.max(1) as f64;

        let sample = RateLimitSample {
            limit,
            remaining,
            used,
            reset_at_ms,
            until_next_refresh_ms,
            sampled_at_ms: now_ms,
        };

        self.samples.insert(id.to_string(), sample);
    }

    /// Record the rate-limit headers of a provider response.
    ///
    /// Responses without a complete, numeric header set leave the state alone.
    pub fn update_from_headers(&self, id: &str, headers: &HeaderMap) {
        let read = |name: &str| -> Option<i64> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<i64>().ok())
        };

        match (read(LIMIT_HEADER), read(REMAINING_HEADER), read(RESET_HEADER)) {
            (Some(limit), Some(remaining), Some(reset_secs)) => {
                self.update(id, limit, remaining, reset_secs.saturating_mul(1000));
            }
            _ => debug!("Response carried no usable rate-limit headers"),
        }
    }

    /// Current sample for an identity.
    pub fn sample(&self, id: &str) -> Option<RateLimitSample> {
        self.samples.get(id)
    }

    /// Delay in milliseconds before the next call for `id`.
    pub fn delay(&self, id: &str) -> u64 {
        self.delay_at(id, now_millis())
    }

    /// Delay in milliseconds before the next call for `id`, evaluated at `now_ms`.
    pub fn delay_at(&self, id: &str, now_ms: i64) -> u64 {
        self.sample(id)
            .map(|sample| calculate_delay(&sample, now_ms))
            .unwrap_or(0)
    }

    /// Pause the caller for the current delay.
    pub async fn wait(&self, id: &str) {
        let delay = self.delay(id);
        if delay > 0 {
            debug!(delay_ms = delay, "Throttling provider call");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
}
